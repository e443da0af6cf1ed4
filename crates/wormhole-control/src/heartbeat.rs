//! Liveness probing on the control stream
//!
//! The wire format is deliberately bare: the initiator writes the four bytes
//! `ping`, the responder answers with the four bytes `pong`. There is no
//! framing, so both sides read exactly four bytes per message.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use wormhole_proto::{PING, PONG};

/// Heartbeat timings
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Quiet period before the first ping
    pub startup_delay: Duration,
    /// How long the initiator waits for each pong
    pub read_timeout: Duration,
    /// Pause between a pong and the next ping
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(1),
        }
    }
}

/// Heartbeat errors
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("Heartbeat I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No pong within {0:?}")]
    Timeout(Duration),

    #[error("Expected pong, got {:?}", String::from_utf8_lossy(.0))]
    UnexpectedResponse([u8; 4]),

    #[error("Expected ping, got {:?}", String::from_utf8_lossy(.0))]
    UnexpectedRequest([u8; 4]),
}

/// Ping the peer until something goes wrong
///
/// Only returns on failure: an I/O error (passed through untouched), a
/// missing pong or a pong that is not `pong`.
pub async fn initiate<S>(stream: &mut S, config: &HeartbeatConfig) -> HeartbeatError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::sleep(config.startup_delay).await;

    loop {
        if let Err(e) = send(stream, PING).await {
            return e.into();
        }

        let mut buf = [0u8; 4];
        match tokio::time::timeout(config.read_timeout, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return e.into(),
            Err(_) => return HeartbeatError::Timeout(config.read_timeout),
        }
        if &buf != PONG {
            return HeartbeatError::UnexpectedResponse(buf);
        }
        trace!("Heartbeat pong received");

        tokio::time::sleep(config.interval).await;
    }
}

/// Answer pings until something goes wrong
///
/// Reads carry no deadline: a silent initiator keeps the responder waiting.
pub async fn respond<S>(stream: &mut S) -> HeartbeatError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut buf = [0u8; 4];
        if let Err(e) = stream.read_exact(&mut buf).await {
            return e.into();
        }
        if &buf != PING {
            return HeartbeatError::UnexpectedRequest(buf);
        }

        if let Err(e) = send(stream, PONG).await {
            return e.into();
        }
    }
}

async fn send<S>(stream: &mut S, token: &[u8; 4]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(token).await?;
    stream.flush().await
}
