//! Stream multiplexing over a single byte stream
//!
//! A [`Multiplexer`] wraps one ordered, reliable transport (TCP, TLS, an
//! in-memory duplex...) and exposes many independent [`MuxStream`]s on top of
//! it. Each stream implements `AsyncRead + AsyncWrite`, so it can be handed to
//! anything that speaks tokio I/O.

mod multiplexer;
mod stream;

pub use multiplexer::Multiplexer;
pub use stream::MuxStream;

use std::time::Duration;
use thiserror::Error;
use wormhole_proto::StreamId;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Multiplexer closed")]
    Closed,

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    #[error("No available stream IDs")]
    NoAvailableStreamIds,
}

/// Which end of the physical connection we are
///
/// Clients allocate odd stream IDs and servers even ones, so both sides can
/// open streams without coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `stream_id` belongs to the ID space this side allocates from
    fn owns(self, stream_id: StreamId) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id % 2 == 0,
        }
    }
}

/// Multiplexer tuning
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest payload put in a single data frame
    pub max_frame_payload: usize,

    /// Remote-opened streams waiting for `accept_stream`
    pub accept_backlog: usize,

    /// Bytes a stream may hold unread before the peer must stop sending
    ///
    /// Granted to the peer as send credit and handed back as the reader
    /// consumes data. A peer overrunning it gets the stream reset.
    pub max_receive_buffer: usize,

    /// How long `close` waits for queued frames to reach the transport
    pub close_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 32 * 1024,
            accept_backlog: 256,
            max_receive_buffer: 4 * 1024 * 1024,
            close_timeout: Duration::from_secs(1),
        }
    }
}
