//! Server and session error types

use crate::heartbeat::HeartbeatError;
use crate::registry::RegistryError;
use std::io;
use thiserror::Error;
use wormhole_auth::AuthError;
use wormhole_mux::MuxError;
use wormhole_proto::CodecError;
use wormhole_transport::HandshakeError;

/// Why a session failed or ended
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Client did not open a control stream")]
    NoControlStream,

    #[error("Authorization failed: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Control stream error: {0}")]
    Control(#[from] CodecError),

    #[error("Client hello timed out")]
    HelloTimeout,

    #[error("Unexpected control message: {0}")]
    UnexpectedMessage(String),

    #[error("Unsupported protocol version {actual} (expected {expected})")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Failed to bind endpoint: {0}")]
    Bind(io::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Heartbeat failed: {0}")]
    Heartbeat(#[from] HeartbeatError),

    #[error("Endpoint accept failed: {0}")]
    Accept(io::Error),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Session closed")]
    Closed,

    #[error("Session task failed: {0}")]
    Task(String),
}

/// Server-level errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid server key: {0}")]
    InvalidKey(#[from] HandshakeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
