//! Wormhole Protocol Definitions
//!
//! This crate defines the wire-level pieces shared by the tunnel server and its
//! clients: multiplexer frames, the control-stream messages exchanged during
//! session setup, and the heartbeat tokens.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use frame::{Frame, FrameCodec, FrameError, FrameFlags, FrameType, StreamId};
pub use messages::{ControlMessage, Release};

/// Protocol version announced in the client hello
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload accepted on the wire (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Heartbeat request sent by the initiator
pub const PING: &[u8; 4] = b"ping";

/// Heartbeat answer sent by the responder
pub const PONG: &[u8; 4] = b"pong";
