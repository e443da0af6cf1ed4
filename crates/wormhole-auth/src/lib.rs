//! Client key authorization
//!
//! The handshake proves which key a client holds. An authorizer decides
//! whether that key may open a tunnel and which backend it belongs to.

pub mod allowlist;
pub mod authorizer;

pub use allowlist::KeyAllowlist;
pub use authorizer::{AllowAnyKey, AuthError, Authorization, PeerAuthorizer};

// Re-export useful types
pub use async_trait::async_trait;
pub use wormhole_transport::PeerIdentity;
