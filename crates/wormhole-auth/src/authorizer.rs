//! Authorizer trait for pluggable key policies

use async_trait::async_trait;
use thiserror::Error;
use wormhole_transport::PeerIdentity;

/// Outcome of a successful authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Backend the client's tunnel serves, recorded with the session
    pub backend_id: String,
}

impl Authorization {
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
        }
    }
}

/// Authorization errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid authorized keys entry on line {line}: {reason}")]
    InvalidEntry { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Authorization policy trait
///
/// Implement this trait to decide which client keys may open tunnels.
///
/// # Example: single trusted key
///
/// ```ignore
/// use wormhole_auth::{async_trait, AuthError, Authorization, PeerAuthorizer, PeerIdentity};
///
/// struct SingleKey(String);
///
/// #[async_trait]
/// impl PeerAuthorizer for SingleKey {
///     async fn authorize(&self, peer: &PeerIdentity) -> Result<Authorization, AuthError> {
///         if peer.fingerprint == self.0 {
///             Ok(Authorization::new("default"))
///         } else {
///             Err(AuthError::Unauthorized(peer.fingerprint.clone()))
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait PeerAuthorizer: Send + Sync {
    async fn authorize(&self, peer: &PeerIdentity) -> Result<Authorization, AuthError>;
}

/// Accepts every key; the backend ID is the key fingerprint
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAnyKey;

#[async_trait]
impl PeerAuthorizer for AllowAnyKey {
    async fn authorize(&self, peer: &PeerIdentity) -> Result<Authorization, AuthError> {
        Ok(Authorization::new(peer.fingerprint.clone()))
    }
}
