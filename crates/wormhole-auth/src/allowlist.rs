//! Fixed set of authorized client keys
//!
//! File format, one key per line:
//!
//! ```text
//! # fingerprint                                      backend
//! SHA256:7Yk0cXHq0e9GxU1Y6bKQ0m8yNnJtq4Yzq7m0yW7o5hE  billing-api
//! SHA256:Vb6w4o4pT0o3l2Ckq6E1v8d4yW2kq0C8pQy5x1uWm1s
//! ```
//!
//! A key without a backend name is its own backend.

use crate::authorizer::{AuthError, Authorization, PeerAuthorizer};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use tracing::{debug, info};
use wormhole_transport::PeerIdentity;

const FINGERPRINT_PREFIX: &str = "SHA256:";

/// Keys allowed to open tunnels, mapped to their backend IDs
#[derive(Debug, Default)]
pub struct KeyAllowlist {
    keys: DashMap<String, String>,
}

impl KeyAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the authorized keys format
    pub fn parse(contents: &str) -> Result<Self, AuthError> {
        let allowlist = Self::new();

        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let fingerprint = fields.next().unwrap_or_default();
            if !fingerprint.starts_with(FINGERPRINT_PREFIX) || fingerprint.len() == FINGERPRINT_PREFIX.len() {
                return Err(AuthError::InvalidEntry {
                    line: index + 1,
                    reason: format!("expected a {}<base64> fingerprint", FINGERPRINT_PREFIX),
                });
            }

            let backend_id = fields.next().unwrap_or(fingerprint);
            if fields.next().is_some() {
                return Err(AuthError::InvalidEntry {
                    line: index + 1,
                    reason: "trailing fields".to_string(),
                });
            }

            allowlist.insert(fingerprint, backend_id);
        }

        Ok(allowlist)
    }

    /// Load an authorized keys file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let allowlist = Self::parse(&std::fs::read_to_string(path)?)?;
        info!("Loaded {} authorized keys from {}", allowlist.len(), path.display());
        Ok(allowlist)
    }

    pub fn insert(&self, fingerprint: impl Into<String>, backend_id: impl Into<String>) {
        self.keys.insert(fingerprint.into(), backend_id.into());
    }

    /// Revoke a key; sessions already established are not affected
    pub fn remove(&self, fingerprint: &str) -> bool {
        self.keys.remove(fingerprint).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl PeerAuthorizer for KeyAllowlist {
    async fn authorize(&self, peer: &PeerIdentity) -> Result<Authorization, AuthError> {
        match self.keys.get(&peer.fingerprint) {
            Some(backend_id) => {
                debug!("Key {} authorized for backend {}", peer.fingerprint, *backend_id);
                Ok(Authorization::new(backend_id.value().clone()))
            }
            None => Err(AuthError::Unauthorized(format!(
                "key {} is not in the allowlist",
                peer.fingerprint
            ))),
        }
    }
}
