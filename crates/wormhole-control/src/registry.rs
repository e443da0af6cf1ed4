//! Shared session registry
//!
//! Every serving session is published under `session:<id>` so that other
//! nodes of the cluster can find which node holds a backend's tunnel. The
//! storage engine sits behind [`SessionRegistry`]; this crate only ships an
//! in-process implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Prefix of every session key
pub const SESSION_KEY_PREFIX: &str = "session:";

/// Registry key for a session ID
pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, session_id)
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Registry rejected {key}: {reason}")]
    Rejected { key: String, reason: String },
}

/// What a node publishes about one of its sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_url: String,
}

impl SessionRecord {
    /// Field/value pairs as stored, empty values left out
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("id", self.id.as_str()),
            ("node_id", self.node_id.as_str()),
            ("backend_id", self.backend_id.as_str()),
            ("client_addr", self.client_addr.as_str()),
            ("endpoint_addr", self.endpoint_addr.as_str()),
            ("cluster_url", self.cluster_url.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect()
    }
}

/// Session registry trait
///
/// Implementations must tolerate concurrent calls from many sessions without
/// any external locking.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Create or overwrite the entry at `key`
    async fn put(&self, key: &str, record: &SessionRecord) -> Result<(), RegistryError>;

    /// Remove the entry at `key`; removing a missing entry is not an error
    async fn delete(&self, key: &str) -> Result<(), RegistryError>;
}

/// In-process registry for single-node deployments
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: DashMap<String, SessionRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<SessionRecord> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn put(&self, key: &str, record: &SessionRecord) -> Result<(), RegistryError> {
        debug!("Registry put {} {:?}", key, record.fields());
        self.entries.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        if self.entries.remove(key).is_some() {
            debug!("Registry delete {}", key);
        }
        Ok(())
    }
}
