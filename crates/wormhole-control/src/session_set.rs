//! Process-wide set of live sessions

use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Live sessions keyed by session ID
///
/// The lock is held only for the map operation itself, never across I/O.
#[derive(Default)]
pub struct SessionSet {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session; inserting the same session twice keeps one entry
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions().insert(session.id().to_string(), session);
    }

    /// Remove a session; removing an unknown ID is a no-op
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Copy of the current sessions, safe to use after the lock is released
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }
}
