//! A single client tunnel and its lifecycle
//!
//! ```text
//! Created -> StreamReady -> Authenticated -> EndpointBound -> Registered -> Serving
//!    \___________\______________\________________\______________\___________\--> Closed
//! ```
//!
//! A session owns its multiplexer and its public listener, and shares the
//! registry with every other session. [`Session::close`] releases all three
//! exactly once, no matter how many times or from where it is called.

use crate::error::SessionError;
use crate::registry::{session_key, SessionRecord, SessionRegistry};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wormhole_mux::Multiplexer;
use wormhole_proto::Release;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    StreamReady,
    Authenticated,
    EndpointBound,
    Registered,
    Serving,
    Closed,
}

struct SessionInner {
    state: SessionState,
    backend_id: String,
    endpoint_addr: String,
    release: Option<Release>,
    mux: Option<Arc<Multiplexer>>,
    listener: Option<Arc<TcpListener>>,
    registered: bool,
}

/// One client connection turned tunnel
pub struct Session {
    id: String,
    node_id: String,
    cluster_url: String,
    client_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    registry: Arc<dyn SessionRegistry>,
    shutdown: CancellationToken,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// `shutdown` is cancelled when the session closes; pass a child of a
    /// wider token to have the session follow it
    pub fn new(
        node_id: impl Into<String>,
        cluster_url: impl Into<String>,
        client_addr: SocketAddr,
        registry: Arc<dyn SessionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            cluster_url: cluster_url.into(),
            client_addr,
            connected_at: Utc::now(),
            registry,
            shutdown,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                backend_id: String::new(),
                endpoint_addr: String::new(),
                release: None,
                mux: None,
                listener: None,
                registered: false,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` and move to `next`, unless the session is already closed
    fn advance(
        &self,
        next: SessionState,
        update: impl FnOnce(&mut SessionInner),
    ) -> Result<(), SessionError> {
        let mut inner = self.inner();
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        update(&mut inner);
        inner.state = next;
        drop(inner);

        debug!("Session {} -> {:?}", self.id, next);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registry key of this session
    pub fn key(&self) -> String {
        session_key(&self.id)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn backend_id(&self) -> String {
        self.inner().backend_id.clone()
    }

    pub fn endpoint_addr(&self) -> String {
        self.inner().endpoint_addr.clone()
    }

    pub fn release(&self) -> Option<Release> {
        self.inner().release.clone()
    }

    /// Cancelled once the session starts closing
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Hand the session its multiplexer once the control stream is up
    pub fn stream_ready(&self, mux: Arc<Multiplexer>) -> Result<(), SessionError> {
        self.advance(SessionState::StreamReady, |inner| inner.mux = Some(mux))
    }

    pub fn authenticated(&self, backend_id: String, release: Option<Release>) -> Result<(), SessionError> {
        self.advance(SessionState::Authenticated, |inner| {
            inner.backend_id = backend_id;
            inner.release = release;
        })
    }

    pub fn endpoint_bound(&self, listener: Arc<TcpListener>, endpoint_addr: String) -> Result<(), SessionError> {
        self.advance(SessionState::EndpointBound, |inner| {
            inner.listener = Some(listener);
            inner.endpoint_addr = endpoint_addr;
        })
    }

    /// Registry entry describing this session
    pub fn record(&self) -> SessionRecord {
        let inner = self.inner();
        SessionRecord {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            backend_id: inner.backend_id.clone(),
            client_addr: self.client_addr.to_string(),
            endpoint_addr: inner.endpoint_addr.clone(),
            cluster_url: self.cluster_url.clone(),
        }
    }

    /// Publish the session in the registry
    ///
    /// If the session is closed while the write is in flight, the entry is
    /// removed again before returning.
    pub async fn register(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let key = self.key();
        self.registry.put(&key, &self.record()).await?;

        if self
            .advance(SessionState::Registered, |inner| inner.registered = true)
            .is_err()
        {
            if let Err(e) = self.registry.delete(&key).await {
                warn!("Failed to delete registry entry {}: {}", key, e);
            }
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    pub fn serving(&self) -> Result<(), SessionError> {
        self.advance(SessionState::Serving, |_| {})
    }

    /// Tear the session down
    ///
    /// Stops the session's loops, closes the multiplexer and the public
    /// listener, then deletes the registry entry. Later calls are no-ops.
    pub async fn close(&self) {
        let (mux, listener, registered) = {
            let mut inner = self.inner();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            (
                inner.mux.take(),
                inner.listener.take(),
                std::mem::replace(&mut inner.registered, false),
            )
        };

        self.shutdown.cancel();

        if let Some(mux) = mux {
            mux.close().await;
        }
        drop(listener);

        if registered {
            let key = self.key();
            if let Err(e) = self.registry.delete(&key).await {
                warn!("Failed to delete registry entry {}: {}", key, e);
            }
        }

        info!("Session {} from {} closed", self.id, self.client_addr);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
