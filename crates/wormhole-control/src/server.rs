//! Tunnel server: accepts client connections and runs their sessions

use crate::bridge;
use crate::config::ServerConfig;
use crate::error::{ServerError, SessionError};
use crate::heartbeat::{self, HeartbeatConfig};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionState};
use crate::session_set::SessionSet;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use wormhole_auth::PeerAuthorizer;
use wormhole_mux::{MuxStream, Multiplexer, Role};
use wormhole_proto::{ControlCodec, ControlMessage, PROTOCOL_VERSION};
use wormhole_transport::{PeerIdentity, ServerKey, TlsHandshake};

/// Point-in-time view of a session, for diagnostics
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub backend_id: String,
    pub client_addr: SocketAddr,
    pub endpoint_addr: String,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub release: Option<String>,
}

/// Reverse tunnel server
pub struct TunnelServer {
    config: ServerConfig,
    handshake: TlsHandshake,
    authorizer: Arc<dyn PeerAuthorizer>,
    registry: Arc<dyn SessionRegistry>,
    sessions: SessionSet,
    connections: TaskTracker,
    shutdown: CancellationToken,
}

impl TunnelServer {
    /// Fails early when the configured private key cannot be used
    pub fn new(
        config: ServerConfig,
        authorizer: Arc<dyn PeerAuthorizer>,
        registry: Arc<dyn SessionRegistry>,
    ) -> Result<Self, ServerError> {
        let key = ServerKey::from_pem(&config.private_key, &config.localhost)?;
        let handshake = TlsHandshake::new(&key)?.with_timeout(config.handshake_timeout);

        info!("Server key fingerprint: {}", key.fingerprint());

        Ok(Self {
            config,
            handshake,
            authorizer,
            registry,
            sessions: SessionSet::new(),
            connections: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Fingerprint clients should pin
    pub fn fingerprint(&self) -> &str {
        self.handshake.fingerprint()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept client connections until [`shutdown`](Self::shutdown) is called
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!("Relay listening on {}", local_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);
                        let _ = socket.set_nodelay(true);

                        let server = self.clone();
                        self.connections.spawn(async move {
                            let _ = server.handle_connection(socket, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = self.shutdown.cancelled() => {
                    info!("Relay on {} stopped accepting connections", local_addr);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Run one client connection from handshake to teardown
    ///
    /// The session is visible in [`sessions`](Self::sessions) for as long as
    /// this runs, and is fully closed when it returns.
    pub async fn handle_connection<IO>(&self, io: IO, client_addr: SocketAddr) -> Result<(), SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Arc::new(Session::new(
            self.config.node_id.clone(),
            self.config.cluster_url.clone(),
            client_addr,
            self.registry.clone(),
            self.shutdown.child_token(),
        ));
        self.sessions.insert(session.clone());
        debug!("Session {} created for {}", session.id(), client_addr);

        let result = self.run_session(&session, io).await;

        session.close().await;
        self.sessions.remove(session.id());

        match &result {
            Ok(()) | Err(SessionError::Closed) | Err(SessionError::TransportClosed) => {
                info!("Session {} from {} ended", session.id(), client_addr)
            }
            Err(e) => warn!("Session {} from {} failed: {}", session.id(), client_addr, e),
        }
        result
    }

    async fn run_session<IO>(&self, session: &Session, io: IO) -> Result<(), SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let token = session.shutdown_token();

        let (tls, peer) = tokio::select! {
            result = self.handshake.accept(io) => result?,
            _ = token.cancelled() => return Err(SessionError::Closed),
        };

        let mux = Arc::new(Multiplexer::new(tls, Role::Server, self.config.mux.clone()));
        let accepted = tokio::select! {
            accepted = tokio::time::timeout(self.config.handshake_timeout, mux.accept_stream()) => {
                accepted.ok().flatten()
            }
            _ = token.cancelled() => None,
        };
        let Some(mut control) = accepted else {
            mux.close().await;
            return Err(if token.is_cancelled() {
                SessionError::Closed
            } else {
                SessionError::NoControlStream
            });
        };
        session.stream_ready(mux.clone())?;

        let listener = match self.establish(session, &peer, &mut control).await {
            Ok(listener) => listener,
            Err(e) => {
                let rejected = ControlMessage::Rejected {
                    reason: e.to_string(),
                };
                if let Err(write_err) = ControlCodec::write_message(&mut control, &rejected).await {
                    debug!("Could not tell session {} why it was rejected: {}", session.id(), write_err);
                }
                return Err(e);
            }
        };

        let established = ControlMessage::Established {
            session_id: session.id().to_string(),
            endpoint: session.endpoint_addr(),
        };
        ControlCodec::write_message(&mut control, &established).await?;
        session.serving()?;

        info!(
            "Session {} serving backend {} at {}",
            session.id(),
            session.backend_id(),
            session.endpoint_addr()
        );

        let mut loops = JoinSet::new();
        loops.spawn(keep_alive(control, self.config.heartbeat.clone(), token.clone()));
        loops.spawn(forward(listener, mux.clone(), token.clone(), session.id().to_string()));

        let outcome = tokio::select! {
            Some(joined) = loops.join_next() => {
                joined.unwrap_or_else(|e| Err(SessionError::Task(e.to_string())))
            }
            _ = mux.closed() => Err(SessionError::TransportClosed),
            _ = token.cancelled() => Ok(()),
        };

        token.cancel();
        while loops.join_next().await.is_some() {}

        outcome
    }

    /// Read the client's hello, authorize its key, bind and publish the endpoint
    async fn establish(
        &self,
        session: &Session,
        peer: &PeerIdentity,
        control: &mut MuxStream,
    ) -> Result<Arc<TcpListener>, SessionError> {
        let hello = tokio::time::timeout(self.config.handshake_timeout, ControlCodec::read_message(control))
            .await
            .map_err(|_| SessionError::HelloTimeout)??;
        let release = match hello {
            ControlMessage::Hello { version, release } if version == PROTOCOL_VERSION => release,
            ControlMessage::Hello { version, .. } => {
                return Err(SessionError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: version,
                })
            }
            other => return Err(SessionError::UnexpectedMessage(format!("{:?}", other))),
        };
        let authorization = self.authorizer.authorize(peer).await?;

        info!(
            "Session {}: key {} authorized for backend {} (release {})",
            session.id(),
            peer.fingerprint,
            authorization.backend_id,
            release.as_ref().map(|r| r.label()).unwrap_or("unknown")
        );
        session.authenticated(authorization.backend_id, release)?;

        let listener = TcpListener::bind((self.config.endpoint_bind_ip, 0))
            .await
            .map_err(SessionError::Bind)?;
        let port = listener.local_addr().map_err(SessionError::Bind)?.port();
        let listener = Arc::new(listener);
        session.endpoint_bound(listener.clone(), format!("{}:{}", self.config.localhost, port))?;

        session.register().await?;
        Ok(listener)
    }

    /// Snapshot of the live sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .snapshot()
            .into_iter()
            .map(|session| SessionInfo {
                id: session.id().to_string(),
                backend_id: session.backend_id(),
                client_addr: session.client_addr(),
                endpoint_addr: session.endpoint_addr(),
                state: session.state(),
                connected_at: session.connected_at(),
                release: session.release().map(|r| r.label().to_string()),
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting connections and close every session
    pub async fn shutdown(&self) {
        info!("Shutting down relay ({} sessions)", self.sessions.len());
        self.shutdown.cancel();

        let sessions = self.sessions.snapshot();
        join_all(sessions.iter().map(|session| session.close())).await;

        self.connections.close();
        self.connections.wait().await;
        info!("Relay shut down");
    }
}

async fn keep_alive(
    mut control: MuxStream,
    config: HeartbeatConfig,
    token: CancellationToken,
) -> Result<(), SessionError> {
    tokio::select! {
        err = heartbeat::initiate(&mut control, &config) => Err(err.into()),
        _ = token.cancelled() => Ok(()),
    }
}

/// Accept public connections and bridge each onto a fresh stream
async fn forward(
    listener: Arc<TcpListener>,
    mux: Arc<Multiplexer>,
    token: CancellationToken,
    session_id: String,
) -> Result<(), SessionError> {
    let mut flows = JoinSet::new();

    let result = loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => break Err(SessionError::Accept(e)),
                };
                let stream = match mux.open_stream().await {
                    Ok(stream) => stream,
                    Err(e) => break Err(e.into()),
                };
                debug!(
                    "Session {}: {} -> stream {}",
                    session_id,
                    remote_addr,
                    stream.stream_id()
                );
                flows.spawn(run_flow(socket, stream, remote_addr, session_id.clone()));
            }
            Some(_) = flows.join_next(), if !flows.is_empty() => {}
            _ = token.cancelled() => break Ok(()),
        }
    };

    flows.shutdown().await;
    result
}

async fn run_flow(socket: TcpStream, stream: MuxStream, remote_addr: SocketAddr, session_id: String) {
    let _ = socket.set_nodelay(true);
    match bridge::relay(socket, stream).await {
        Ok(()) => debug!("Session {}: flow from {} finished", session_id, remote_addr),
        Err(e) => debug!("Session {}: flow from {} failed: {}", session_id, remote_addr, e),
    }
}
