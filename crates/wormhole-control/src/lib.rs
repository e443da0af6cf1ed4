//! Reverse tunnel control plane
//!
//! Clients dial the relay once and keep that connection open. For every
//! client the relay binds a public TCP endpoint; connections arriving there
//! are carried back to the client as streams over the client's own
//! connection.

pub mod bridge;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod session;
pub mod session_set;

pub use config::ServerConfig;
pub use error::{ServerError, SessionError};
pub use heartbeat::{HeartbeatConfig, HeartbeatError};
pub use registry::{
    session_key, MemoryRegistry, RegistryError, SessionRecord, SessionRegistry, SESSION_KEY_PREFIX,
};
pub use server::{SessionInfo, TunnelServer};
pub use session::{Session, SessionState};
pub use session_set::SessionSet;
