//! Control-stream messages exchanged while a session is being set up

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages carried on the control stream before the heartbeat takes over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// First message from the client once the control stream is open
    Hello {
        version: u32,
        release: Option<Release>,
    },
    /// Session is registered and reachable at `endpoint`
    Established { session_id: String, endpoint: String },
    /// Session setup failed, the connection is about to be closed
    Rejected { reason: String },
}

/// Client-supplied build/version information, opaque to the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub description: String,
    pub branch: String,
    pub vcs_type: String,
    pub vcs_revision: String,
    pub vcs_revision_author_name: String,
    pub vcs_revision_author_email: String,
    pub vcs_revision_time: Option<DateTime<Utc>>,
    pub vcs_revision_message: String,
}

impl Release {
    /// Short human readable label used in logs
    pub fn label(&self) -> &str {
        if !self.id.is_empty() {
            &self.id
        } else if !self.vcs_revision.is_empty() {
            &self.vcs_revision
        } else {
            "unknown"
        }
    }
}
