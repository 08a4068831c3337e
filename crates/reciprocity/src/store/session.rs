//! Session artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::SessionToken;

/// Stored authentication for one handle.
///
/// Never edited in place; a new login replaces the whole artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArtifact {
    /// Account handle.
    pub handle: String,
    /// Token issued by the source.
    pub token: SessionToken,
    /// When the login happened.
    pub saved_at: DateTime<Utc>,
}

impl SessionArtifact {
    /// Artifact for a fresh login.
    #[must_use]
    pub fn new(handle: impl Into<String>, token: SessionToken) -> Self {
        Self {
            handle: handle.into(),
            token,
            saved_at: Utc::now(),
        }
    }
}

/// Listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Account handle.
    pub handle: String,
    /// File modification time.
    pub last_used: DateTime<Utc>,
}
