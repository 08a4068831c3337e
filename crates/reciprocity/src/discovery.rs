//! Start-of-run discovery.
//!
//! Every check re-reads durable storage: valid result sets win over stored
//! sessions, which win over a fresh login.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{ArtifactStore, ResultRef, ResultSetInfo, SessionInfo};

/// What the caller can do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Discovery {
    /// At least one valid result set exists. Newest first.
    FoundResults {
        results: Vec<ResultSetInfo>,
        /// Sessions, offered if the caller discards the results.
        sessions: Vec<SessionInfo>,
    },
    /// No usable results, but stored sessions exist. Most recent first.
    FoundSessions {
        sessions: Vec<SessionInfo>,
        default_handle: String,
    },
    /// Nothing stored; credentials are needed.
    FreshLogin,
}

impl Discovery {
    /// Short state name.
    #[must_use]
    pub const fn state(&self) -> &'static str {
        match self {
            Self::FoundResults { .. } => "found_results",
            Self::FoundSessions { .. } => "found_sessions",
            Self::FreshLogin => "fresh_login",
        }
    }

    /// The only result set, if there is exactly one.
    #[must_use]
    pub fn single_result(&self) -> Option<&ResultRef> {
        match self {
            Self::FoundResults { results, .. } if results.len() == 1 => {
                results.first().map(|r| &r.reference)
            }
            _ => None,
        }
    }

    /// The state reached when the caller discards the offered results.
    #[must_use]
    pub fn without_results(self) -> Self {
        match self {
            Self::FoundResults { sessions, .. } => from_sessions(sessions),
            other => other,
        }
    }
}

/// How a run begins once discovery has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Show a stored result set; nothing is fetched.
    LoadResult(ResultRef),
    /// Fetch using a stored session.
    ResumeSession { handle: String },
    /// Fetch after an interactive login.
    FreshLogin { handle: String, password: String },
}

impl StartMode {
    /// Handle the run is for.
    #[must_use]
    pub fn handle(&self) -> &str {
        match self {
            Self::LoadResult(reference) => &reference.handle,
            Self::ResumeSession { handle } | Self::FreshLogin { handle, .. } => handle,
        }
    }
}

/// Derive the discovery state from storage.
///
/// `skip_results` starts the evaluation at the session check.
pub fn discover(store: &dyn ArtifactStore, skip_results: bool) -> Result<Discovery, StoreError> {
    let sessions = store.enumerate_sessions()?;
    if !skip_results {
        let results: Vec<_> = store
            .enumerate_result_sets()?
            .into_iter()
            .filter(|r| r.valid)
            .collect();
        if !results.is_empty() {
            debug!(results = results.len(), sessions = sessions.len(), "Found result sets");
            return Ok(Discovery::FoundResults { results, sessions });
        }
    }
    debug!(sessions = sessions.len(), skip_results, "No result sets offered");
    Ok(from_sessions(sessions))
}

fn from_sessions(sessions: Vec<SessionInfo>) -> Discovery {
    match sessions.first().map(|s| s.handle.clone()) {
        Some(default_handle) => Discovery::FoundSessions {
            sessions,
            default_handle,
        },
        None => Discovery::FreshLogin,
    }
}
