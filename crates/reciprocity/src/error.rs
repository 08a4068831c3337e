//! Error types for the follow-back audit.

use std::time::Duration;

use thiserror::Error;

/// Message fragments that mark a single account as unreachable when the
/// source does not report a structured reason.
const SKIPPABLE_HINTS: &[&str] = &[
    "private",
    "not found",
    "does not exist",
    "unavailable",
    "deleted",
    "suspended",
    "blocked",
    "invalid",
];

/// Message fragments that mark a login as held for out-of-band approval.
const BLOCKED_HINTS: &[&str] = &["challenge", "checkpoint", "fail"];

/// How the collector must react to a [`SourceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limit. Always retried with an escalating cooldown.
    Throttle,
    /// Connectivity problem. Retried with capped exponential backoff.
    Transient,
    /// One account cannot be read. Recorded and skipped.
    Skippable,
    /// Anything else. Stops the current collection.
    Fatal,
}

/// Errors raised while reading relationship records from the source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The source asked us to slow down.
    #[error("rate limited{}", retry_after.map(|d| format!(", retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited {
        /// Server-provided wait hint, if any.
        retry_after: Option<Duration>,
    },

    /// Network-level failure (connect, reset, timeout, 5xx).
    #[error("connection error: {0}")]
    Connectivity(String),

    /// A single account is private, deleted, suspended or otherwise unreadable.
    #[error("account {id} unavailable: {reason}")]
    ItemUnavailable { id: String, reason: String },

    /// The request itself was refused or its response was unreadable.
    ///
    /// Never matched against skip hints: retrying would ask for the same
    /// position again.
    #[error("request failed: {0}")]
    Request(String),

    /// Unclassified error, surfaced verbatim.
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Classify this error for retry handling.
    ///
    /// Structured variants are authoritative. `Other` falls back to matching
    /// known message fragments for per-account access problems.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } => ErrorClass::Throttle,
            Self::Connectivity(_) => ErrorClass::Transient,
            Self::ItemUnavailable { .. } => ErrorClass::Skippable,
            Self::Other(message) if is_skippable_message(message) => ErrorClass::Skippable,
            Self::Request(_) | Self::Other(_) => ErrorClass::Fatal,
        }
    }
}

/// Whether a free-form error message describes an individually unreachable account.
#[must_use]
pub fn is_skippable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    SKIPPABLE_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Errors raised by authentication and profile lookup.
#[derive(Debug, Clone, Error)]
pub enum LoginError {
    /// The account has a second factor enabled; a code must be supplied.
    #[error("two-factor authentication required")]
    TwoFactorRequired,

    /// Wrong handle or password, or a rejected second-factor code.
    #[error("bad credentials: {0}")]
    BadCredentials(String),

    /// Login held by a challenge or checkpoint; the owner must approve it elsewhere.
    #[error("login blocked: {0}")]
    Blocked(String),

    /// A stored session is no longer accepted.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Transport-level failure while talking to the source.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Any other login failure.
    #[error("{0}")]
    Other(String),
}

impl LoginError {
    /// Build a login error from a bare message, recognising challenge-style blocks.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if BLOCKED_HINTS.iter().any(|hint| lower.contains(hint)) {
            Self::Blocked(message)
        } else {
            Self::Other(message)
        }
    }
}

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encode/decode failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Session artifact could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A result set is missing one of its four members, or a member is empty.
    #[error("result set {folder} is missing {member}")]
    MissingMember { folder: String, member: String },

    /// A reference that does not name a result set.
    #[error("invalid result reference: {0}")]
    InvalidRef(String),

    /// Handle that cannot be used as part of a file name.
    #[error("invalid handle: {0:?}")]
    InvalidHandle(String),

    /// No artifact under the requested key.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors returned by the run dispatcher to its callers.
#[derive(Debug, Error)]
pub enum RunError {
    /// A run for this handle is already active; nothing was changed.
    #[error("a run for {0} is already in progress")]
    AlreadyRunning(String),

    /// No active run for this handle.
    #[error("no active run for {0}")]
    NotRunning(String),

    /// Fresh login requested without a password.
    #[error("handle and password are required")]
    MissingCredentials,

    /// Empty or malformed handle.
    #[error("invalid handle: {0:?}")]
    InvalidHandle(String),

    /// Persistence failure while preparing the run.
    #[error(transparent)]
    Store(#[from] StoreError),
}
