//! Item source contract.
//!
//! The wrapped relationship API is an external collaborator. The core only
//! consumes the traits below: [`AccountClient`] for authentication and the
//! profile lookup, and [`ItemSource`] for step-wise draining of one list.

mod memory;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{LoginError, SourceError};

pub use memory::MemorySource;
pub use types::{thumbnail_avatar, Collection, Direction, Entity, Profile, SessionToken};

/// A paginated list of accounts, read one item at a time.
#[async_trait]
pub trait ItemSource: Send {
    /// Total reported by the source, if any.
    fn expected_total(&self) -> Option<u64>;

    /// Pull the next item.
    ///
    /// Returns `None` once the list is exhausted. A throttle or connectivity
    /// error does not advance the source; calling again retries the same
    /// position. A per-account error is reported once and then skipped over.
    async fn next_item(&mut self) -> Option<Result<Entity, SourceError>>;
}

/// Authenticated access to one account on the wrapped API.
#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Log in with a password.
    async fn login(&self, handle: &str, password: &str) -> Result<SessionToken, LoginError>;

    /// Complete a pending login with a second-factor code.
    async fn two_factor_login(&self, handle: &str, code: &str)
        -> Result<SessionToken, LoginError>;

    /// Reuse a token from an earlier login.
    async fn restore_session(&self, handle: &str, token: &SessionToken) -> Result<(), LoginError>;

    /// Look up the account's counters.
    async fn profile(&self, handle: &str) -> Result<Profile, LoginError>;

    /// Open one relationship list for draining.
    fn relations(
        &self,
        handle: &str,
        direction: Direction,
        expected_total: Option<u64>,
        fetch_avatars: bool,
    ) -> Box<dyn ItemSource>;
}

/// Creates a fresh client for each run.
pub trait ClientFactory: Send + Sync {
    /// Build a new, unauthenticated client.
    fn create(&self) -> Arc<dyn AccountClient>;
}
