//! Reciprocity: follow-back audit for a rate-limited relationship API.
//!
//! This crate provides:
//! - A resilient collector that drains paginated lists through rate limits,
//!   connection drops and unreadable accounts
//! - A push channel streaming run progress to one observer
//! - Classification of one-sided relationships
//! - Discovery of stored result sets and sessions, and the login flow with a
//!   second-factor suspension point
//! - An HTTP/SSE server and an interactive terminal front end

pub mod api;
pub mod classify;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod registry;
pub mod run;
pub mod server;
pub mod source;
pub mod store;
pub mod ui;

// Re-export main types
pub use classify::Classification;
pub use collector::{CollectOutcome, Collector, RetryPolicy};
pub use config::Config;
pub use discovery::{discover, Discovery, StartMode};
pub use error::{ErrorClass, LoginError, RunError, SourceError, StoreError};
pub use events::{event_channel, EventReceiver, EventSender, Observed, RunEvent, RunSummary};
pub use registry::{RunRegistry, Subscription};
pub use run::{Launch, RunDispatcher, StartRequest};
pub use source::{AccountClient, ClientFactory, Collection, Direction, Entity, ItemSource};
pub use store::{ArtifactStore, FsStore, ResultRef};
