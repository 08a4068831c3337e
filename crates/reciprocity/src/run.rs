//! Run dispatcher and worker.
//!
//! A run authenticates, looks up the profile, drains `following` then
//! `followers`, classifies, persists, and ends with exactly one terminal
//! event.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Deserialize;
use tokio::time::{Instant, Interval};
use tracing::{error, info, warn};

use crate::classify::Classification;
use crate::collector::{Collector, ThrottleBackoff, TransientBackoff};
use crate::config::Config;
use crate::discovery::{self, Discovery, StartMode};
use crate::error::{ErrorClass, LoginError, RunError, SourceError, StoreError};
use crate::events::{event_channel, EventReceiver, EventSender, RunSummary};
use crate::registry::{RunGuard, RunRegistry, Subscription};
use crate::source::{AccountClient, ClientFactory, Collection, Direction, Profile, SessionToken};
use crate::store::{
    validate_handle, ArtifactStore, ExportKind, ResultRef, ResultSetInfo, SessionArtifact, SessionInfo,
};

/// Second-factor codes accepted per login before the run fails.
pub const MAX_SECOND_FACTOR_ATTEMPTS: u32 = 3;

/// Parameters for starting a fetch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    /// Account handle.
    pub handle: String,
    /// Password for a fresh login.
    #[serde(default)]
    pub password: Option<String>,
    /// Reuse the stored session instead of logging in.
    #[serde(default)]
    pub use_session: bool,
    /// Keep avatar URLs in the exports.
    #[serde(default)]
    pub fetch_avatars: bool,
}

impl StartRequest {
    /// Resolve into a start mode.
    pub fn into_mode(self) -> Result<StartMode, RunError> {
        let handle = self.handle.trim().to_string();
        if validate_handle(&handle).is_err() {
            return Err(RunError::InvalidHandle(self.handle));
        }
        if self.use_session {
            return Ok(StartMode::ResumeSession { handle });
        }
        match self.password.filter(|p| !p.is_empty()) {
            Some(password) => Ok(StartMode::FreshLogin { handle, password }),
            None => Err(RunError::MissingCredentials),
        }
    }
}

/// What [`RunDispatcher::launch`] produced.
#[derive(Debug)]
pub enum Launch {
    /// A stored result set was loaded; nothing was fetched.
    Loaded {
        reference: ResultRef,
        classification: Classification,
    },
    /// A fetch is running; events arrive on the receiver.
    Running(EventReceiver),
}

/// Owns the run registry and spawns run workers.
#[derive(Clone)]
pub struct RunDispatcher {
    store: Arc<dyn ArtifactStore>,
    clients: Arc<dyn ClientFactory>,
    registry: RunRegistry,
    config: Arc<Config>,
}

impl RunDispatcher {
    /// Create a dispatcher with an empty registry.
    #[must_use]
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        clients: Arc<dyn ClientFactory>,
        config: Config,
    ) -> Self {
        Self {
            store,
            clients,
            registry: RunRegistry::new(),
            config: Arc::new(config),
        }
    }

    /// The run registry.
    #[must_use]
    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// The artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Start a fetch and park its event stream for [`RunDispatcher::subscribe`].
    pub fn start(&self, request: StartRequest) -> Result<(), RunError> {
        let fetch_avatars = request.fetch_avatars;
        let mode = request.into_mode()?;
        let handle = mode.handle().to_string();
        match self.launch(mode, fetch_avatars)? {
            Launch::Running(receiver) => {
                self.registry.park_receiver(&handle, receiver);
                Ok(())
            }
            Launch::Loaded { .. } => Ok(()),
        }
    }

    /// Start a run in the given mode.
    ///
    /// Rejected immediately, with nothing changed, when the handle already
    /// has an active run.
    pub fn launch(&self, mode: StartMode, fetch_avatars: bool) -> Result<Launch, RunError> {
        let (handle, password) = match mode {
            StartMode::LoadResult(reference) => {
                let classification = self.store.load_result_set(&reference)?;
                return Ok(Launch::Loaded {
                    reference,
                    classification,
                });
            }
            StartMode::ResumeSession { handle } => (handle, None),
            StartMode::FreshLogin { handle, password } => (handle, Some(password)),
        };
        validate_handle(&handle).map_err(|_| RunError::InvalidHandle(handle.clone()))?;

        let use_session = password.is_none();
        let guard = self.registry.begin(&handle, password)?;
        let (events, receiver) = event_channel(&handle);
        let worker = RunWorker {
            store: Arc::clone(&self.store),
            client: self.clients.create(),
            config: Arc::clone(&self.config),
            collector: Collector::new(self.config.retry.clone()),
        };
        info!(handle = %handle, use_session, fetch_avatars, "Run started");
        tokio::spawn(worker.run(guard, events, use_session, fetch_avatars));
        Ok(Launch::Running(receiver))
    }

    /// Hand a second-factor code to the run for `handle`.
    pub fn submit_second_factor(&self, handle: &str, code: &str) -> Result<(), RunError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(RunError::MissingCredentials);
        }
        self.registry.submit_second_factor(handle, code)?;
        info!(handle, "Second-factor code submitted");
        Ok(())
    }

    /// Claim the event stream of the run for `handle`.
    ///
    /// `None` while another observer holds it. Dropping the subscription
    /// before the run ends makes the stream claimable again.
    #[must_use]
    pub fn subscribe(&self, handle: &str) -> Option<Subscription> {
        self.registry.subscribe(handle)
    }

    /// Re-derive the discovery state from storage.
    pub fn discover(&self, skip_results: bool) -> Result<Discovery, StoreError> {
        discovery::discover(self.store.as_ref(), skip_results)
    }

    /// Valid result sets, newest first.
    pub fn list_result_sets(&self) -> Result<Vec<ResultSetInfo>, StoreError> {
        Ok(self
            .store
            .enumerate_result_sets()?
            .into_iter()
            .filter(|r| r.valid)
            .collect())
    }

    /// Stored sessions, most recent first.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        self.store.enumerate_sessions()
    }

    /// Load a stored result set.
    pub fn load_result(&self, reference: &ResultRef) -> Result<Classification, StoreError> {
        self.store.load_result_set(reference)
    }

    /// Path of one export of a stored result set.
    pub fn export_path(
        &self,
        reference: &ResultRef,
        kind: ExportKind,
    ) -> Result<PathBuf, StoreError> {
        self.store.export_path(reference, kind)
    }
}

/// Why a run failed, and whether the observer should re-enable input first.
#[derive(Debug)]
struct RunFailure {
    reason: String,
    unlock: bool,
}

impl RunFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            unlock: false,
        }
    }

    fn unlock(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            unlock: true,
        }
    }

    fn login(err: &LoginError) -> Self {
        match err {
            LoginError::BadCredentials(detail) => {
                Self::unlock(format!("Login failed: wrong username, password or code ({detail})"))
            }
            LoginError::Blocked(detail) => Self::unlock(format!(
                "Login blocked ({detail}). Approve the login in the app, then try again."
            )),
            LoginError::SessionExpired(detail) => Self::unlock(format!(
                "Stored session is no longer valid ({detail}); log in with your password."
            )),
            LoginError::TwoFactorRequired => {
                Self::unlock("Two-factor authentication required; log in with your password.")
            }
            LoginError::Source(source) => Self::unlock(format!("Login failed: {source}")),
            LoginError::Other(detail) => Self::unlock(format!("Login failed: {detail}")),
        }
    }
}

struct RunWorker {
    store: Arc<dyn ArtifactStore>,
    client: Arc<dyn AccountClient>,
    config: Arc<Config>,
    collector: Collector,
}

impl RunWorker {
    async fn run(self, guard: RunGuard, events: EventSender, use_session: bool, fetch_avatars: bool) {
        let handle = guard.handle().to_string();
        let result = self
            .execute(&guard, &events, use_session, fetch_avatars)
            .await;
        // release the handle before the observer sees the terminal event
        drop(guard);

        match result {
            Ok(summary) => {
                info!(
                    handle = %handle,
                    following_only = summary.classification.following_only.len(),
                    fans_only = summary.classification.fans_only.len(),
                    "Run complete"
                );
                events.done(summary);
            }
            Err(failure) => {
                error!(handle = %handle, reason = %failure.reason, "Run failed");
                if failure.unlock {
                    events.unlock_input();
                }
                events.fail(failure.reason);
            }
        }
    }

    async fn execute(
        &self,
        guard: &RunGuard,
        events: &EventSender,
        use_session: bool,
        fetch_avatars: bool,
    ) -> Result<RunSummary, RunFailure> {
        let handle = guard.handle();
        events.log(format!("Starting follow-back audit for {handle}"));

        self.authenticate(guard, events, use_session).await?;
        events.lock_input();

        let settle = self.config.settle_delay;
        if !settle.is_zero() {
            events.log(format!(
                "Waiting {}s before the first request...",
                settle.as_secs()
            ));
            tokio::time::sleep(settle).await;
        }

        let profile = self.lookup_profile(handle, events).await?;
        let (following, skipped_following) = self
            .drain(handle, Direction::Following, &profile, fetch_avatars, events)
            .await?;
        let (followers, skipped_followers) = self
            .drain(handle, Direction::Followers, &profile, fetch_avatars, events)
            .await?;

        let classification = Classification::classify(following, followers);
        events.log(format!(
            "{} accounts you follow don't follow back; {} followers you don't follow back",
            classification.following_only.len(),
            classification.fans_only.len()
        ));

        let save_failed = |e: StoreError| RunFailure::new(format!("Failed to save results: {e}"));
        let reference = self
            .store
            .allocate_result(handle, Local::now().naive_local())
            .map_err(save_failed)?;
        let result_set = self
            .store
            .write_result_set(&reference, &classification)
            .map_err(save_failed)?;
        events.log(format!("Results saved to {}", reference.folder_name()));

        Ok(RunSummary {
            handle: handle.to_string(),
            classification,
            result_set,
            skipped_following,
            skipped_followers,
        })
    }

    async fn authenticate(
        &self,
        guard: &RunGuard,
        events: &EventSender,
        use_session: bool,
    ) -> Result<(), RunFailure> {
        let handle = guard.handle();
        if use_session {
            let artifact = self
                .store
                .read_session(handle)
                .map_err(|e| RunFailure::unlock(format!("Failed to read stored session: {e}")))?
                .ok_or_else(|| RunFailure::unlock(format!("No stored session for {handle}")))?;
            events.log(format!("Using stored session for {handle}"));
            return self
                .client
                .restore_session(handle, &artifact.token)
                .await
                .map_err(|e| RunFailure::login(&e));
        }

        let password = guard
            .take_password()
            .ok_or_else(|| RunFailure::unlock("Password is required"))?;
        events.log("Logging in...");
        let token = match self.client.login(handle, &password).await {
            Ok(token) => token,
            Err(LoginError::TwoFactorRequired) => self.second_factor(guard, events).await?,
            Err(err) => {
                warn!(handle, error = %err, "Login rejected");
                return Err(RunFailure::login(&err));
            }
        };
        drop(password);
        events.log("Login successful");

        if let Err(e) = self.store.write_session(&SessionArtifact::new(handle, token)) {
            warn!(handle, error = %e, "Failed to save session");
            events.log(format!("[WARN] Could not save the session: {e}"));
        }
        Ok(())
    }

    async fn second_factor(
        &self,
        guard: &RunGuard,
        events: &EventSender,
    ) -> Result<SessionToken, RunFailure> {
        let handle = guard.handle();
        let slot = guard.second_factor();
        for attempt in 1..=MAX_SECOND_FACTOR_ATTEMPTS {
            if attempt == 1 {
                events.log("Two-factor authentication required. Enter the code from your app or SMS.");
            } else {
                // a code sent while the rejected one was verified is stale
                slot.clear();
                events.log(format!(
                    "Enter a new code ({} attempts left)",
                    MAX_SECOND_FACTOR_ATTEMPTS - attempt + 1
                ));
            }
            events.request_second_factor();

            let code = slot
                .wait()
                .await
                .ok_or_else(|| RunFailure::unlock("Two-factor input closed"))?;
            events.log("Verifying code...");

            match self.client.two_factor_login(handle, &code).await {
                Ok(token) => return Ok(token),
                Err(LoginError::BadCredentials(detail)) if attempt < MAX_SECOND_FACTOR_ATTEMPTS => {
                    warn!(handle, attempt, "Two-factor code rejected");
                    events.log(format!("[WARN] Two-factor login failed: {detail}"));
                }
                Err(err) => return Err(RunFailure::login(&err)),
            }
        }
        Err(RunFailure::unlock("Too many rejected two-factor codes"))
    }

    async fn lookup_profile(&self, handle: &str, events: &EventSender) -> Result<Profile, RunFailure> {
        let timeout = self.config.profile_timeout;
        let notice = self.config.profile_notice_interval.max(Duration::from_secs(1));
        events.log(format!("Looking up profile {handle}..."));

        let started = Instant::now();
        let deadline = started + timeout;
        let mut ticker = tokio::time::interval_at(started + notice, notice);
        let mut throttle = ThrottleBackoff::new(&self.config.retry);
        let mut transient = TransientBackoff::new(&self.config.retry);
        let timed_out = || {
            warn!(handle, timeout_secs = timeout.as_secs(), "Profile lookup timed out");
            RunFailure::new(format!(
                "Profile lookup timed out after {}s",
                timeout.as_secs()
            ))
        };

        let profile = loop {
            let lookup = self.client.profile(handle);
            let Some(result) = until_deadline(lookup, deadline, &mut ticker, started, events).await
            else {
                return Err(timed_out());
            };
            let err = match result {
                Ok(profile) => break profile,
                Err(LoginError::Source(err)) => err,
                Err(err @ LoginError::SessionExpired(_)) => return Err(RunFailure::login(&err)),
                Err(other) => {
                    return Err(RunFailure::new(format!("Profile lookup failed: {other}")));
                }
            };

            let delay = match err.class() {
                ErrorClass::Throttle => {
                    let hint = match &err {
                        SourceError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = throttle.next_delay(hint);
                    warn!(
                        handle,
                        retry = throttle.consecutive(),
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Profile lookup rate limited"
                    );
                    events.log(format!(
                        "[RATE-LIMIT] {err}; waiting {}s before looking up the profile again",
                        delay.as_secs()
                    ));
                    delay
                }
                ErrorClass::Transient => {
                    let delay = transient.next_delay();
                    warn!(
                        handle,
                        retry = transient.attempts(),
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Profile lookup connection error"
                    );
                    events.log(format!(
                        "[WARN] {err}; retrying the profile lookup in {}s",
                        delay.as_secs()
                    ));
                    delay
                }
                ErrorClass::Skippable | ErrorClass::Fatal => {
                    return Err(RunFailure::new(format!("Profile lookup failed: {err}")));
                }
            };
            let pause = tokio::time::sleep(delay);
            if until_deadline(pause, deadline, &mut ticker, started, events)
                .await
                .is_none()
            {
                return Err(timed_out());
            }
        };

        let count = |n: Option<u64>| n.map_or_else(|| "unknown".to_string(), |n| n.to_string());
        events.log(format!(
            "Profile {}: following {}, followers {}",
            profile.handle,
            count(profile.following_count),
            count(profile.followers_count)
        ));
        Ok(profile)
    }

    async fn drain(
        &self,
        handle: &str,
        direction: Direction,
        profile: &Profile,
        fetch_avatars: bool,
        events: &EventSender,
    ) -> Result<(Collection, usize), RunFailure> {
        let mut source = self.client.relations(
            handle,
            direction,
            profile.total_for(direction),
            fetch_avatars,
        );
        let outcome = self
            .collector
            .collect(source.as_mut(), direction.label(), events)
            .await;
        let (collection, skipped) = outcome
            .into_result()
            .map_err(|e| RunFailure::new(format!("Fetching {direction} failed: {e}")))?;
        Ok((collection, skipped.len()))
    }
}

/// Drive `fut` until it completes or `deadline` passes, logging a notice on
/// every tick. `None` means the deadline won.
async fn until_deadline<F: Future>(
    fut: F,
    deadline: Instant,
    ticker: &mut Interval,
    started: Instant,
    events: &EventSender,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Some(output),
            () = tokio::time::sleep_until(deadline) => return None,
            _ = ticker.tick() => {
                events.log(format!(
                    "Still waiting for the profile lookup ({}s)",
                    started.elapsed().as_secs()
                ));
            }
        }
    }
}
