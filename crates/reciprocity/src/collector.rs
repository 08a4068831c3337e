//! Resilient collector: drains an item source with retry and backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{ErrorClass, SourceError};
use crate::events::EventSender;
use crate::source::{Collection, Entity, ItemSource};

/// Retry and progress tuning for one collection.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Cooldown after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
    /// Multiplier applied once signals keep coming.
    pub rate_limit_growth: f64,
    /// Upper bound for the rate-limit cooldown.
    pub rate_limit_ceiling: Duration,
    /// Consecutive signals served at the current cooldown before it grows.
    pub escalate_after: u32,
    /// First wait after a connectivity error.
    pub connectivity_base: Duration,
    /// Upper bound for the connectivity wait.
    pub connectivity_cap: Duration,
    /// Give up after this many consecutive connectivity errors (`None` = never).
    pub connectivity_max_retries: Option<u32>,
    /// Emit a progress update every this many collected items.
    pub progress_every: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_cooldown: Duration::from_secs(180),
            rate_limit_growth: 1.5,
            rate_limit_ceiling: Duration::from_secs(300),
            escalate_after: 4,
            connectivity_base: Duration::from_secs(3),
            connectivity_cap: Duration::from_secs(60),
            connectivity_max_retries: None,
            progress_every: 10,
        }
    }
}

/// Escalating cooldown for consecutive rate-limit signals.
///
/// The cooldown never shrinks while signals keep arriving and never exceeds
/// the ceiling. [`ThrottleBackoff::reset`] restores the base cooldown.
#[derive(Debug, Clone)]
pub struct ThrottleBackoff {
    base: Duration,
    growth: f64,
    ceiling: Duration,
    escalate_after: u32,
    current: Duration,
    consecutive: u32,
}

impl ThrottleBackoff {
    /// Create from a policy.
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        let base = policy.rate_limit_cooldown.min(policy.rate_limit_ceiling);
        Self {
            base,
            growth: policy.rate_limit_growth.max(1.0),
            ceiling: policy.rate_limit_ceiling,
            escalate_after: policy.escalate_after,
            current: base,
            consecutive: 0,
        }
    }

    /// Register a signal and return how long to wait.
    ///
    /// A server hint raises the cooldown (up to the ceiling) but never lowers it.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        self.consecutive += 1;
        if self.consecutive > self.escalate_after {
            self.current = self.current.mul_f64(self.growth).min(self.ceiling);
        }
        if let Some(hint) = hint {
            self.current = self.current.max(hint.min(self.ceiling));
        }
        self.current
    }

    /// Consecutive signals since the last reset.
    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Forget the streak after a successful item.
    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.current = self.base;
    }
}

/// Capped exponential backoff for connectivity errors: `min(cap, base * 2^n)`.
#[derive(Debug, Clone)]
pub struct TransientBackoff {
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl TransientBackoff {
    /// Create from a policy.
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.connectivity_base,
            cap: policy.connectivity_cap,
            attempts: 0,
        }
    }

    /// Register a failure and return how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(16));
        self.attempts += 1;
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget the streak after a successful item.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// An account left out of the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    /// Handle, when the source reported one.
    pub id: Option<String>,
    /// Why it was skipped.
    pub reason: String,
}

/// Result of draining one source.
#[derive(Debug)]
pub struct CollectOutcome {
    /// Everything collected, in source order.
    pub collection: Collection,
    /// Accounts skipped as individually unreachable.
    pub skipped: Vec<SkippedItem>,
    /// Items the source produced, collected or skipped.
    pub observed: u64,
    /// The error that stopped draining early, if any.
    pub fatal: Option<SourceError>,
}

impl CollectOutcome {
    /// Whether the source was fully drained.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fatal.is_none()
    }

    /// Split into the collection and skip records, or the fatal error.
    pub fn into_result(self) -> Result<(Collection, Vec<SkippedItem>), SourceError> {
        match self.fatal {
            Some(err) => Err(err),
            None => Ok((self.collection, self.skipped)),
        }
    }
}

/// Drains item sources into complete collections.
#[derive(Debug, Clone, Default)]
pub struct Collector {
    policy: RetryPolicy,
}

impl Collector {
    /// Create a collector with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Pull every item from `source`, retrying throttles and connectivity
    /// errors, skipping unreachable accounts, and stopping on anything else.
    pub async fn collect(
        &self,
        source: &mut dyn ItemSource,
        label: &str,
        events: &EventSender,
    ) -> CollectOutcome {
        let total = source.expected_total();
        let every = self.policy.progress_every.max(1);
        let mut entities: Vec<Entity> = Vec::new();
        let mut skipped: Vec<SkippedItem> = Vec::new();
        let mut observed: u64 = 0;
        let mut throttle = ThrottleBackoff::new(&self.policy);
        let mut transient = TransientBackoff::new(&self.policy);
        let mut fatal = None;

        match total {
            Some(total) => events.log(format!("{label}: fetching (total {total})")),
            None => events.log(format!("{label}: fetching")),
        }

        while let Some(step) = source.next_item().await {
            let err = match step {
                Ok(entity) => {
                    entities.push(entity);
                    observed += 1;
                    throttle.reset();
                    transient.reset();
                    let count = entities.len() as u64;
                    if count % every == 0 {
                        events.progress(label, count, total);
                    }
                    continue;
                }
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Throttle => {
                    let hint = match &err {
                        SourceError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = throttle.next_delay(hint);
                    warn!(
                        label,
                        retry = throttle.consecutive(),
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Rate limited"
                    );
                    events.log(format!(
                        "[RATE-LIMIT] {err}; waiting {}s before retrying (attempt {})",
                        delay.as_secs(),
                        throttle.consecutive()
                    ));
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::Transient => {
                    if let Some(max) = self.policy.connectivity_max_retries {
                        if transient.attempts() >= max {
                            error!(label, retry = transient.attempts(), error = %err, "Connection retries exhausted");
                            events.log(format!(
                                "[ERROR] {label}: giving up after {max} connection retries: {err}"
                            ));
                            fatal = Some(err);
                            break;
                        }
                    }
                    let delay = transient.next_delay();
                    warn!(
                        label,
                        retry = transient.attempts(),
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Connection error"
                    );
                    events.log(format!(
                        "[WARN] {err}; retrying in {}s (attempt {})",
                        delay.as_secs(),
                        transient.attempts()
                    ));
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::Skippable => {
                    observed += 1;
                    let id = match &err {
                        SourceError::ItemUnavailable { id, .. } => Some(id.clone()),
                        _ => None,
                    };
                    warn!(label, id = ?id, error = %err, "Skipping unavailable account");
                    events.log(format!("[SKIP] skipping unavailable account: {err}"));
                    skipped.push(SkippedItem {
                        id,
                        reason: err.to_string(),
                    });
                }
                ErrorClass::Fatal => {
                    error!(label, collected = entities.len(), error = %err, "Collection aborted");
                    events.log(format!("[ERROR] {label}: {err}"));
                    fatal = Some(err);
                    break;
                }
            }
        }

        let count = entities.len() as u64;
        if fatal.is_none() {
            let final_current = total.map_or(count, |total| total.max(count));
            events.progress(label, final_current, total);
            events.log(completion_line(label, count, total, skipped.len()));
            info!(
                label,
                collected = count,
                skipped = skipped.len(),
                expected = ?total,
                "Collection complete"
            );
        }

        CollectOutcome {
            collection: Collection::new(entities, total),
            skipped,
            observed,
            fatal,
        }
    }
}

fn completion_line(label: &str, count: u64, total: Option<u64>, skipped: usize) -> String {
    match total {
        Some(total) if count < total => format!(
            "{label} complete: {count}/{total} ({} skipped)",
            total - count
        ),
        Some(total) => format!("{label} complete: {count}/{total}"),
        None if skipped > 0 => format!("{label} complete: {count} total ({skipped} skipped)"),
        None => format!("{label} complete: {count} total"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, Observed, RunEvent};
    use crate::source::MemorySource;

    fn entity(id: &str) -> Entity {
        Entity::new(id, id.to_uppercase())
    }

    async fn drain(rx: &mut crate::events::EventReceiver) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(Some(observed)) =
            tokio::time::timeout(Duration::from_millis(1), rx.next()).await
        {
            match observed {
                Observed::Event(e) | Observed::Terminal(e) => events.push(e),
                Observed::Disconnected => break,
            }
        }
        events
    }

    #[test]
    fn test_throttle_escalation_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            rate_limit_cooldown: Duration::from_secs(100),
            rate_limit_growth: 2.0,
            rate_limit_ceiling: Duration::from_secs(300),
            escalate_after: 1,
            ..RetryPolicy::default()
        };
        let mut backoff = ThrottleBackoff::new(&policy);

        let delays: Vec<_> = (0..3).map(|_| backoff.next_delay(None)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(100),
                Duration::from_secs(200),
                Duration::from_secs(300)
            ]
        );
        assert!(delays.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(backoff.next_delay(None), Duration::from_secs(300));

        backoff.reset();
        assert_eq!(backoff.consecutive(), 0);
        assert_eq!(backoff.next_delay(None), Duration::from_secs(100));
    }

    #[test]
    fn test_throttle_default_policy_sequence() {
        let mut backoff = ThrottleBackoff::new(&RetryPolicy::default());
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay(None)).collect();
        assert!(delays.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(delays[0], Duration::from_secs(180));
        assert_eq!(delays[3], Duration::from_secs(180));
        assert_eq!(delays[4], Duration::from_secs(270));
        assert_eq!(delays[7], Duration::from_secs(300));
    }

    #[test]
    fn test_throttle_hint_never_lowers() {
        let mut backoff = ThrottleBackoff::new(&RetryPolicy::default());
        assert_eq!(
            backoff.next_delay(Some(Duration::from_secs(240))),
            Duration::from_secs(240)
        );
        assert_eq!(backoff.next_delay(None), Duration::from_secs(240));
        assert_eq!(
            backoff.next_delay(Some(Duration::from_secs(3600))),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_transient_backoff() {
        let mut backoff = TransientBackoff::new(&RetryPolicy::default());
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 48, 60]);
        assert_eq!(backoff.attempts(), 6);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_never_fail_the_collection() {
        let mut steps: Vec<Result<Entity, SourceError>> = Vec::new();
        for i in 0..20 {
            if i % 5 == 0 {
                steps.push(Err(SourceError::ItemUnavailable {
                    id: format!("ghost{i}"),
                    reason: "private".into(),
                }));
            } else {
                steps.push(Ok(entity(&format!("u{i}"))));
            }
        }
        let mut source = MemorySource::scripted(steps, Some(20));
        let (tx, mut rx) = event_channel("alice");

        let outcome = Collector::default()
            .collect(&mut source, "following", &tx)
            .await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.collection.len(), 16);
        assert_eq!(outcome.skipped.len(), 4);
        assert_eq!(outcome.observed, 20);
        assert_eq!(
            outcome.collection.len() as u64 + outcome.skipped.len() as u64,
            outcome.observed
        );

        let events = drain(&mut rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::Log { text } if text == "following complete: 16/20 (4 skipped)"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_only_skip_is_recognised() {
        let mut source = MemorySource::scripted(
            vec![
                Ok(entity("a")),
                Err(SourceError::Other("Profile does not exist".into())),
                Ok(entity("b")),
            ],
            None,
        );
        let (tx, _rx) = event_channel("alice");

        let outcome = Collector::default().collect(&mut source, "followers", &tx).await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.collection.len(), 2);
        assert_eq!(outcome.skipped[0].id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_and_transient_are_retried() {
        let mut source = MemorySource::scripted(
            vec![
                Ok(entity("a")),
                Err(SourceError::RateLimited { retry_after: None }),
                Err(SourceError::RateLimited { retry_after: None }),
                Ok(entity("b")),
                Err(SourceError::Connectivity("reset".into())),
                Err(SourceError::Connectivity("reset".into())),
                Ok(entity("c")),
            ],
            Some(3),
        );
        let (tx, mut rx) = event_channel("alice");
        let started = tokio::time::Instant::now();

        let outcome = Collector::default().collect(&mut source, "following", &tx).await;

        assert!(outcome.is_complete());
        let ids: Vec<_> = outcome.collection.keys().collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(outcome.skipped.is_empty());
        // two 180s cooldowns plus 3s + 6s of connection backoff
        assert_eq!(started.elapsed(), Duration::from_secs(369));

        let events = drain(&mut rx).await;
        let rate_logs = events
            .iter()
            .filter(|e| matches!(e, RunEvent::Log { text } if text.starts_with("[RATE-LIMIT]")))
            .count();
        assert_eq!(rate_logs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_limit_is_fatal() {
        let policy = RetryPolicy {
            connectivity_max_retries: Some(2),
            ..RetryPolicy::default()
        };
        let mut source = MemorySource::scripted(
            vec![
                Ok(entity("a")),
                Err(SourceError::Connectivity("down".into())),
                Err(SourceError::Connectivity("down".into())),
                Err(SourceError::Connectivity("down".into())),
                Ok(entity("b")),
            ],
            None,
        );
        let (tx, _rx) = event_channel("alice");

        let outcome = Collector::new(policy).collect(&mut source, "following", &tx).await;

        assert!(matches!(outcome.fatal, Some(SourceError::Connectivity(_))));
        assert_eq!(outcome.collection.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_keeps_partial_collection() {
        let mut source = MemorySource::scripted(
            vec![
                Ok(entity("a")),
                Ok(entity("b")),
                Err(SourceError::Other("unexpected payload".into())),
                Ok(entity("c")),
            ],
            Some(3),
        );
        let (tx, mut rx) = event_channel("alice");

        let outcome = Collector::default().collect(&mut source, "following", &tx).await;

        assert_eq!(outcome.collection.len(), 2);
        assert_eq!(source.remaining(), 1);
        assert!(!outcome.is_complete());
        assert!(outcome.into_result().is_err());

        let events = drain(&mut rx).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, RunEvent::Log { text } if text.contains("complete"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_cadence_and_final_line() {
        let entities: Vec<_> = (0..25).map(|i| entity(&format!("u{i}"))).collect();
        let mut source = MemorySource::from_entities(entities, Some(25));
        let (tx, mut rx) = event_channel("alice");

        Collector::default().collect(&mut source, "followers", &tx).await;

        let events = drain(&mut rx).await;
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Progress { current, .. } => Some(*current),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 20, 25]);
        assert!(matches!(
            events.last(),
            Some(RunEvent::Log { text }) if text == "followers complete: 25/25"
        ));
    }
}
