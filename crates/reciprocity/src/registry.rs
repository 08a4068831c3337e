//! Per-handle run state.
//!
//! One registry per process, owned by the dispatcher and passed to whoever
//! needs it. A handle has at most one active run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::RunError;
use crate::events::{EventReceiver, Observed};

/// Single-slot handoff for a second-factor code.
///
/// Writers replace whatever is pending. The reader suspends until a code is
/// present and takes it, leaving the slot empty.
#[derive(Debug, Clone)]
pub struct SecondFactorSlot {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for SecondFactorSlot {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl SecondFactorSlot {
    /// Store a code, replacing any pending one.
    pub fn submit(&self, code: impl Into<String>) {
        self.tx.send_replace(Some(code.into()));
    }

    /// Drop any pending code.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Whether a code is waiting to be taken.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Whether a run is suspended in [`SecondFactorSlot::wait`] with no code
    /// to take.
    #[must_use]
    pub fn is_awaited(&self) -> bool {
        self.tx.receiver_count() > 0 && !self.is_pending()
    }

    fn take(&self) -> Option<String> {
        let mut taken = None;
        self.tx.send_if_modified(|slot| {
            taken = slot.take();
            false
        });
        taken
    }

    /// Wait for a code and take it. No timeout.
    pub async fn wait(&self) -> Option<String> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(code) = self.take() {
                return Some(code);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

#[derive(Debug)]
struct RunSlot {
    run: u64,
    password: Option<String>,
    second_factor: SecondFactorSlot,
    receiver: Option<EventReceiver>,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Finished {
    run: u64,
    receiver: Option<EventReceiver>,
}

#[derive(Debug, Default)]
struct Inner {
    next_run: u64,
    active: HashMap<String, RunSlot>,
    finished: HashMap<String, Finished>,
}

/// Registry of active runs, keyed by handle. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl RunRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a handle as running.
    ///
    /// Fails without touching anything if the handle already has a run.
    pub fn begin(&self, handle: &str, password: Option<String>) -> Result<RunGuard, RunError> {
        let mut inner = self.inner.lock();
        if inner.active.contains_key(handle) {
            return Err(RunError::AlreadyRunning(handle.to_string()));
        }
        inner.finished.remove(handle);
        inner.next_run += 1;
        let run = inner.next_run;
        let second_factor = SecondFactorSlot::default();
        inner.active.insert(
            handle.to_string(),
            RunSlot {
                run,
                password,
                second_factor: second_factor.clone(),
                receiver: None,
                started_at: Utc::now(),
            },
        );
        debug!(handle, "Run registered");
        Ok(RunGuard {
            registry: self.clone(),
            handle: handle.to_string(),
            second_factor,
        })
    }

    /// Whether a run is active for the handle.
    #[must_use]
    pub fn is_active(&self, handle: &str) -> bool {
        self.inner.lock().active.contains_key(handle)
    }

    /// Active handles with their start times.
    #[must_use]
    pub fn active(&self) -> Vec<(String, DateTime<Utc>)> {
        let inner = self.inner.lock();
        let mut runs: Vec<_> = inner
            .active
            .iter()
            .map(|(handle, slot)| (handle.clone(), slot.started_at))
            .collect();
        runs.sort();
        runs
    }

    /// Hand a second-factor code to the run for `handle`.
    pub fn submit_second_factor(&self, handle: &str, code: &str) -> Result<(), RunError> {
        let inner = self.inner.lock();
        let slot = inner
            .active
            .get(handle)
            .ok_or_else(|| RunError::NotRunning(handle.to_string()))?;
        slot.second_factor.submit(code);
        Ok(())
    }

    /// Hold the observer half of a run's channel until someone subscribes.
    pub fn park_receiver(&self, handle: &str, receiver: EventReceiver) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.active.get_mut(handle) {
            slot.receiver = Some(receiver);
        } else if let Some(finished) = inner.finished.get_mut(handle) {
            finished.receiver = Some(receiver);
        }
    }

    /// Claim the event stream for `handle`, if nobody holds it.
    ///
    /// A run that ended before anyone subscribed still hands over its
    /// buffered events, terminal event included. A run suspended on a
    /// second factor repeats its request to the new subscriber.
    pub fn subscribe(&self, handle: &str) -> Option<Subscription> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (run, receiver) = match inner.active.get_mut(handle) {
            Some(slot) => {
                let mut receiver = slot.receiver.take()?;
                if slot.second_factor.is_awaited() {
                    receiver.replay_prompt();
                }
                (slot.run, receiver)
            }
            None => {
                let finished = inner.finished.get_mut(handle)?;
                (finished.run, finished.receiver.take()?)
            }
        };
        debug!(handle, run, "Event stream claimed");
        Some(Subscription {
            registry: self.clone(),
            handle: handle.to_string(),
            run,
            receiver: Some(receiver),
        })
    }

    /// Put an unfinished stream back so the next subscriber picks it up.
    ///
    /// Dropped if the run it belongs to is no longer the handle's latest.
    fn release(&self, handle: &str, run: u64, receiver: EventReceiver) {
        if receiver.is_finished() {
            return;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let vacant = match inner.active.get_mut(handle) {
            Some(slot) if slot.run == run => &mut slot.receiver,
            Some(_) => return,
            None => match inner.finished.get_mut(handle) {
                Some(finished) if finished.run == run => &mut finished.receiver,
                _ => return,
            },
        };
        if vacant.is_none() {
            *vacant = Some(receiver);
            debug!(handle, run, "Event stream released");
        }
    }

    fn finish(&self, handle: &str) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.active.remove(handle) {
            inner.finished.insert(
                handle.to_string(),
                Finished {
                    run: slot.run,
                    receiver: slot.receiver,
                },
            );
        }
        debug!(handle, "Run released");
    }
}

/// A claimed event stream.
///
/// Dropping it before the terminal event hands the stream back to the
/// registry, so an observer that reconnects resumes where this one stopped.
#[derive(Debug)]
pub struct Subscription {
    registry: RunRegistry,
    handle: String,
    run: u64,
    receiver: Option<EventReceiver>,
}

impl Subscription {
    /// Handle of the run being observed.
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Wait for the next event. See [`EventReceiver::next`].
    pub async fn next(&mut self) -> Option<Observed> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.next().await,
            None => None,
        }
    }

    /// Turn the subscription into a stream of observations.
    pub fn into_stream(self) -> impl futures::Stream<Item = Observed> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|observed| (observed, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            self.registry.release(&self.handle, self.run, receiver);
        }
    }
}

/// Proof that a run owns its handle. Releases the handle on drop.
#[derive(Debug)]
pub struct RunGuard {
    registry: RunRegistry,
    handle: String,
    second_factor: SecondFactorSlot,
}

impl RunGuard {
    /// Handle this run owns.
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Second-factor handoff for this run.
    #[must_use]
    pub fn second_factor(&self) -> &SecondFactorSlot {
        &self.second_factor
    }

    /// Take the password out of the registry. Later calls return `None`.
    pub fn take_password(&self) -> Option<String> {
        self.registry
            .inner
            .lock()
            .active
            .get_mut(&self.handle)
            .and_then(|slot| slot.password.take())
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::{event_channel, Observed, RunEvent};

    #[test]
    fn test_second_start_rejected_without_side_effects() {
        let registry = RunRegistry::new();
        let guard = registry.begin("alice", Some("pw".into())).unwrap();
        let (_tx, rx) = event_channel("alice");
        registry.park_receiver("alice", rx);

        let err = registry.begin("alice", Some("other".into())).unwrap_err();
        assert!(matches!(err, RunError::AlreadyRunning(h) if h == "alice"));

        assert_eq!(guard.take_password().as_deref(), Some("pw"));
        assert!(guard.take_password().is_none());
        assert!(registry.subscribe("alice").is_some());
    }

    #[test]
    fn test_guard_drop_releases_handle() {
        let registry = RunRegistry::new();
        let guard = registry.begin("alice", None).unwrap();
        assert!(registry.is_active("alice"));
        drop(guard);
        assert!(!registry.is_active("alice"));
        assert!(registry.begin("alice", None).is_ok());
    }

    #[tokio::test]
    async fn test_unclaimed_receiver_survives_run() {
        let registry = RunRegistry::new();
        let guard = registry.begin("alice", None).unwrap();
        let (tx, rx) = event_channel("alice");
        registry.park_receiver("alice", rx);
        tx.fail("nope");
        drop(guard);

        let mut rx = registry.subscribe("alice").unwrap();
        assert!(matches!(rx.next().await, Some(Observed::Terminal(_))));
        assert!(registry.subscribe("alice").is_none());
        drop(rx);
        assert!(registry.subscribe("alice").is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_resumes_with_prompt() {
        let registry = RunRegistry::new();
        let guard = registry.begin("alice", None).unwrap();
        let (tx, rx) = event_channel("alice");
        registry.park_receiver("alice", rx);

        let mut first = registry.subscribe("alice").unwrap();
        assert!(registry.subscribe("alice").is_none());
        tx.request_second_factor();
        assert_eq!(
            first.next().await,
            Some(Observed::Event(RunEvent::RequestSecondFactor))
        );

        let slot = guard.second_factor().clone();
        let waiter = tokio::spawn(async move { slot.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        let mut second = registry.subscribe("alice").unwrap();
        assert_eq!(
            second.next().await,
            Some(Observed::Event(RunEvent::RequestSecondFactor))
        );
        registry.submit_second_factor("alice", "123456").unwrap();
        assert_eq!(waiter.await.unwrap().as_deref(), Some("123456"));

        tx.fail("stop");
        drop(guard);
        assert!(matches!(second.next().await, Some(Observed::Terminal(_))));
    }

    #[test]
    fn test_stale_subscription_is_not_returned_to_newer_run() {
        let registry = RunRegistry::new();
        let guard = registry.begin("alice", None).unwrap();
        let (_old_tx, old_rx) = event_channel("alice");
        registry.park_receiver("alice", old_rx);
        let stale = registry.subscribe("alice").unwrap();
        drop(guard);

        let _guard = registry.begin("alice", None).unwrap();
        let (new_tx, new_rx) = event_channel("alice");
        registry.park_receiver("alice", new_rx);
        let current = registry.subscribe("alice").unwrap();
        drop(stale);
        assert!(registry.subscribe("alice").is_none());

        drop(current);
        assert!(registry.subscribe("alice").is_some());
        drop(new_tx);
    }

    #[test]
    fn test_submit_requires_active_run() {
        let registry = RunRegistry::new();
        assert!(matches!(
            registry.submit_second_factor("ghost", "123456"),
            Err(RunError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_second_factor_wait_suspends_until_submit() {
        let registry = RunRegistry::new();
        let guard = registry.begin("alice", None).unwrap();
        let slot = guard.second_factor().clone();

        let waiter = tokio::spawn(async move { slot.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.submit_second_factor("alice", "111111").unwrap();
        assert_eq!(waiter.await.unwrap().as_deref(), Some("111111"));
        assert!(!guard.second_factor().is_pending());
    }

    #[tokio::test]
    async fn test_second_factor_last_write_wins() {
        let slot = SecondFactorSlot::default();
        slot.submit("111111");
        slot.submit("222222");
        assert_eq!(slot.wait().await.as_deref(), Some("222222"));

        slot.submit("333333");
        slot.clear();
        assert!(!slot.is_pending());
    }
}
