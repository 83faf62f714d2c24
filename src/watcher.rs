use crate::executor::ExecutionOutcome;
use crate::probe::{CheckTarget, Probe};
use crate::sequence::SequenceId;
use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Unknown,
    Checking { since: DateTime<Local> },
    Available { at: DateTime<Local> },
    Unavailable { at: DateTime<Local>, reason: String },
}

impl ResourceState {
    pub fn is_available(&self) -> bool {
        matches!(self, ResourceState::Available { .. })
    }
}

/// Snapshot published to observers: one entry per sequence ever checked.
pub type ResourceStates = HashMap<SequenceId, ResourceState>;

/// Result of the post-knock check loop.
#[derive(Debug)]
pub struct Verification {
    pub state: ResourceState,
    /// Automatic re-knocks issued after the first failed check.
    pub reknocks: u32,
    /// Outcome of the last re-knock, if any was made.
    pub last_outcome: Option<ExecutionOutcome>,
}

struct Inner<P> {
    probe: P,
    states: watch::Sender<ResourceStates>,
    verifying: Mutex<HashSet<SequenceId>>,
}

/// Who asked for a check. Polls never overwrite a running verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOrigin {
    Poll,
    Direct,
}

impl<P: Probe> Inner<P> {
    fn publish(&self, id: SequenceId, state: ResourceState) {
        self.states.send_modify(|states| {
            states.insert(id, state);
        });
    }

    /// Publishes unless a verification owns `id`. The verifying lock is held
    /// across the publish so a verification cannot start in between.
    fn publish_polled(&self, id: SequenceId, state: ResourceState) -> bool {
        let verifying = self.verifying.lock().unwrap_or_else(PoisonError::into_inner);
        if verifying.contains(&id) {
            return false;
        }
        self.publish(id, state);
        true
    }

    async fn check(&self, id: SequenceId, target: &CheckTarget, origin: CheckOrigin) -> ResourceState {
        let checking = ResourceState::Checking { since: Local::now() };
        match origin {
            CheckOrigin::Poll => {
                self.publish_polled(id, checking);
            }
            CheckOrigin::Direct => self.publish(id, checking),
        }

        let result = match tokio::time::timeout(target.timeout, self.probe.probe(&target.target, target.timeout)).await {
            Ok(result) => result,
            Err(_) => Err(format!("no answer within {}s", target.timeout.as_secs())),
        };

        let state = match result {
            Ok(()) => ResourceState::Available { at: Local::now() },
            Err(reason) => {
                log::debug!("Sequence {}: {} unavailable: {}", id, target.target, reason);
                ResourceState::Unavailable { at: Local::now(), reason }
            }
        };
        match origin {
            CheckOrigin::Poll => {
                if !self.publish_polled(id, state.clone()) {
                    log::debug!("Sequence {}: poll result dropped, verification in progress", id);
                }
            }
            CheckOrigin::Direct => self.publish(id, state.clone()),
        }
        state
    }

    fn is_verifying(&self, id: SequenceId) -> bool {
        self.verifying.lock().unwrap_or_else(PoisonError::into_inner).contains(&id)
    }
}

/// Clears the "verifying" mark even if the verification future is dropped.
struct VerifyingGuard<'a> {
    verifying: &'a Mutex<HashSet<SequenceId>>,
    id: SequenceId,
}

impl Drop for VerifyingGuard<'_> {
    fn drop(&mut self) {
        self.verifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Tracks reachability of the resources that knocks unlock.
///
/// Background polling is opt-in per sequence through [`watch`](Self::watch);
/// dropping the watcher stops every poller.
pub struct AccessWatcher<P> {
    inner: Arc<Inner<P>>,
    period: Duration,
    pollers: Mutex<HashMap<SequenceId, JoinHandle<()>>>,
}

impl<P: Probe + 'static> AccessWatcher<P> {
    pub fn new(probe: P, period: Duration) -> Self {
        let (states, _) = watch::channel(ResourceStates::new());
        Self {
            inner: Arc::new(Inner {
                probe,
                states,
                verifying: Mutex::new(HashSet::new()),
            }),
            period: period.max(Duration::from_millis(1)),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceStates> {
        self.inner.states.subscribe()
    }

    pub fn state(&self, id: SequenceId) -> ResourceState {
        self.inner
            .states
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or(ResourceState::Unknown)
    }

    pub fn is_watching(&self, id: SequenceId) -> bool {
        self.pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts (or restarts) polling `target` for `id`, or stops polling when
    /// `target` is `None`.
    pub fn watch(&self, id: SequenceId, target: Option<CheckTarget>) {
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pollers.remove(&id) {
            previous.abort();
            log::debug!("Stopped polling sequence {}", id);
        }

        let Some(target) = target else { return };
        let inner = Arc::clone(&self.inner);
        let period = self.period;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if inner.is_verifying(id) {
                    continue;
                }
                inner.check(id, &target, CheckOrigin::Poll).await;
            }
        });
        log::debug!("Polling sequence {} every {:?}", id, period);
        pollers.insert(id, handle);
    }

    pub fn unwatch_all(&self) {
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in pollers.drain() {
            handle.abort();
        }
    }

    /// One probe right now, published like a poll tick.
    pub async fn check(&self, id: SequenceId, target: &CheckTarget) -> ResourceState {
        self.inner.check(id, target, CheckOrigin::Direct).await
    }

    /// Post-knock loop: probe, and while unavailable re-knock up to `retries`
    /// times, probing after each. Stops early on success or a cancelled knock.
    /// A second call for the same id while one is running returns the current
    /// state without probing.
    pub async fn verify_after_knock<F, Fut>(
        &self,
        id: SequenceId,
        target: &CheckTarget,
        retries: u32,
        mut reknock: F,
    ) -> Verification
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExecutionOutcome>,
    {
        let newly_marked = self
            .inner
            .verifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        if !newly_marked {
            log::debug!("Sequence {} is already being verified", id);
            return Verification {
                state: self.state(id),
                reknocks: 0,
                last_outcome: None,
            };
        }
        let _guard = VerifyingGuard {
            verifying: &self.inner.verifying,
            id,
        };

        let mut state = self.inner.check(id, target, CheckOrigin::Direct).await;
        let mut reknocks = 0;
        let mut last_outcome = None;

        while !state.is_available() && reknocks < retries {
            reknocks += 1;
            log::info!("Sequence {}: resource unavailable, re-knock {}/{}", id, reknocks, retries);

            let outcome = reknock().await;
            let cancelled = outcome.is_cancelled();
            last_outcome = Some(outcome);
            if cancelled {
                break;
            }
            state = self.inner.check(id, target, CheckOrigin::Direct).await;
        }

        Verification {
            state,
            reknocks,
            last_outcome,
        }
    }
}

impl<P> Drop for AccessWatcher<P> {
    fn drop(&mut self) {
        let pollers = self.pollers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in pollers.drain() {
            handle.abort();
        }
    }
}
