use crate::config::Settings;
use crate::dns::{DnsResolver, Resolve};
use crate::error::KnockError;
use crate::events::{EventKind, EventLogger, LogEvent};
use crate::executor::{CancelToken, ExecutionOutcome, Executor, ExecutorConfig, StepStatus};
use crate::probe::{CheckTarget, NetworkProbe, Probe};
use crate::public_ip::PublicIpDetector;
use crate::sequence::{Sequence, SequenceId};
use crate::store::{self, SequenceStore};
use crate::transport::{SocketTransport, Transport};
use crate::watcher::{AccessWatcher, ResourceState, Verification};
use chrono::Local;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Knocker on real sockets and the system resolver.
pub type SystemKnocker = Knocker<DnsResolver, SocketTransport, NetworkProbe>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KnockOptions {
    /// Run the post-knock check even when the sequence has it disabled.
    pub force_verify: bool,
}

#[derive(Debug)]
pub struct KnockReport {
    pub outcome: ExecutionOutcome,
    pub verification: Option<Verification>,
    pub public_ips: Vec<IpAddr>,
}

/// Entry point for callers: looks sequences up by id, runs them, drives the
/// watcher and reports to the event log.
pub struct Knocker<R, T, P> {
    executor: Executor<R, T>,
    watcher: AccessWatcher<P>,
    store: Arc<dyn SequenceStore>,
    events: Arc<dyn EventLogger>,
    public_ip: Option<PublicIpDetector>,
    runs: Mutex<HashMap<SequenceId, CancelToken>>,
}

impl SystemKnocker {
    pub fn from_settings(settings: &Settings, store: Arc<dyn SequenceStore>, events: Arc<dyn EventLogger>) -> Self {
        let executor = Executor::new(
            DnsResolver::new(settings.resolve_timeout()),
            SocketTransport::new(),
            ExecutorConfig::from_settings(settings),
        );
        let probe = NetworkProbe::new(DnsResolver::new(settings.resolve_timeout()));
        let watcher = AccessWatcher::new(probe, settings.resource_check_period());

        let knocker = Self::new(executor, watcher, store, events);
        if settings.detect_public_ip {
            knocker.with_public_ip(PublicIpDetector::from_settings(settings))
        } else {
            knocker
        }
    }
}

impl<R, T, P> Knocker<R, T, P>
where
    R: Resolve,
    T: Transport,
    P: Probe + 'static,
{
    pub fn new(
        executor: Executor<R, T>,
        watcher: AccessWatcher<P>,
        store: Arc<dyn SequenceStore>,
        events: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            executor,
            watcher,
            store,
            events,
            public_ip: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_public_ip(mut self, detector: PublicIpDetector) -> Self {
        self.public_ip = Some(detector);
        self
    }

    pub fn executor(&self) -> &Executor<R, T> {
        &self.executor
    }

    pub fn watcher(&self) -> &AccessWatcher<P> {
        &self.watcher
    }

    pub fn store(&self) -> &dyn SequenceStore {
        self.store.as_ref()
    }

    fn find(&self, id: SequenceId) -> Result<Sequence, KnockError> {
        self.store.find(id)?.ok_or(KnockError::SequenceNotFound(id))
    }

    pub async fn knock(&self, id: SequenceId) -> Result<KnockReport, KnockError> {
        self.knock_with(id, KnockOptions::default()).await
    }

    /// Runs the sequence `id`. A knock already in flight for the same id is
    /// cancelled first. Only lookup failures are returned as `Err`; run
    /// failures are in the report's outcome.
    pub async fn knock_with(&self, id: SequenceId, options: KnockOptions) -> Result<KnockReport, KnockError> {
        let sequence = self.find(id)?;
        let token = self.begin_run(id);

        let outcome = self.executor.run(&sequence, &token).await;
        self.log_outcome(&sequence, &outcome);

        if outcome.error.is_some() {
            self.end_run(id, &token);
            return Ok(KnockReport {
                outcome,
                verification: None,
                public_ips: Vec::new(),
            });
        }

        let detect = async {
            match &self.public_ip {
                Some(detector) => detector.detect_for(&outcome.addresses).await,
                None => Vec::new(),
            }
        };
        let verify = self.verify(&sequence, &token, options);
        let (public_ips, verification) = tokio::join!(detect, verify);
        self.end_run(id, &token);

        if outcome.sent_count() > 0 {
            let public_ips: Vec<String> = public_ips.iter().map(ToString::to_string).collect();
            let addresses: Vec<String> = outcome.addresses.iter().map(ToString::to_string).collect();
            self.events
                .log(LogEvent::knock(&outcome.name, &outcome.host, &public_ips, &addresses));
        }

        Ok(KnockReport {
            outcome,
            verification,
            public_ips,
        })
    }

    async fn verify(&self, sequence: &Sequence, token: &CancelToken, options: KnockOptions) -> Option<Verification> {
        if !(sequence.check.enabled || options.force_verify) {
            return None;
        }
        let id = sequence.id?;
        let Some(target) = CheckTarget::from_sequence(sequence) else {
            log::warn!("{}: resource check has no usable target", sequence.display_name());
            return None;
        };

        let retries = sequence.check.knock_retries();
        let verification = self
            .watcher
            .verify_after_knock(id, &target, retries, move || async move {
                let outcome = self.executor.run(sequence, token).await;
                log::debug!("{}: re-knock finished in {:?}", outcome.name, outcome.duration());
                outcome
            })
            .await;
        Some(verification)
    }

    fn begin_run(&self, id: SequenceId) -> CancelToken {
        let token = CancelToken::new();
        let previous = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        if let Some(previous) = previous {
            log::info!("Sequence {}: cancelling the knock in progress", id);
            previous.cancel();
        }
        token
    }

    fn end_run(&self, id: SequenceId, token: &CancelToken) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if runs.get(&id).is_some_and(|current| current.same_as(token)) {
            runs.remove(&id);
        }
    }

    /// Cancels the knock running for `id`; `false` if there was none.
    pub fn cancel(&self, id: SequenceId) -> bool {
        let token = self.runs.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Starts or stops background checks for `id`. Returns whether the
    /// sequence is now polled; sequences without a check are never polled.
    pub fn watch(&self, id: SequenceId, enabled: bool) -> Result<bool, KnockError> {
        let sequence = self.find(id)?;
        let target = if enabled && sequence.check.enabled {
            CheckTarget::from_sequence(&sequence)
        } else {
            None
        };
        let watching = target.is_some();
        self.watcher.watch(id, target);
        Ok(watching)
    }

    /// Checks the resource of `id` once, whether or not its check is enabled.
    pub async fn check(&self, id: SequenceId) -> Result<ResourceState, KnockError> {
        let sequence = self.find(id)?;
        match CheckTarget::from_sequence(&sequence) {
            Some(target) => Ok(self.watcher.check(id, &target).await),
            None => Ok(ResourceState::Unavailable {
                at: Local::now(),
                reason: "no port configured for the check".to_string(),
            }),
        }
    }

    pub fn save(&self, sequence: Sequence) -> Result<SequenceId, KnockError> {
        let name = sequence.display_name();
        let id = self.store.save(sequence)?;
        self.events.log(LogEvent::new(EventKind::SequenceSaved, [name]));
        Ok(id)
    }

    pub fn delete(&self, id: SequenceId) -> Result<bool, KnockError> {
        let sequence = self.find(id)?;
        self.cancel(id);
        self.watcher.watch(id, None);
        let deleted = self.store.delete(id)?;
        if deleted {
            self.events
                .log(LogEvent::new(EventKind::SequenceDeleted, [sequence.display_name()]));
        }
        Ok(deleted)
    }

    pub fn export(&self, path: &Path) -> Result<usize, KnockError> {
        let file = path.display().to_string();
        match store::export_sequences(self.store.as_ref(), path) {
            Ok(count) => {
                self.events
                    .log(LogEvent::new(EventKind::Export, [file, count.to_string()]));
                Ok(count)
            }
            Err(e) => {
                self.events
                    .log(LogEvent::new(EventKind::ErrorExport, [file, e.to_string()]));
                Err(e.into())
            }
        }
    }

    pub fn import(&self, path: &Path) -> Result<usize, KnockError> {
        let file = path.display().to_string();
        match store::import_sequences(self.store.as_ref(), path) {
            Ok(count) => {
                self.events
                    .log(LogEvent::new(EventKind::Import, [file, count.to_string()]));
                Ok(count)
            }
            Err(e) => {
                self.events
                    .log(LogEvent::new(EventKind::ErrorImport, [file, e.to_string()]));
                Err(e.into())
            }
        }
    }

    fn log_outcome(&self, sequence: &Sequence, outcome: &ExecutionOutcome) {
        let name = sequence.display_name();
        match &outcome.error {
            Some(KnockError::Cancelled) => {
                self.events.log(LogEvent::new(EventKind::Cancelled, [name]));
            }
            Some(error) => {
                self.events.log(LogEvent::new(
                    error.event_kind(),
                    [name, sequence.host.clone(), error.to_string()],
                ));
            }
            None => {
                for step in &outcome.steps {
                    if let StepStatus::Failed { reason, .. } = &step.status {
                        let address = step.address.map(|a| a.to_string()).unwrap_or_default();
                        self.events.log(LogEvent::new(
                            EventKind::ErrorNetwork,
                            [name.clone(), address, format!("step {}: {}", step.index + 1, reason)],
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::sequence::{CheckAccess, SequenceStep};
    use crate::store::MemoryStore;
    use crate::testing::{FakeResolver, RecordingTransport, ScriptedProbe};
    use std::time::Duration;

    type TestKnocker = Knocker<FakeResolver, RecordingTransport, ScriptedProbe>;

    fn knocker(resolver: FakeResolver, probe: ScriptedProbe, sequences: Vec<Sequence>) -> (TestKnocker, Arc<MemoryEventLog>) {
        let events = Arc::new(MemoryEventLog::new());
        let knocker = Knocker::new(
            Executor::new(resolver, RecordingTransport::new(), ExecutorConfig::default()),
            AccessWatcher::new(probe, Duration::from_secs(60)),
            Arc::new(MemoryStore::with_sequences(sequences)),
            events.clone(),
        );
        (knocker, events)
    }

    fn ssh(delay: u32) -> Sequence {
        let mut sequence = Sequence::new("ssh", "10.0.0.5", vec![SequenceStep::udp(7000), SequenceStep::tcp(8000)]);
        sequence.delay = Some(delay);
        sequence
    }

    fn with_port_check(mut sequence: Sequence, retries: u32) -> Sequence {
        sequence.check = CheckAccess {
            enabled: true,
            port: Some(22),
            post_knock: true,
            retries,
            ..CheckAccess::default()
        };
        sequence
    }

    #[tokio::test]
    async fn test_unknown_sequence() {
        let (knocker, _) = knocker(FakeResolver::with(&["10.0.0.5"]), ScriptedProbe::always(Ok(())), vec![]);
        assert!(matches!(knocker.knock(9).await, Err(KnockError::SequenceNotFound(9))));
        assert!(matches!(knocker.watch(9, true), Err(KnockError::SequenceNotFound(9))));
    }

    #[tokio::test]
    async fn test_successful_knock_is_logged() {
        let (knocker, events) = knocker(FakeResolver::with(&["10.0.0.5"]), ScriptedProbe::always(Ok(())), vec![ssh(0)]);

        let report = knocker.knock(1).await.unwrap();
        assert!(report.outcome.success);
        assert!(report.verification.is_none());

        let logged = events.events();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].kind, EventKind::Knock);
        assert_eq!(logged[0].args, vec!["ssh", "10.0.0.5", "", "10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_resolve_error_is_logged_and_not_verified() {
        let (knocker, events) = knocker(
            FakeResolver::failing(),
            ScriptedProbe::always(Ok(())),
            vec![with_port_check(ssh(0), 3)],
        );

        let report = knocker.knock(1).await.unwrap();
        assert!(matches!(report.outcome.error, Some(KnockError::ResolveHost { .. })));
        assert!(report.verification.is_none());
        assert_eq!(events.kinds(), vec![EventKind::ErrorResolveHost]);
        assert_eq!(knocker.watcher().state(1), ResourceState::Unknown);
    }

    #[tokio::test]
    async fn test_post_knock_check_reknocks() {
        let probe = ScriptedProbe::new([Err("closed".to_string())], Ok(()));
        let (knocker, _) = knocker(FakeResolver::with(&["10.0.0.5"]), probe, vec![with_port_check(ssh(0), 2)]);

        let report = knocker.knock(1).await.unwrap();
        let verification = report.verification.unwrap();
        assert!(verification.state.is_available());
        assert_eq!(verification.reknocks, 1);
        // Two steps per knock, initial knock plus one re-knock.
        assert_eq!(knocker.executor().transport().sent().len(), 4);
    }

    #[tokio::test]
    async fn test_force_verify_without_check_enabled() {
        let mut sequence = ssh(0);
        sequence.check.port = Some(22);
        let (knocker, _) = knocker(FakeResolver::with(&["10.0.0.5"]), ScriptedProbe::always(Ok(())), vec![sequence]);

        let report = knocker.knock_with(1, KnockOptions { force_verify: true }).await.unwrap();
        let verification = report.verification.unwrap();
        assert!(verification.state.is_available());
        assert_eq!(verification.reknocks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_knock_cancels_running_one() {
        let (knocker, events) = knocker(FakeResolver::with(&["10.0.0.5"]), ScriptedProbe::always(Ok(())), vec![ssh(1000)]);

        let second = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            knocker.knock(1).await
        };
        let (first, second) = tokio::join!(knocker.knock(1), second);

        assert!(first.unwrap().outcome.is_cancelled());
        assert!(second.unwrap().outcome.success);
        assert_eq!(events.kinds(), vec![EventKind::Cancelled, EventKind::Knock]);
        assert!(!knocker.cancel(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_knock() {
        let (knocker, _) = knocker(FakeResolver::with(&["10.0.0.5"]), ScriptedProbe::always(Ok(())), vec![ssh(1000)]);

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            knocker.cancel(1)
        };
        let (report, cancelled) = tokio::join!(knocker.knock(1), cancel);
        assert!(cancelled);
        assert!(report.unwrap().outcome.is_cancelled());
    }

    #[tokio::test]
    async fn test_step_failures_are_logged_per_step() {
        let events = Arc::new(MemoryEventLog::new());
        let knocker: TestKnocker = Knocker::new(
            Executor::new(
                FakeResolver::with(&["10.0.0.5"]),
                RecordingTransport::new().failing_port(8000),
                ExecutorConfig::default(),
            ),
            AccessWatcher::new(ScriptedProbe::always(Ok(())), Duration::from_secs(60)),
            Arc::new(MemoryStore::with_sequences([ssh(0)])),
            events.clone(),
        );

        let report = knocker.knock(1).await.unwrap();
        assert!(!report.outcome.success);
        assert_eq!(events.kinds(), vec![EventKind::ErrorNetwork, EventKind::Knock]);
        assert_eq!(events.events()[0].args[2], "step 2: no response within 500ms");
    }

    #[tokio::test]
    async fn test_watch_requires_enabled_check() {
        let (knocker, _) = knocker(
            FakeResolver::with(&["10.0.0.5"]),
            ScriptedProbe::always(Ok(())),
            vec![ssh(0), with_port_check(ssh(0), 0)],
        );

        assert!(!knocker.watch(1, true).unwrap());
        assert!(knocker.watch(2, true).unwrap());
        assert!(knocker.watcher().is_watching(2));
        assert!(!knocker.watch(2, false).unwrap());
        assert!(!knocker.watcher().is_watching(2));
    }

    #[tokio::test]
    async fn test_save_and_delete_events() {
        let (knocker, events) = knocker(FakeResolver::with(&["10.0.0.5"]), ScriptedProbe::always(Ok(())), vec![]);

        let id = knocker.save(ssh(0)).unwrap();
        assert!(knocker.delete(id).unwrap());
        assert!(matches!(knocker.delete(id), Err(KnockError::SequenceNotFound(_))));
        assert_eq!(events.kinds(), vec![EventKind::SequenceSaved, EventKind::SequenceDeleted]);
    }

    #[tokio::test]
    async fn test_failed_import_is_logged() {
        let (knocker, events) = knocker(FakeResolver::with(&["10.0.0.5"]), ScriptedProbe::always(Ok(())), vec![]);
        let missing = std::env::temp_dir().join("ruknock-missing-import.json");

        assert!(knocker.import(&missing).is_err());
        assert_eq!(events.kinds(), vec![EventKind::ErrorImport]);
    }
}
