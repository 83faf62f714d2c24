use crate::dns::{HostAddress, Resolve};
use crate::error::KnockError;
use crate::icmp::{EchoBurstBuilder, IcmpStep, MAX_IP4_HEADER_SIZE, MIN_IP4_HEADER_SIZE};
use crate::sequence::{Sequence, SequenceId, SequenceStep, StepKind};
use crate::transport::{SendOptions, Transport, TransportError};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Largest UDP payload that fits any IPv4 datagram.
pub const MAX_UDP_PAYLOAD: usize = 65535 - 8 - MAX_IP4_HEADER_SIZE;

/// Cloneable cancellation flag shared between a run and whoever may stop it.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<watch::Sender<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self(Arc::new(sender))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Whether both tokens are clones of one another.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.0.subscribe();
        // The sender lives in `self`, so this only returns on cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Resolving,
    /// Index into `Sequence::steps`.
    Sending(usize),
    Completed { success: bool },
    Failed(String),
    Cancelled,
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunState::Completed { .. } | RunState::Failed(_) | RunState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Sent,
    Failed { reason: String, permission_denied: bool },
    Skipped(String),
}

/// One step sent to one address (or skipped before resolution).
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub index: usize,
    pub kind: StepKind,
    pub port: Option<u16>,
    pub address: Option<HostAddress>,
    pub status: StepStatus,
    pub at: DateTime<Local>,
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed { .. })
    }
}

/// Result of one knock run. Built fresh per run and never persisted here.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub sequence_id: Option<SequenceId>,
    pub name: String,
    pub host: String,
    pub addresses: Vec<HostAddress>,
    pub steps: Vec<StepOutcome>,
    pub success: bool,
    pub state: RunState,
    /// Set when the run stopped before sending every step.
    pub error: Option<KnockError>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl ExecutionOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.state == RunState::Cancelled
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.is_failed())
    }

    pub fn sent_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Sent).count()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub ip4_header_size: usize,
    /// Bound on each TCP knock connect attempt.
    pub tcp_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            ip4_header_size: MIN_IP4_HEADER_SIZE,
            tcp_timeout: Duration::from_millis(500),
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            ip4_header_size: settings.ip4_header_size(),
            tcp_timeout: settings.tcp_knock_timeout(),
        }
    }
}

/// Sends the steps of a sequence, in order, to the resolved host.
pub struct Executor<R, T> {
    resolver: R,
    transport: T,
    config: ExecutorConfig,
}

impl<R: Resolve, T: Transport> Executor<R, T> {
    pub fn new(resolver: R, transport: T, config: ExecutorConfig) -> Self {
        Self {
            resolver,
            transport,
            config,
        }
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn run(&self, sequence: &Sequence, cancel: &CancelToken) -> ExecutionOutcome {
        let (state, _) = watch::channel(RunState::Idle);
        self.run_observed(sequence, cancel, &state).await
    }

    /// Like [`run`](Self::run), publishing every state transition on `state`.
    pub async fn run_observed(
        &self,
        sequence: &Sequence,
        cancel: &CancelToken,
        state: &watch::Sender<RunState>,
    ) -> ExecutionOutcome {
        let mut run = RunRecorder::new(sequence);
        let name = sequence.display_name();

        if sequence.steps.is_empty() {
            return run.failed(state, KnockError::EmptySequence(name));
        }

        let mut steps = Vec::with_capacity(sequence.steps.len());
        for (index, step) in sequence.steps.iter().enumerate() {
            if step.is_valid() {
                steps.push((index, step));
            } else {
                log::warn!("{}: skipping {} step {} with invalid port {:?}", name, step.kind, index + 1, step.port);
                run.record(index, step, None, StepStatus::Skipped("invalid port".to_string()));
            }
        }
        if steps.is_empty() {
            return run.failed(state, KnockError::EmptySequence(name));
        }

        state.send_replace(RunState::Resolving);
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return run.cancelled(state),
            resolved = self.resolver.resolve(&sequence.host, sequence.ipv) => resolved,
        };
        let addresses = match resolved {
            Ok(resolved) => {
                log::info!("Knocking {} ({}) at {}", name, sequence.host, resolved.joined());
                resolved.addresses
            }
            Err(e) => return run.failed(state, e),
        };
        run.addresses = addresses.clone();

        let options = SendOptions {
            ttl: sequence.ttl(),
            local_port: sequence.local_port(),
        };
        let identifier = crate::utils::generate_identifier();
        let delay = sequence.delay();
        let mut icmp_sequence: u16 = 1;

        for (position, &(index, step)) in steps.iter().enumerate() {
            if position > 0 && !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return run.cancelled(state),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return run.cancelled(state);
            }
            state.send_replace(RunState::Sending(index));

            let icmp_step = IcmpStep {
                size: step.icmp_size(),
                count: step.icmp_count(),
                content: step.payload(),
            };
            let udp_payload = udp_payload(step);

            for &address in &addresses {
                let send = async {
                    match step.kind {
                        StepKind::Udp => {
                            let port = step.port().unwrap_or_default();
                            self.transport.send_udp(address, port, &udp_payload, options).await
                        }
                        StepKind::Tcp => {
                            let port = step.port().unwrap_or_default();
                            self.transport
                                .send_tcp_syn(address, port, options, self.config.tcp_timeout)
                                .await
                        }
                        StepKind::Icmp => {
                            let burst = EchoBurstBuilder::new(
                                sequence.icmp_type,
                                self.config.ip4_header_size,
                                identifier,
                                address.is_ipv6(),
                            )
                            .build(&icmp_step, icmp_sequence);
                            self.transport.send_icmp(address, &burst.packets, options).await
                        }
                    }
                };

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return run.cancelled(state),
                    result = send => result,
                };

                let status = match result {
                    Ok(()) => StepStatus::Sent,
                    Err(e) => {
                        log::warn!("{}: {} step {} to {} failed: {}", name, step.kind, index + 1, address, e);
                        step_failure(&e)
                    }
                };
                run.record(index, step, Some(address), status);
            }

            if step.kind == StepKind::Icmp {
                icmp_sequence = icmp_sequence.wrapping_add(icmp_step.count as u16);
            }
        }

        run.completed(state)
    }
}

fn step_failure(error: &TransportError) -> StepStatus {
    StepStatus::Failed {
        reason: error.to_string(),
        permission_denied: error.is_permission_denied(),
    }
}

/// Decoded payload, resized to `udp_payload_size` when one is set.
fn udp_payload(step: &SequenceStep) -> Vec<u8> {
    let mut payload = step.payload();
    if let Some(size) = step.udp_payload_size {
        payload.resize((size as usize).min(MAX_UDP_PAYLOAD), 0);
    }
    payload
}

struct RunRecorder<'a> {
    sequence: &'a Sequence,
    started_at: DateTime<Local>,
    addresses: Vec<HostAddress>,
    steps: Vec<StepOutcome>,
}

impl<'a> RunRecorder<'a> {
    fn new(sequence: &'a Sequence) -> Self {
        Self {
            sequence,
            started_at: Local::now(),
            addresses: Vec::new(),
            steps: Vec::new(),
        }
    }

    fn record(&mut self, index: usize, step: &SequenceStep, address: Option<HostAddress>, status: StepStatus) {
        self.steps.push(StepOutcome {
            index,
            kind: step.kind,
            port: step.port(),
            address,
            status,
            at: Local::now(),
        });
    }

    fn completed(self, state: &watch::Sender<RunState>) -> ExecutionOutcome {
        let success = !self.steps.iter().any(StepOutcome::is_failed);
        self.finish(state, RunState::Completed { success }, None)
    }

    fn failed(self, state: &watch::Sender<RunState>, error: KnockError) -> ExecutionOutcome {
        log::warn!("{}: {}", self.sequence.display_name(), error);
        self.finish(state, RunState::Failed(error.to_string()), Some(error))
    }

    fn cancelled(self, state: &watch::Sender<RunState>) -> ExecutionOutcome {
        log::info!("{}: knock cancelled", self.sequence.display_name());
        self.finish(state, RunState::Cancelled, Some(KnockError::Cancelled))
    }

    fn finish(mut self, state: &watch::Sender<RunState>, final_state: RunState, error: Option<KnockError>) -> ExecutionOutcome {
        // Skipped steps are recorded before resolution; stable sort keeps address order.
        self.steps.sort_by_key(|step| step.index);
        state.send_replace(final_state.clone());
        ExecutionOutcome {
            sequence_id: self.sequence.id,
            name: self.sequence.display_name(),
            host: self.sequence.host.clone(),
            addresses: self.addresses,
            success: final_state == (RunState::Completed { success: true }),
            steps: self.steps,
            state: final_state,
            error,
            started_at: self.started_at,
            finished_at: Local::now(),
        }
    }
}
