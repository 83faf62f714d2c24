use crate::executor::{ExecutionOutcome, StepOutcome, StepStatus};
use crate::sequence::{Sequence, StepKind};
use crate::utils::format_time;
use crate::watcher::{ResourceState, Verification};

/// Per-run counters for the summary printed after a knock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnockStatistics {
    pub steps_sent: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
    pub duration_ms: f64,
}

impl KnockStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_outcome(outcome: &ExecutionOutcome) -> Self {
        let mut stats = Self::new();
        for step in &outcome.steps {
            stats.record(&step.status);
        }
        stats.duration_ms = outcome.duration().as_secs_f64() * 1000.0;
        stats
    }

    pub fn record(&mut self, status: &StepStatus) {
        match status {
            StepStatus::Sent => self.steps_sent += 1,
            StepStatus::Failed { .. } => self.steps_failed += 1,
            StepStatus::Skipped(_) => self.steps_skipped += 1,
        }
    }

    pub fn attempted(&self) -> u32 {
        self.steps_sent + self.steps_failed
    }

    pub fn failure_percentage(&self) -> f64 {
        if self.attempted() == 0 {
            return 0.0;
        }
        (self.steps_failed as f64 / self.attempted() as f64) * 100.0
    }

    pub fn format_summary(&self, name: &str) -> String {
        let mut summary = format!(
            "\nKnock statistics for {}:\n    Steps: Sent = {}, Failed = {} ({:.0}% failed)",
            name,
            self.steps_sent,
            self.steps_failed,
            self.failure_percentage()
        );
        if self.steps_skipped > 0 {
            summary.push_str(&format!(", Skipped = {}", self.steps_skipped));
        }
        summary.push_str(&format!("\n    Duration: {}\n", format_time(self.duration_ms)));
        summary
    }
}

pub fn format_header(sequence: &Sequence) -> String {
    let name = sequence.display_name();
    let steps = sequence.steps.len();
    let plural = if steps == 1 { "" } else { "s" };
    if name == sequence.host {
        format!("Knocking {} with {} step{}:", name, steps, plural)
    } else {
        format!("Knocking {} [{}] with {} step{}:", name, sequence.host, steps, plural)
    }
}

pub fn format_step(step: &StepOutcome) -> String {
    let target = match (&step.address, step.port) {
        (Some(address), Some(port)) => address.socket_addr(port).to_string(),
        (Some(address), None) => address.to_string(),
        (None, Some(port)) => format!("port {}", port),
        (None, None) => "-".to_string(),
    };
    let label = step.kind;

    match &step.status {
        StepStatus::Sent => format!("  #{} {} {}: sent", step.index + 1, label, target),
        StepStatus::Failed { reason, permission_denied } => {
            let hint = if *permission_denied {
                " (try running with elevated privileges)"
            } else {
                ""
            };
            format!("  #{} {} {}: failed: {}{}", step.index + 1, label, target, reason, hint)
        }
        StepStatus::Skipped(reason) => format!("  #{} {} {}: skipped ({})", step.index + 1, label, target, reason),
    }
}

/// One-line result, suitable for both the CLI and the history.
pub fn format_outcome(outcome: &ExecutionOutcome) -> String {
    if let Some(error) = &outcome.error {
        return format!("{}: {}", outcome.name, error);
    }
    let addresses: Vec<String> = outcome.addresses.iter().map(ToString::to_string).collect();
    if outcome.success {
        format!("{}: knocked {}", outcome.name, addresses.join(", "))
    } else {
        format!(
            "{}: knocked {} with {} failed step(s)",
            outcome.name,
            addresses.join(", "),
            outcome.failed_steps().count()
        )
    }
}

pub fn format_state(state: &ResourceState) -> String {
    match state {
        ResourceState::Unknown => "unknown".to_string(),
        ResourceState::Checking { since } => format!("checking (since {})", since.format("%H:%M:%S")),
        ResourceState::Available { at } => format!("available ({})", at.format("%H:%M:%S")),
        ResourceState::Unavailable { at, reason } => {
            format!("unavailable: {} ({})", reason, at.format("%H:%M:%S"))
        }
    }
}

pub fn format_verification(verification: &Verification) -> String {
    match verification.reknocks {
        0 => format!("Resource {}", format_state(&verification.state)),
        n => format!("Resource {} after {} re-knock(s)", format_state(&verification.state), n),
    }
}

/// Row for `list`: id, name, host and step kinds.
pub fn format_sequence(sequence: &Sequence) -> String {
    let steps: Vec<String> = sequence
        .steps
        .iter()
        .map(|step| match step.port() {
            Some(port) if step.kind != StepKind::Icmp => format!("{}/{}", step.kind, port),
            _ => step.kind.to_string(),
        })
        .collect();
    let id = sequence.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
    let mut row = format!("{:>4}  {:<20} {:<24} {}", id, sequence.display_name(), sequence.host, steps.join(" "));
    if let Some(group) = sequence.group.as_deref().filter(|g| !g.is_empty()) {
        row.push_str(&format!("  [{}]", group));
    }
    row
}
