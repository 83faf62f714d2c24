use crate::icmp::MAX_PACKET_SIZE;
use crate::sequence::{CheckAccessType, MAX_SLEEP_MS, MAX_TTL, MIN_TTL, Sequence, StepKind};
use std::process;

/// Generate a random identifier for ICMP packets
pub fn generate_identifier() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(1..=65535)
}

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("ruknock: {}", message);
    process::exit(code);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("warning: {}", message);
}

/// Rejects sequences that cannot be knocked at all.
pub fn validate_sequence(sequence: &Sequence) -> anyhow::Result<()> {
    if sequence.host.trim().is_empty() {
        return Err(anyhow::anyhow!("{}: host is empty", sequence.display_name()));
    }
    if sequence.steps.is_empty() {
        return Err(anyhow::anyhow!("{}: no steps", sequence.display_name()));
    }
    if !sequence.steps.iter().any(|step| step.is_valid()) {
        return Err(anyhow::anyhow!("{}: no step has a valid port", sequence.display_name()));
    }
    Ok(())
}

/// Settings that will be ignored or adjusted when the sequence runs.
pub fn sequence_warnings(sequence: &Sequence) -> Vec<String> {
    let mut warnings = Vec::new();

    for (index, step) in sequence.steps.iter().enumerate() {
        if !step.is_valid() {
            warnings.push(format!("step {}: {} step without a valid port is skipped", index + 1, step.kind));
        }
        if step.kind == StepKind::Icmp && step.icmp_size() > MAX_PACKET_SIZE {
            warnings.push(format!(
                "step {}: ICMP size {} is capped to {}",
                index + 1,
                step.icmp_size(),
                MAX_PACKET_SIZE
            ));
        }
    }

    if let Some(delay) = sequence.delay.filter(|&d| d > MAX_SLEEP_MS) {
        warnings.push(format!("delay {}ms is capped to {}ms", delay, MAX_SLEEP_MS));
    }
    if let Some(ttl) = sequence.ttl.filter(|t| !(MIN_TTL..=MAX_TTL).contains(t)) {
        warnings.push(format!("TTL {} is outside {}-{} and is ignored", ttl, MIN_TTL, MAX_TTL));
    }
    if sequence.local_port.is_some() && sequence.local_port().is_none() {
        warnings.push("local port is out of range and is ignored".to_string());
    }
    if sequence.check.enabled && sequence.check.port.is_none() && sequence.check.kind == CheckAccessType::Port {
        warnings.push("port check has no port and never runs".to_string());
    }

    warnings
}

/// Format time duration for display
pub fn format_time(ms: f64) -> String {
    if ms < 1.0 {
        "<1ms".to_string()
    } else {
        format!("{:.0}ms", ms)
    }
}

/// Handle Ctrl+C signal for graceful shutdown
pub fn setup_signal_handler() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => {
                log::warn!("Cannot listen for Ctrl+C: {}", e);
                // Keep the sender so the receiver never fires.
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceStep;

    #[test]
    fn test_identifier_generation() {
        for _ in 0..1000 {
            assert_ne!(generate_identifier(), 0);
        }
    }

    #[test]
    fn test_sequence_validation() {
        let valid = Sequence::new("ssh", "10.0.0.5", vec![SequenceStep::udp(7000)]);
        assert!(validate_sequence(&valid).is_ok());

        let no_host = Sequence::new("ssh", " ", vec![SequenceStep::udp(7000)]);
        assert!(validate_sequence(&no_host).is_err());

        let no_steps = Sequence::new("ssh", "10.0.0.5", vec![]);
        assert!(validate_sequence(&no_steps).is_err());

        let bad_ports = Sequence::new("ssh", "10.0.0.5", vec![SequenceStep::udp(0), SequenceStep::tcp(70000)]);
        assert!(validate_sequence(&bad_ports).unwrap_err().to_string().contains("valid port"));
    }

    #[test]
    fn test_sequence_warnings() {
        let mut sequence = Sequence::new("ssh", "10.0.0.5", vec![SequenceStep::udp(7000), SequenceStep::tcp(0)]);
        assert_eq!(sequence_warnings(&sequence), vec!["step 2: TCP step without a valid port is skipped"]);

        sequence.steps.remove(1);
        sequence.delay = Some(20000);
        sequence.ttl = Some(300);
        let warnings = sequence_warnings(&sequence);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("capped to 15000ms"));
        assert!(warnings[1].contains("TTL 300"));
    }

    #[test]
    fn test_time_formatting() {
        assert_eq!(format_time(0.5), "<1ms");
        assert_eq!(format_time(1.0), "1ms");
        assert_eq!(format_time(15.7), "16ms");
        assert_eq!(format_time(100.0), "100ms");
    }
}
