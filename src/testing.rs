//! In-crate fakes for the network seams.

use crate::dns::{HostAddress, Resolve, ResolvedAddress, select_addresses};
use crate::error::KnockError;
use crate::probe::{Probe, ProbeTarget};
use crate::sequence::{ProtocolVersionPreference, StepKind};
use crate::transport::{SendOptions, Transport, TransportError};
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub fn addr(ip: &str) -> HostAddress {
    HostAddress::new(ip.parse::<IpAddr>().unwrap())
}

pub struct FakeResolver {
    candidates: Option<Vec<IpAddr>>,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn with(ips: &[&str]) -> Self {
        Self {
            candidates: Some(ips.iter().map(|ip| ip.parse().unwrap()).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            candidates: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolve for FakeResolver {
    async fn resolve(&self, host: &str, preference: ProtocolVersionPreference) -> Result<ResolvedAddress, KnockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.candidates {
            Some(candidates) => Ok(ResolvedAddress {
                host: host.to_string(),
                addresses: select_addresses(host, candidates.as_slice(), preference)?,
            }),
            None => Err(KnockError::ResolveHost {
                host: host.to_string(),
                reason: "no such host".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub kind: StepKind,
    pub address: HostAddress,
    pub port: Option<u16>,
    pub payload: Vec<u8>,
    pub packets: Vec<Vec<u8>>,
    pub options: SendOptions,
    pub at: Instant,
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentPacket>>,
    failing_ports: HashSet<u16>,
    deny_icmp: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_port(mut self, port: u16) -> Self {
        self.failing_ports.insert(port);
        self
    }

    pub fn denying_icmp(mut self) -> Self {
        self.deny_icmp = true;
        self
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, kind: StepKind, address: HostAddress, port: Option<u16>, payload: &[u8], packets: &[Vec<u8>], options: SendOptions) {
        self.sent.lock().unwrap().push(SentPacket {
            kind,
            address,
            port,
            payload: payload.to_vec(),
            packets: packets.to_vec(),
            options,
            at: Instant::now(),
        });
    }

    fn port_result(&self, port: u16) -> Result<(), TransportError> {
        if self.failing_ports.contains(&port) {
            Err(TransportError::Unreachable(std::io::Error::new(
                std::io::ErrorKind::HostUnreachable,
                "no route to host",
            )))
        } else {
            Ok(())
        }
    }
}

impl Transport for RecordingTransport {
    async fn send_udp(&self, address: HostAddress, port: u16, payload: &[u8], options: SendOptions) -> Result<(), TransportError> {
        self.record(StepKind::Udp, address, Some(port), payload, &[], options);
        self.port_result(port)
    }

    async fn send_tcp_syn(
        &self,
        address: HostAddress,
        port: u16,
        options: SendOptions,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.record(StepKind::Tcp, address, Some(port), &[], &[], options);
        if self.failing_ports.contains(&port) {
            return Err(TransportError::Timeout(timeout));
        }
        Ok(())
    }

    async fn send_icmp(&self, address: HostAddress, packets: &[Vec<u8>], options: SendOptions) -> Result<(), TransportError> {
        self.record(StepKind::Icmp, address, None, &[], packets, options);
        if self.deny_icmp {
            return Err(TransportError::PermissionDenied("raw sockets disabled".to_string()));
        }
        Ok(())
    }
}

/// Answers probes from a script, then repeats `fallback`.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<(), String>>>,
    fallback: Result<(), String>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = Result<(), String>>, fallback: Result<(), String>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Each answer arrives `latency` after the call; the result is picked at call time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn always(result: Result<(), String>) -> Self {
        Self::new([], result)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Probe for ScriptedProbe {
    async fn probe(&self, _target: &ProbeTarget, _timeout: Duration) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
