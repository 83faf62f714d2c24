use crate::icmp::IcmpHeaderMode;
use crate::payload::ContentEncoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type SequenceId = i64;

pub const MIN_PORT: u32 = 1;
pub const MAX_PORT: u32 = 65535;
pub const MIN_TTL: u32 = 1;
pub const MAX_TTL: u32 = 255;
pub const MAX_SLEEP_MS: u32 = 15000;
pub const MAX_CHECK_RETRIES: u32 = 10;
pub const DEFAULT_CHECK_RETRIES: u32 = 3;
pub const DEFAULT_CHECK_TIMEOUT_SECS: u32 = 10;

/// Which address families a knock targets and in what order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolVersionPreference {
    #[default]
    #[serde(rename = "prefer_ipv4")]
    PreferIpv4,
    #[serde(rename = "prefer_ipv6")]
    PreferIpv6,
    #[serde(rename = "only_ipv4")]
    Ipv4Only,
    #[serde(rename = "only_ipv6")]
    Ipv6Only,
    /// One IPv4 and one IPv6 address, each receiving every step.
    #[serde(rename = "both_ipv4_ipv6")]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Udp,
    Tcp,
    Icmp,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Udp => write!(f, "UDP"),
            StepKind::Tcp => write!(f, "TCP"),
            StepKind::Icmp => write!(f, "ICMP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckAccessType {
    Url,
    #[default]
    Port,
    Ping,
}

impl std::fmt::Display for CheckAccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckAccessType::Url => write!(f, "URL"),
            CheckAccessType::Port => write!(f, "port"),
            CheckAccessType::Ping => write!(f, "ping"),
        }
    }
}

/// One packet (or ICMP burst) of a knock sequence.
///
/// The struct mirrors the persisted layout: every protocol-specific field is
/// optional and only the ones relevant to `kind` are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub encoding: ContentEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_payload_size: Option<u32>,
}

impl SequenceStep {
    fn empty(kind: StepKind) -> Self {
        Self {
            kind,
            port: None,
            icmp_size: None,
            icmp_count: None,
            content: None,
            encoding: ContentEncoding::Raw,
            udp_payload_size: None,
        }
    }

    pub fn udp(port: u32) -> Self {
        Self { port: Some(port), ..Self::empty(StepKind::Udp) }
    }

    pub fn tcp(port: u32) -> Self {
        Self { port: Some(port), ..Self::empty(StepKind::Tcp) }
    }

    pub fn icmp(size: u32, count: u32) -> Self {
        Self {
            icmp_size: Some(size),
            icmp_count: Some(count),
            ..Self::empty(StepKind::Icmp)
        }
    }

    pub fn with_content(mut self, content: impl Into<String>, encoding: ContentEncoding) -> Self {
        self.content = Some(content.into());
        self.encoding = encoding;
        self
    }

    /// Destination port of a UDP/TCP step, `None` when missing or out of range.
    pub fn port(&self) -> Option<u16> {
        self.port
            .filter(|p| (MIN_PORT..=MAX_PORT).contains(p))
            .map(|p| p as u16)
    }

    pub fn icmp_size(&self) -> usize {
        self.icmp_size.unwrap_or(0) as usize
    }

    pub fn icmp_count(&self) -> usize {
        self.icmp_count.unwrap_or(1).max(1) as usize
    }

    /// Port steps need a valid port; ICMP steps are always sendable.
    pub fn is_valid(&self) -> bool {
        match self.kind {
            StepKind::Udp | StepKind::Tcp => self.port().is_some(),
            StepKind::Icmp => true,
        }
    }

    /// Decoded payload bytes. TCP knocks never carry data.
    pub fn payload(&self) -> Vec<u8> {
        match (self.kind, self.content.as_deref()) {
            (StepKind::Tcp, _) | (_, None) => Vec::new(),
            (_, Some(content)) if content.trim().is_empty() => Vec::new(),
            (_, Some(content)) => self.encoding.decode(content),
        }
    }
}

/// Post-knock reachability check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAccess {
    #[serde(rename = "check_access", default)]
    pub enabled: bool,
    #[serde(rename = "check_type", default)]
    pub kind: CheckAccessType,
    #[serde(rename = "check_host", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "check_port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    /// Seconds.
    #[serde(rename = "check_timeout", default = "default_check_timeout")]
    pub timeout: u32,
    #[serde(rename = "check_post_knock", default)]
    pub post_knock: bool,
    #[serde(rename = "check_retries", default = "default_check_retries")]
    pub retries: u32,
}

fn default_check_timeout() -> u32 {
    DEFAULT_CHECK_TIMEOUT_SECS
}

fn default_check_retries() -> u32 {
    DEFAULT_CHECK_RETRIES
}

impl Default for CheckAccess {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: CheckAccessType::Port,
            host: None,
            port: None,
            timeout: DEFAULT_CHECK_TIMEOUT_SECS,
            post_knock: false,
            retries: DEFAULT_CHECK_RETRIES,
        }
    }
}

impl CheckAccess {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout.max(1)))
    }

    /// Number of automatic re-knocks after a failed post-knock check.
    pub fn knock_retries(&self) -> u32 {
        if self.post_knock {
            self.retries.min(MAX_CHECK_RETRIES)
        } else {
            0
        }
    }
}

/// A user-defined knock definition, as persisted by the sequence store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SequenceId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    /// Inter-step delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub ipv: ProtocolVersionPreference,
    #[serde(default)]
    pub icmp_type: IcmpHeaderMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(
        rename = "app_name",
        alias = "application_name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub application_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(flatten)]
    pub check: CheckAccess,
    #[serde(default)]
    pub steps: Vec<SequenceStep>,
}

impl Sequence {
    pub fn new(name: impl Into<String>, host: impl Into<String>, steps: Vec<SequenceStep>) -> Self {
        Self {
            id: None,
            name: name.into(),
            host: host.into(),
            group: None,
            order: None,
            delay: None,
            local_port: None,
            ttl: None,
            ipv: ProtocolVersionPreference::default(),
            icmp_type: IcmpHeaderMode::default(),
            application: None,
            application_name: None,
            uri: None,
            check: CheckAccess::default(),
            steps,
        }
    }

    pub fn display_name(&self) -> String {
        match (self.name.trim(), self.id) {
            ("", Some(id)) => format!("#{}", id),
            ("", None) => self.host.clone(),
            (name, _) => name.to_string(),
        }
    }

    /// Inter-step delay, clamped to 0..=15s.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.delay.unwrap_or(0).min(MAX_SLEEP_MS)))
    }

    /// TTL / hop limit, only when it is a value the IP layer accepts.
    pub fn ttl(&self) -> Option<u32> {
        self.ttl.filter(|ttl| (MIN_TTL..=MAX_TTL).contains(ttl))
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
            .filter(|p| (MIN_PORT..=MAX_PORT).contains(p))
            .map(|p| p as u16)
    }
}
