use crate::dns::{DnsResolver, Resolve};
use crate::http::{self, HttpUrl};
use crate::icmp::IcmpSocket;
use crate::sequence::{CheckAccessType, ProtocolVersionPreference, Sequence};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// What to check and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Url(String),
    Port {
        host: String,
        port: u16,
        preference: ProtocolVersionPreference,
    },
    Ping {
        host: String,
        preference: ProtocolVersionPreference,
    },
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeTarget::Url(url) => write!(f, "{}", url),
            ProbeTarget::Port { host, port, .. } => write!(f, "{}:{}", host, port),
            ProbeTarget::Ping { host, .. } => write!(f, "ping {}", host),
        }
    }
}

/// A probe target with its timeout, derived from a sequence's check settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    pub target: ProbeTarget,
    pub timeout: Duration,
}

impl CheckTarget {
    /// `None` when the check settings cannot produce a target (port check
    /// without a valid port). Ignores the enabled flag.
    pub fn from_sequence(sequence: &Sequence) -> Option<Self> {
        let check = &sequence.check;
        let host = check
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(sequence.host.trim())
            .to_string();
        let preference = sequence.ipv;

        let target = match check.kind {
            CheckAccessType::Url => ProbeTarget::Url(host),
            CheckAccessType::Port => {
                let port = check.port.and_then(|p| u16::try_from(p).ok()).filter(|&p| p != 0)?;
                ProbeTarget::Port { host, port, preference }
            }
            CheckAccessType::Ping => ProbeTarget::Ping { host, preference },
        };

        Some(Self {
            target,
            timeout: check.timeout(),
        })
    }
}

/// Reachability check. Failures are a human-readable reason, never fatal.
pub trait Probe: Send + Sync {
    fn probe(&self, target: &ProbeTarget, timeout: Duration) -> impl Future<Output = Result<(), String>> + Send;
}

/// Probes over the real network.
#[derive(Debug, Clone, Default)]
pub struct NetworkProbe<R = DnsResolver> {
    resolver: R,
}

impl<R: Resolve> NetworkProbe<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    async fn check_url(&self, url: &str, limit: Duration) -> Result<(), String> {
        let url = HttpUrl::parse(url).map_err(|e| e.to_string())?;
        let response = http::request(&url, "GET", limit)
            .await
            .map_err(|e| e.to_string())?;
        if response.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status))
        }
    }

    async fn check_port(
        &self,
        host: &str,
        port: u16,
        preference: ProtocolVersionPreference,
        limit: Duration,
    ) -> Result<(), String> {
        let resolved = self
            .resolver
            .resolve(host, preference)
            .await
            .map_err(|e| e.to_string())?;
        let address = resolved.primary().ok_or_else(|| format!("no address for {}", host))?;

        match timeout(limit, TcpStream::connect(address.socket_addr(port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(describe_connect_error(&e)),
            Err(_) => Err(format!("no answer within {}s", limit.as_secs())),
        }
    }

    async fn check_ping(&self, host: &str, preference: ProtocolVersionPreference, limit: Duration) -> Result<(), String> {
        let resolved = self
            .resolver
            .resolve(host, preference)
            .await
            .map_err(|e| e.to_string())?;
        let address = resolved.primary().ok_or_else(|| format!("no address for {}", host))?;

        let socket = IcmpSocket::new(address.is_ipv6()).map_err(|e| e.to_string())?;
        let identifier = crate::utils::generate_identifier();
        socket
            .send_ping(address.socket_addr(0), identifier, 1, 56, limit)
            .await
            .map(|response| {
                log::debug!("{} replied in {:.1}ms", response.source, response.time_ms);
            })
            .map_err(|e| e.to_string())
    }
}

impl<R: Resolve> Probe for NetworkProbe<R> {
    async fn probe(&self, target: &ProbeTarget, limit: Duration) -> Result<(), String> {
        log::debug!("Probing {} (timeout {:?})", target, limit);
        match target {
            ProbeTarget::Url(url) => self.check_url(url, limit).await,
            ProbeTarget::Port { host, port, preference } => self.check_port(host, *port, *preference, limit).await,
            ProbeTarget::Ping { host, preference } => self.check_ping(host, *preference, limit).await,
        }
    }
}

fn describe_connect_error(error: &io::Error) -> String {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::serve_once;
    use crate::sequence::{CheckAccess, SequenceStep};

    fn sequence_with_check(check: CheckAccess) -> Sequence {
        let mut sequence = Sequence::new("ssh", "10.0.0.5", vec![SequenceStep::udp(7000)]);
        sequence.check = check;
        sequence
    }

    #[test]
    fn test_check_target_from_sequence() {
        let check = CheckAccess { enabled: true, port: Some(22), timeout: 3, ..CheckAccess::default() };
        let target = CheckTarget::from_sequence(&sequence_with_check(check)).unwrap();
        assert_eq!(
            target.target,
            ProbeTarget::Port { host: "10.0.0.5".into(), port: 22, preference: ProtocolVersionPreference::PreferIpv4 }
        );
        assert_eq!(target.timeout, Duration::from_secs(3));

        let check = CheckAccess { kind: CheckAccessType::Port, port: None, ..CheckAccess::default() };
        assert!(CheckTarget::from_sequence(&sequence_with_check(check)).is_none());

        let check = CheckAccess {
            kind: CheckAccessType::Url,
            host: Some("http://10.0.0.5/".into()),
            ..CheckAccess::default()
        };
        let target = CheckTarget::from_sequence(&sequence_with_check(check)).unwrap();
        assert_eq!(target.target, ProbeTarget::Url("http://10.0.0.5/".into()));

        let check = CheckAccess { kind: CheckAccessType::Ping, host: Some("  ".into()), ..CheckAccess::default() };
        let target = CheckTarget::from_sequence(&sequence_with_check(check)).unwrap();
        assert!(matches!(target.target, ProbeTarget::Ping { ref host, .. } if host == "10.0.0.5"));
    }

    #[tokio::test]
    async fn test_port_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe: NetworkProbe = NetworkProbe::default();
        let target = ProbeTarget::Port {
            host: "127.0.0.1".into(),
            port,
            preference: ProtocolVersionPreference::PreferIpv4,
        };

        assert!(probe.probe(&target, Duration::from_secs(2)).await.is_ok());

        drop(listener);
        let reason = probe.probe(&target, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(reason, "connection refused");
    }

    #[tokio::test]
    async fn test_url_probe_status() {
        let probe: NetworkProbe = NetworkProbe::default();

        let ok = serve_once("HTTP/1.1 204 No Content\r\n\r\n").await;
        assert!(probe.probe(&ProbeTarget::Url(ok), Duration::from_secs(2)).await.is_ok());

        let down = serve_once("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n").await;
        let reason = probe
            .probe(&ProbeTarget::Url(down), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(reason, "HTTP 503");
    }

    #[tokio::test]
    async fn test_https_url_needs_a_tls_server() {
        let probe: NetworkProbe = NetworkProbe::default();
        let plain = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        let target = ProbeTarget::Url(plain.replacen("http://", "https://", 1));

        let reason = probe.probe(&target, Duration::from_secs(2)).await.unwrap_err();
        assert!(reason.starts_with("TLS handshake failed"), "{reason}");
    }

    #[tokio::test]
    async fn test_url_check_sends_get() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let probe: NetworkProbe = NetworkProbe::default();
        let target = ProbeTarget::Url(format!("http://127.0.0.1:{}/health", port));
        assert!(probe.probe(&target, Duration::from_secs(2)).await.is_ok());
        assert!(server.await.unwrap().starts_with("GET /health HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_a_reason_not_a_panic() {
        let probe: NetworkProbe = NetworkProbe::default();
        let target = ProbeTarget::Port {
            host: "not a host".into(),
            port: 22,
            preference: ProtocolVersionPreference::PreferIpv4,
        };
        let reason = probe.probe(&target, Duration::from_secs(1)).await.unwrap_err();
        assert!(reason.contains("invalid host"));
    }
}
