use crate::error::KnockError;
use crate::sequence::ProtocolVersionPreference;
use dns_lookup::lookup_host;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// An IP address plus the IPv6 zone (interface index) it is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub ip: IpAddr,
    pub scope_id: u32,
}

impl HostAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip, scope_id: 0 }
    }

    pub fn with_scope(ip: Ipv6Addr, scope_id: u32) -> Self {
        Self { ip: IpAddr::V6(ip), scope_id }
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        match self.ip {
            IpAddr::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip, port)),
            IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, self.scope_id)),
        }
    }
}

impl From<IpAddr> for HostAddress {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope_id != 0 {
            write!(f, "{}%{}", self.ip, self.scope_id)
        } else {
            write!(f, "{}", self.ip)
        }
    }
}

/// Result of resolving a sequence host: one address, or one per family for
/// [`ProtocolVersionPreference::Both`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub host: String,
    pub addresses: Vec<HostAddress>,
}

impl ResolvedAddress {
    pub fn primary(&self) -> Option<HostAddress> {
        self.addresses.first().copied()
    }

    pub fn joined(&self) -> String {
        self.addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub trait Resolve: Send + Sync {
    fn resolve(
        &self,
        host: &str,
        preference: ProtocolVersionPreference,
    ) -> impl Future<Output = Result<ResolvedAddress, KnockError>> + Send;
}

/// System resolver (`getaddrinfo`) bounded by a timeout.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLVE_TIMEOUT)
    }
}

impl Resolve for DnsResolver {
    async fn resolve(
        &self,
        host: &str,
        preference: ProtocolVersionPreference,
    ) -> Result<ResolvedAddress, KnockError> {
        let host = host.trim();

        if let Some(literal) = parse_literal(host)? {
            let literal = match literal {
                Literal::Address(address) => address,
                Literal::NamedZone(ip, zone) => self.resolve_zone(host, ip, &zone).await?,
            };
            let addresses = select_addresses(host, std::slice::from_ref(&literal), preference)?;
            return Ok(ResolvedAddress { host: host.to_string(), addresses });
        }

        if !is_valid_hostname(host) {
            return Err(KnockError::InvalidHost(host.to_string()));
        }

        let lookup = tokio::task::spawn_blocking({
            let hostname = host.to_string();
            move || lookup_host(&hostname)
        });

        let candidates = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Ok(addresses))) => addresses,
            Ok(Ok(Err(e))) => return Err(resolve_error(host, e.to_string())),
            Ok(Err(e)) => return Err(resolve_error(host, e.to_string())),
            Err(_) => return Err(resolve_error(host, format!("timed out after {:?}", self.timeout))),
        };
        log::debug!("{} resolved to {:?}", host, candidates);

        let addresses = select_addresses(host, candidates.as_slice(), preference)?;
        Ok(ResolvedAddress { host: host.to_string(), addresses })
    }
}

impl DnsResolver {
    /// Interface names (`fe80::1%eth0`) need the OS to map them to an index.
    async fn resolve_zone(&self, host: &str, ip: Ipv6Addr, zone: &str) -> Result<HostAddress, KnockError> {
        let query = format!("{}%{}", ip, zone);
        let lookup = tokio::net::lookup_host((query.as_str(), 0));

        let resolved = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(mut addrs)) => addrs.find_map(|addr| match addr {
                SocketAddr::V6(v6) if *v6.ip() == ip => Some(v6.scope_id()),
                _ => None,
            }),
            Ok(Err(e)) => return Err(resolve_error(host, e.to_string())),
            Err(_) => return Err(resolve_error(host, format!("timed out after {:?}", self.timeout))),
        };

        match resolved {
            Some(scope_id) => Ok(HostAddress::with_scope(ip, scope_id)),
            None => Err(resolve_error(host, format!("unknown zone '{}'", zone))),
        }
    }
}

fn resolve_error(host: &str, reason: String) -> KnockError {
    KnockError::ResolveHost { host: host.to_string(), reason }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Literal {
    Address(HostAddress),
    NamedZone(Ipv6Addr, String),
}

/// `Ok(None)` when `host` is not an IP literal at all.
fn parse_literal(host: &str) -> Result<Option<Literal>, KnockError> {
    let inner = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let Some((address, zone)) = inner.split_once('%') else {
        return Ok(inner.parse::<IpAddr>().ok().map(|ip| Literal::Address(ip.into())));
    };

    let ip: Ipv6Addr = address
        .parse()
        .map_err(|_| KnockError::InvalidHost(host.to_string()))?;
    if zone.is_empty() {
        return Err(KnockError::InvalidHost(host.to_string()));
    }

    match zone.parse::<u32>() {
        Ok(scope_id) => Ok(Some(Literal::Address(HostAddress::with_scope(ip, scope_id)))),
        Err(_) => Ok(Some(Literal::NamedZone(ip, zone.to_string()))),
    }
}

fn is_valid_hostname(host: &str) -> bool {
    let name = host.strip_suffix('.').unwrap_or(host);
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Picks the address(es) to knock from resolver output.
pub fn select_addresses(
    host: &str,
    candidates: &[impl Into<HostAddress> + Copy],
    preference: ProtocolVersionPreference,
) -> Result<Vec<HostAddress>, KnockError> {
    let candidates: Vec<HostAddress> = candidates.iter().map(|&c| c.into()).collect();
    let ipv4 = candidates.iter().find(|a| !a.is_ipv6()).copied();
    let ipv6 = candidates.iter().find(|a| a.is_ipv6()).copied();

    let selected: Vec<HostAddress> = match preference {
        ProtocolVersionPreference::PreferIpv4 => ipv4.or(ipv6).into_iter().collect(),
        ProtocolVersionPreference::PreferIpv6 => ipv6.or(ipv4).into_iter().collect(),
        ProtocolVersionPreference::Ipv4Only => ipv4.into_iter().collect(),
        ProtocolVersionPreference::Ipv6Only => ipv6.into_iter().collect(),
        ProtocolVersionPreference::Both => ipv4.into_iter().chain(ipv6).collect(),
    };

    if selected.is_empty() {
        let reason = match preference {
            ProtocolVersionPreference::Ipv4Only => "no IPv4 address",
            ProtocolVersionPreference::Ipv6Only => "no IPv6 address",
            _ => "no address",
        };
        return Err(resolve_error(host, reason.to_string()));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_ip_literal_bypasses_dns() {
        let resolver = DnsResolver::default();
        let resolved = resolver
            .resolve("10.0.0.5", ProtocolVersionPreference::PreferIpv6)
            .await
            .unwrap();
        assert_eq!(resolved.addresses, vec![HostAddress::new(ip("10.0.0.5"))]);
    }

    #[tokio::test]
    async fn test_bracketed_ipv6_with_numeric_zone() {
        let resolved = DnsResolver::default()
            .resolve("[fe80::1%3]", ProtocolVersionPreference::PreferIpv4)
            .await
            .unwrap();
        let address = resolved.primary().unwrap();
        assert_eq!(address.scope_id, 3);
        assert_eq!(address.to_string(), "fe80::1%3");
        assert_eq!(address.socket_addr(22).to_string(), "[fe80::1%3]:22");
    }

    #[tokio::test]
    async fn test_literal_of_wrong_family_fails() {
        let err = DnsResolver::default()
            .resolve("10.0.0.5", ProtocolVersionPreference::Ipv6Only)
            .await
            .unwrap_err();
        assert!(matches!(err, KnockError::ResolveHost { .. }));
    }

    #[tokio::test]
    async fn test_invalid_host_syntax() {
        let resolver = DnsResolver::default();
        for host in ["", "bad host", "-lead.example", "a..b", "10.0.0.1%3", "fe80::1%"] {
            let err = resolver
                .resolve(host, ProtocolVersionPreference::PreferIpv4)
                .await
                .unwrap_err();
            assert!(matches!(err, KnockError::InvalidHost(_)), "{host}: {err}");
        }
    }

    #[tokio::test]
    async fn test_localhost_resolution() {
        let resolved = DnsResolver::default()
            .resolve("localhost", ProtocolVersionPreference::PreferIpv4)
            .await
            .unwrap();
        assert_eq!(resolved.addresses.len(), 1);
        assert!(resolved.primary().unwrap().ip.is_loopback());
    }

    #[test]
    fn test_preference_selection() {
        let candidates = [ip("2001:db8::1"), ip("192.0.2.1"), ip("192.0.2.2")];

        let v4 = select_addresses("h", &candidates[..], ProtocolVersionPreference::PreferIpv4).unwrap();
        assert_eq!(v4, vec![HostAddress::new(ip("192.0.2.1"))]);

        let v6 = select_addresses("h", &candidates[..], ProtocolVersionPreference::PreferIpv6).unwrap();
        assert_eq!(v6, vec![HostAddress::new(ip("2001:db8::1"))]);

        let both = select_addresses("h", &candidates[..], ProtocolVersionPreference::Both).unwrap();
        assert_eq!(both, vec![HostAddress::new(ip("192.0.2.1")), HostAddress::new(ip("2001:db8::1"))]);
    }

    #[test]
    fn test_preference_falls_back_to_other_family() {
        let only_v4 = [ip("192.0.2.1")];
        let selected = select_addresses("h", &only_v4[..], ProtocolVersionPreference::PreferIpv6).unwrap();
        assert_eq!(selected, vec![HostAddress::new(ip("192.0.2.1"))]);

        let err = select_addresses("h", &only_v4[..], ProtocolVersionPreference::Ipv6Only).unwrap_err();
        assert!(err.to_string().contains("no IPv6 address"));
    }

    #[test]
    fn test_hostname_syntax() {
        assert!(is_valid_hostname("knock.example.org"));
        assert!(is_valid_hostname("knock.example.org."));
        assert!(is_valid_hostname("my_host-1"));
        assert!(!is_valid_hostname("knock example"));
        assert!(!is_valid_hostname(&"a".repeat(64)));
    }
}
