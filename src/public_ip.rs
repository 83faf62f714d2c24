use crate::config::Settings;
use crate::dns::HostAddress;
use crate::http::{self, HttpUrl};
use std::net::IpAddr;
use std::time::Duration;

const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Looks up this host's public address through "what is my IP"
/// services, one per address family.
#[derive(Debug, Clone)]
pub struct PublicIpDetector {
    ipv4_service: String,
    ipv6_service: String,
    timeout: Duration,
}

impl PublicIpDetector {
    pub fn new(ipv4_service: impl Into<String>, ipv6_service: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ipv4_service: ipv4_service.into(),
            ipv6_service: ipv6_service.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.ipv4_service, &settings.ipv6_service, DETECT_TIMEOUT)
    }

    pub async fn detect(&self, ipv6: bool) -> Result<IpAddr, String> {
        let service = if ipv6 { &self.ipv6_service } else { &self.ipv4_service };
        let url = HttpUrl::parse(service).map_err(|e| e.to_string())?;
        let response = http::request(&url, "GET", self.timeout)
            .await
            .map_err(|e| format!("{}: {}", service, e))?;

        if !response.is_success() {
            return Err(format!("{}: HTTP {}", service, response.status));
        }

        let text = response.text();
        let ip: IpAddr = text
            .trim()
            .parse()
            .map_err(|_| format!("{}: not an IP address: {:?}", service, text.trim()))?;
        if ip.is_ipv6() != ipv6 {
            return Err(format!("{}: answered with {} for the wrong family", service, ip));
        }
        Ok(ip)
    }

    /// Public IPs for the families present in `addresses`, queried
    /// concurrently. Failed lookups are logged and left out.
    pub async fn detect_for(&self, addresses: &[HostAddress]) -> Vec<IpAddr> {
        let want_v4 = addresses.iter().any(|a| !a.is_ipv6());
        let want_v6 = addresses.iter().any(|a| a.is_ipv6());

        let v4 = async {
            if want_v4 { Some(self.detect(false).await) } else { None }
        };
        let v6 = async {
            if want_v6 { Some(self.detect(true).await) } else { None }
        };
        let (v4, v6) = tokio::join!(v4, v6);

        [v4, v6]
            .into_iter()
            .flatten()
            .filter_map(|result| {
                result
                    .map_err(|e| log::warn!("Public IP detection failed: {}", e))
                    .ok()
            })
            .collect()
    }
}
