pub mod packet;
pub mod socket;

pub use packet::*;
pub use socket::*;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub const ICMP_HEADER_SIZE: usize = 8;
pub const MIN_IP4_HEADER_SIZE: usize = 20;
pub const MAX_IP4_HEADER_SIZE: usize = 60;
pub const IP6_HEADER_SIZE: usize = 40;
pub const MAX_PACKET_SIZE: usize = 65535;

/// How the configured ICMP "size" maps onto bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IcmpHeaderMode {
    /// Size is the echo payload alone.
    #[serde(rename = "without_headers")]
    WithoutHeaders,
    /// Size includes the 8-byte ICMP header.
    #[default]
    #[serde(rename = "with_ip_header", alias = "with_icmp_header")]
    WithIcmpHeader,
    /// Size includes the IP header as well.
    #[serde(rename = "full_packet", alias = "with_ip_and_icmp_headers")]
    FullPacket,
}

impl IcmpHeaderMode {
    /// Echo payload length for a configured `size`, floored at zero.
    pub fn payload_len(self, size: usize, ip_header_size: usize) -> usize {
        match self {
            IcmpHeaderMode::WithoutHeaders => size,
            IcmpHeaderMode::WithIcmpHeader => size.saturating_sub(ICMP_HEADER_SIZE),
            IcmpHeaderMode::FullPacket => size.saturating_sub(ip_header_size + ICMP_HEADER_SIZE),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IcmpResponse {
    pub source: IpAddr,
    pub bytes: u32,
    pub time_ms: f64,
    /// Only known when the reply arrived with its IPv4 header.
    pub ttl: Option<u8>,
    pub sequence: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_len_per_mode() {
        assert_eq!(IcmpHeaderMode::WithoutHeaders.payload_len(64, 20), 64);
        assert_eq!(IcmpHeaderMode::WithIcmpHeader.payload_len(64, 20), 56);
        assert_eq!(IcmpHeaderMode::WithIcmpHeader.payload_len(64, 60), 56);
        assert_eq!(IcmpHeaderMode::FullPacket.payload_len(64, 20), 36);
        assert_eq!(IcmpHeaderMode::FullPacket.payload_len(64, 40), 16);
    }

    #[test]
    fn test_payload_len_floors_at_zero() {
        assert_eq!(IcmpHeaderMode::WithIcmpHeader.payload_len(4, 20), 0);
        assert_eq!(IcmpHeaderMode::FullPacket.payload_len(20, 20), 0);
    }
}
