use crate::icmp::{ICMP_HEADER_SIZE, IcmpPacket, IcmpResponse};
use crate::transport::TransportError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// `Datagram` is the unprivileged Linux/macOS "ping socket"; the kernel owns
/// the echo identifier and strips the IP header on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpSocketKind {
    Datagram,
    Raw,
}

pub struct IcmpSocket {
    socket: Socket,
    is_ipv6: bool,
    kind: IcmpSocketKind,
}

impl IcmpSocket {
    /// Opens a ping socket, falling back to a raw socket.
    ///
    /// Returns [`TransportError::PermissionDenied`] when the OS refuses both.
    pub fn new(is_ipv6: bool) -> Result<Self, TransportError> {
        let domain = if is_ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let protocol = if is_ipv6 { Protocol::ICMPV6 } else { Protocol::ICMPV4 };

        let (socket, kind) = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => (socket, IcmpSocketKind::Datagram),
            Err(e) => {
                log::debug!("ICMP datagram socket unavailable ({}), trying raw socket", e);
                match Socket::new(domain, Type::RAW, Some(protocol)) {
                    Ok(socket) => (socket, IcmpSocketKind::Raw),
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        return Err(TransportError::PermissionDenied(format!(
                            "cannot open ICMP socket ({}); allow ping sockets or run with CAP_NET_RAW",
                            e
                        )));
                    }
                    Err(e) => return Err(TransportError::Socket(e)),
                }
            }
        };

        socket.set_nonblocking(false).map_err(TransportError::Socket)?;
        log::debug!("Opened {:?} ICMP socket (ipv6: {})", kind, is_ipv6);

        Ok(Self { socket, is_ipv6, kind })
    }

    pub fn kind(&self) -> IcmpSocketKind {
        self.kind
    }

    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        if self.is_ipv6 {
            self.socket.set_unicast_hops_v6(ttl)
        } else {
            self.socket.set_ttl(ttl)
        }
    }

    /// Sends already serialized packets back to back, off the async runtime.
    pub async fn send_burst(&self, target: SocketAddr, packets: &[Vec<u8>]) -> Result<usize, TransportError> {
        let socket = self.socket.try_clone().map_err(TransportError::Socket)?;
        let packets = packets.to_vec();

        tokio::task::spawn_blocking(move || {
            let address = SockAddr::from(target);
            for (i, packet) in packets.iter().enumerate() {
                socket.send_to(packet, &address)?;
                log::debug!("ICMP packet {}/{} to {}: {} bytes", i + 1, packets.len(), target, packet.len());
            }
            Ok::<_, io::Error>(packets.len())
        })
        .await
        .map_err(|e| TransportError::Socket(io::Error::other(e)))?
        .map_err(TransportError::Send)
    }

    /// One echo request, waiting up to `timeout` for the matching reply.
    pub async fn send_ping(
        &self,
        target: SocketAddr,
        identifier: u16,
        sequence: u16,
        payload_size: usize,
        timeout: Duration,
    ) -> Result<IcmpResponse, TransportError> {
        let payload: Vec<u8> = (0..payload_size).map(|i| (i % 256) as u8).collect();
        let packet = IcmpPacket::new_echo_request(identifier, sequence, payload, self.is_ipv6);

        let start_time = Instant::now();
        self.send_burst(target, &[packet.to_bytes()]).await?;

        match self.receive_response(identifier, sequence, timeout).await? {
            Some(reply) => Ok(IcmpResponse {
                source: target.ip(),
                bytes: reply.packet.payload.len() as u32,
                time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                ttl: reply.ttl,
                sequence,
            }),
            None => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn receive_response(
        &self,
        expected_id: u16,
        expected_seq: u16,
        timeout: Duration,
    ) -> Result<Option<EchoReply>, TransportError> {
        let mut socket = self.socket.try_clone().map_err(TransportError::Socket)?;
        let (is_ipv6, kind) = (self.is_ipv6, self.kind);

        tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + timeout;
            let mut buffer = [0u8; 2048];

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                socket.set_read_timeout(Some(remaining))?;

                let received = match socket.read(&mut buffer) {
                    Ok(n) => n,
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                };

                if let Some(reply) = parse_echo_reply(&buffer[..received], is_ipv6, kind, expected_id, expected_seq) {
                    return Ok(Some(reply));
                }
            }
        })
        .await
        .map_err(|e| TransportError::Socket(io::Error::other(e)))?
        .map_err(TransportError::Socket)
    }
}

#[derive(Debug)]
struct EchoReply {
    packet: IcmpPacket,
    ttl: Option<u8>,
}

/// Extracts a matching echo reply from one received datagram.
///
/// Only raw IPv4 sockets deliver the IP header. Datagram sockets rewrite the
/// identifier, so it is not compared for them.
fn parse_echo_reply(
    data: &[u8],
    is_ipv6: bool,
    kind: IcmpSocketKind,
    expected_id: u16,
    expected_seq: u16,
) -> Option<EchoReply> {
    let (icmp_data, ttl) = if kind == IcmpSocketKind::Raw && !is_ipv6 {
        let header_len = usize::from(data.first()? & 0x0f) * 4;
        if data.len() < header_len + ICMP_HEADER_SIZE {
            return None;
        }
        (&data[header_len..], data.get(8).copied())
    } else {
        (data, None)
    };

    let packet = IcmpPacket::from_bytes(icmp_data).ok()?;
    let id_matches = kind == IcmpSocketKind::Datagram || packet.identifier == expected_id;

    if packet.is_echo_reply(is_ipv6) && id_matches && packet.sequence == expected_seq {
        Some(EchoReply { packet, ttl })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::{ICMP_ECHO_REPLY, ICMPV6_ECHO_REPLY};

    fn reply_bytes(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
        let mut packet = IcmpPacket::new_echo_request(identifier, sequence, vec![1, 2, 3, 4], false);
        packet.icmp_type = icmp_type;
        packet.calculate_checksum();
        packet.to_bytes()
    }

    fn with_ipv4_header(icmp: Vec<u8>, ttl: u8) -> Vec<u8> {
        let mut data = vec![0u8; 20];
        data[0] = 0x45;
        data[8] = ttl;
        data.extend(icmp);
        data
    }

    #[test]
    fn test_raw_ipv4_reply_skips_ip_header() {
        let data = with_ipv4_header(reply_bytes(ICMP_ECHO_REPLY, 77, 5), 57);
        let reply = parse_echo_reply(&data, false, IcmpSocketKind::Raw, 77, 5).unwrap();
        assert_eq!(reply.ttl, Some(57));
        assert_eq!(reply.packet.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_raw_socket_checks_identifier() {
        let data = with_ipv4_header(reply_bytes(ICMP_ECHO_REPLY, 78, 5), 57);
        assert!(parse_echo_reply(&data, false, IcmpSocketKind::Raw, 77, 5).is_none());
    }

    #[test]
    fn test_datagram_socket_ignores_identifier() {
        let data = reply_bytes(ICMP_ECHO_REPLY, 4242, 9);
        let reply = parse_echo_reply(&data, false, IcmpSocketKind::Datagram, 1, 9).unwrap();
        assert_eq!(reply.ttl, None);
        assert!(parse_echo_reply(&data, false, IcmpSocketKind::Datagram, 1, 10).is_none());
    }

    #[test]
    fn test_ignores_requests_and_short_data() {
        let request = IcmpPacket::new_echo_request(1, 1, Vec::new(), false).to_bytes();
        assert!(parse_echo_reply(&request, false, IcmpSocketKind::Datagram, 1, 1).is_none());
        assert!(parse_echo_reply(&[0x45, 0, 0], false, IcmpSocketKind::Raw, 1, 1).is_none());
        assert!(parse_echo_reply(&[], false, IcmpSocketKind::Raw, 1, 1).is_none());
    }

    #[test]
    fn test_ipv6_reply_has_no_ip_header() {
        let data = reply_bytes(ICMPV6_ECHO_REPLY, 3, 4);
        assert!(parse_echo_reply(&data, true, IcmpSocketKind::Raw, 3, 4).is_some());
    }

    #[test]
    fn test_socket_creation_reports_permission() {
        // Depends on the host: either a socket or a permission error.
        match IcmpSocket::new(false) {
            Ok(socket) => println!("ICMP socket kind: {:?}", socket.kind()),
            Err(e) => println!("ICMP socket unavailable: {}", e),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_burst_send_to_loopback() {
        // Hosts without ping or raw sockets have nothing to send through.
        let Ok(socket) = IcmpSocket::new(false) else { return };
        let packet = IcmpPacket::new_echo_request(7, 1, vec![0; 8], false).to_bytes();
        let target: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let sent = socket.send_burst(target, &[packet.clone(), packet]).await.unwrap();
        assert_eq!(sent, 2);
    }
}
