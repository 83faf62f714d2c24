use crate::dns::HostAddress;
use crate::icmp::IcmpSocket;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("host unreachable: {0}")]
    Unreachable(#[source] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TransportError::PermissionDenied(_))
    }
}

/// Per-packet IP options taken from the sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub ttl: Option<u32>,
    pub local_port: Option<u16>,
}

/// Send primitives used by the executor, one per step kind.
pub trait Transport: Send + Sync {
    fn send_udp(
        &self,
        address: HostAddress,
        port: u16,
        payload: &[u8],
        options: SendOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// A refused connection counts as delivered.
    fn send_tcp_syn(
        &self,
        address: HostAddress,
        port: u16,
        options: SendOptions,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_icmp(
        &self,
        address: HostAddress,
        packets: &[Vec<u8>],
        options: SendOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// [`Transport`] on real OS sockets. Every call opens and closes its own socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketTransport;

impl SocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for SocketTransport {
    async fn send_udp(
        &self,
        address: HostAddress,
        port: u16,
        payload: &[u8],
        options: SendOptions,
    ) -> Result<(), TransportError> {
        let target = address.socket_addr(port);
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
            .map_err(TransportError::Socket)?;

        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if let Err(e) = socket.set_reuse_port(true) {
            log::debug!("SO_REUSEPORT not set: {}", e);
        }

        apply_ttl(&socket, target.ip(), options.ttl);
        bind_local_port(&socket, target.ip(), options.local_port);
        socket.set_nonblocking(true).map_err(TransportError::Socket)?;

        let socket: std::net::UdpSocket = socket.into();
        let socket = tokio::net::UdpSocket::from_std(socket).map_err(TransportError::Socket)?;
        let sent = socket
            .send_to(payload, target)
            .await
            .map_err(TransportError::Send)?;
        log::debug!("UDP {} bytes to {}", sent, target);
        Ok(())
    }

    async fn send_tcp_syn(
        &self,
        address: HostAddress,
        port: u16,
        options: SendOptions,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let target = address.socket_addr(port);
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::Socket)?;

        if options.local_port.is_some() {
            socket.set_reuse_address(true).map_err(TransportError::Socket)?;
        }
        apply_ttl(&socket, target.ip(), options.ttl);
        bind_local_port(&socket, target.ip(), options.local_port);
        socket.set_nonblocking(true).map_err(TransportError::Socket)?;

        let stream: std::net::TcpStream = socket.into();
        let socket = tokio::net::TcpSocket::from_std_stream(stream);

        match tokio::time::timeout(timeout, socket.connect(target)).await {
            Ok(Ok(_stream)) => {
                log::debug!("TCP {} accepted the connection", target);
                Ok(())
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                log::debug!("TCP {} refused the connection", target);
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Unreachable(e)),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn send_icmp(
        &self,
        address: HostAddress,
        packets: &[Vec<u8>],
        options: SendOptions,
    ) -> Result<(), TransportError> {
        let socket = IcmpSocket::new(address.is_ipv6())?;
        if let Some(ttl) = options.ttl {
            if let Err(e) = socket.set_ttl(ttl) {
                log::warn!("Cannot set TTL {} on ICMP socket: {}", ttl, e);
            }
        }

        let sent = socket.send_burst(address.socket_addr(0), packets).await?;
        log::debug!("Sent {} ICMP packet(s) to {} over a {:?} socket", sent, address, socket.kind());
        Ok(())
    }
}

fn apply_ttl(socket: &Socket, target: IpAddr, ttl: Option<u32>) {
    let Some(ttl) = ttl else { return };
    let result = match target {
        IpAddr::V4(_) => socket.set_ttl(ttl),
        IpAddr::V6(_) => socket.set_unicast_hops_v6(ttl),
    };
    if let Err(e) = result {
        log::warn!("Cannot set TTL {}: {}", ttl, e);
    }
}

/// A busy local port is not fatal; the OS picks an ephemeral one instead.
fn bind_local_port(socket: &Socket, target: IpAddr, local_port: Option<u16>) {
    let Some(port) = local_port else { return };
    let unspecified = match target {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    if let Err(e) = socket.bind(&SocketAddr::new(unspecified, port).into()) {
        log::warn!("Cannot bind local port {}: {}; sending from an ephemeral port", port, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    fn loopback() -> HostAddress {
        HostAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_udp_payload_arrives() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();

        SocketTransport::new()
            .send_udp(loopback(), port, b"open sesame", SendOptions { ttl: Some(64), local_port: None })
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"open sesame");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_concurrent_udp_sends_share_one_thread() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut sends = tokio::task::JoinSet::new();
        for i in 0u8..8 {
            sends.spawn(async move {
                let payload = [i];
                SocketTransport::new()
                    .send_udp(loopback(), port, &payload, SendOptions::default())
                    .await
            });
        }
        while let Some(result) = sends.join_next().await {
            result.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        let mut buf = [0u8; 8];
        for _ in 0..8 {
            let (n, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(n, 1);
            seen.push(buf[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0u8..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_udp_falls_back_when_local_port_is_taken() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();

        // The receiver itself holds `port` without SO_REUSEPORT.
        let options = SendOptions { ttl: None, local_port: Some(port) };
        SocketTransport::new().send_udp(loopback(), port, b"x", options).await.unwrap();

        let mut buf = [0u8; 8];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_tcp_listener_counts_as_sent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = SocketTransport::new()
            .send_tcp_syn(loopback(), port, SendOptions::default(), Duration::from_secs(2))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_refused_counts_as_sent() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = SocketTransport::new()
            .send_tcp_syn(loopback(), port, SendOptions::default(), Duration::from_secs(2))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_permission_denied_is_distinguishable() {
        assert!(TransportError::PermissionDenied("raw".into()).is_permission_denied());
        assert!(!TransportError::Timeout(Duration::from_millis(1)).is_permission_denied());
    }
}
