use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::info;
use parking_lot::RwLock;
use tokio::net::{TcpSocket, UdpSocket};

/// Connector pinned to the interface that carried the default route at
/// startup. Once the default route points at the virtual device, every
/// outbound connection the proxy makes for itself (DoH, direct dials,
/// tunnel egress) must bind this source IP or it would loop back through
/// the tunnel.
#[derive(Debug, Default)]
pub struct InterfaceBinder {
    original_ip: RwLock<Option<Ipv4Addr>>,
}

impl InterfaceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_original_ip(&self, ip: Ipv4Addr) {
        info!("Binding outbound connections to original interface {}", ip);
        *self.original_ip.write() = Some(ip);
    }

    pub fn original_ip(&self) -> Option<Ipv4Addr> {
        *self.original_ip.read()
    }

    /// A TCP socket bound to the original interface when the target is IPv4
    /// and the interface is known; otherwise unbound.
    pub fn new_tcp_socket(&self, is_ipv6: bool) -> std::io::Result<TcpSocket> {
        if is_ipv6 {
            return TcpSocket::new_v6();
        }
        let socket = TcpSocket::new_v4()?;
        if let Some(ip) = self.original_ip() {
            socket.bind(SocketAddr::new(IpAddr::V4(ip), 0))?;
        }
        Ok(socket)
    }

    /// A UDP socket with an ephemeral port on the original interface, or on
    /// the wildcard address when the interface is unknown.
    pub async fn new_udp_socket(&self) -> std::io::Result<UdpSocket> {
        let bind_addr = match self.original_ip() {
            Some(ip) => SocketAddr::new(IpAddr::V4(ip), 0),
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        };
        UdpSocket::bind(bind_addr).await
    }
}
