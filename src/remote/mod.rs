mod direct;
mod tls;
mod wss;

pub use direct::DirectRemote;
pub use tls::TlsRemote;
pub use wss::WssRemote;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::address::{NetLocation, Target};
use crate::async_stream::AsyncStream;
use crate::routing::RemoteKind;
use crate::services::Services;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

/// One egress flavor. `handshake` produces a byte transport that carries the
/// session payload; for tunneled flavors the prelude has already been
/// written when it returns.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn handshake(&self, target: &Target) -> std::io::Result<Box<dyn AsyncStream>>;

    fn name(&self) -> &'static str;
}

/// Dispatches a routing verdict to the corresponding dialer.
pub fn create_remote(kind: RemoteKind, services: Arc<Services>) -> Box<dyn Remote> {
    match kind {
        RemoteKind::Direct => Box::new(DirectRemote::new(services)),
        RemoteKind::Tls => Box::new(TlsRemote::new(services)),
        RemoteKind::Wss => Box::new(WssRemote::new(services)),
    }
}

/// Resolves a location and dials it over TCP from the original interface,
/// within [`DIAL_TIMEOUT`].
pub(crate) async fn dial_tcp(
    services: &Services,
    location: &NetLocation,
) -> std::io::Result<TcpStream> {
    let addr = resolve_location(location).await?;
    let socket = services.binder.new_tcp_socket(addr.is_ipv6())?;
    match timeout(DIAL_TIMEOUT, socket.connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("dial to {} timed out", location),
        )),
    }
}

pub(crate) async fn resolve_location(location: &NetLocation) -> std::io::Result<SocketAddr> {
    if let Some(addr) = location.to_socket_addr() {
        return Ok(addr);
    }
    let host_port = location.to_string();
    let mut addrs = tokio::net::lookup_host(host_port.as_str()).await?;
    addrs
        .find(|addr| !addr.ip().is_unspecified())
        .ok_or_else(|| std::io::Error::other(format!("could not resolve {}", location)))
}
