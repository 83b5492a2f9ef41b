mod http;
mod socks;
mod tls;
mod wss;

pub use http::HttpServer;
pub use socks::SocksServer;
pub use tls::TlsServer;
pub use wss::WssServer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::address::{Protocol, Target, UdpRelay};
use crate::async_stream::AsyncStream;
use crate::copy_bidirectional::copy_bidirectional;
use crate::remote::create_remote;
use crate::routing::pick_remote_kind;
use crate::services::Services;
use crate::util::allocate_vec;

/// Per-read deadline during ingress handshakes.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(4);

/// Overall cap on one session's setup, covering the inbound handshake plus
/// the outbound dial.
const SESSION_SETUP_TIMEOUT: Duration = Duration::from_secs(60);

const DECOY_BODY: &str = concat!(
    "<!DOCTYPE html>\n",
    "<html>\n",
    "<head>\n",
    "<title>Welcome to nginx!</title>\n",
    "<style>\n",
    "    body {\n",
    "        width: 35em;\n",
    "        margin: 0 auto;\n",
    "        font-family: Tahoma, Verdana, Arial, sans-serif;\n",
    "    }\n",
    "</style>\n",
    "</head>\n",
    "<body>\n",
    "<h1>Welcome to nginx!</h1>\n",
    "<p>If you see this page, the nginx web server is successfully installed and\n",
    "working. Further configuration is required.</p>\n",
    "\n",
    "<p>For online documentation and support please refer to\n",
    "<a href=\"http://nginx.org/\">nginx.org</a>.<br/>\n",
    "Commercial support is available at\n",
    "<a href=\"http://nginx.com/\">nginx.com</a>.</p>\n",
    "\n",
    "<p><em>Thank you for using nginx.</em></p>\n",
    "</body>\n",
    "</html>\n",
);

/// The fixed 200 response served on any TLS/WSS ingress failure that a
/// probing client could otherwise use to fingerprint the service.
pub fn decoy_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nServer: nginx\r\nContent-Type: text/html;charset=utf-8\r\nConnection: Close\r\nContent-Length: {}\r\n\r\n{}",
        DECOY_BODY.len(),
        DECOY_BODY
    )
    .into_bytes()
}

pub async fn write_decoy<S: AsyncStream + ?Sized>(stream: &mut S) {
    let _ = stream.write_all(&decoy_response()).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

/// One accepted connection after its inbound handshake: the byte transport
/// to keep talking to the client on, the destination it asked for, and any
/// bytes that must reach the destination first (e.g. a rewritten HTTP
/// request).
pub struct IngressSession {
    pub stream: Box<dyn AsyncStream>,
    pub target: Target,
    pub initial_remote_data: Option<Box<[u8]>>,
}

#[async_trait]
pub trait IngressHandler: Send + Sync {
    async fn setup_server_stream(&self, stream: TcpStream) -> std::io::Result<IngressSession>;

    fn name(&self) -> &'static str;
}

/// Accept loop: one task per connection, each running handshake, routing,
/// egress dial, and the forwarding loop.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn IngressHandler>,
    services: Arc<Services>,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("Accept failed: {}", e);
                continue;
            }
        };

        let handler = handler.clone();
        let services = services.clone();
        tokio::spawn(async move {
            match process_connection(stream, handler, services).await {
                Ok(()) => {
                    debug!("{} finished", peer_addr);
                }
                Err(e) => {
                    // A remote closing mid-copy is the normal end of most
                    // sessions, not an error worth surfacing.
                    if !e.to_string().contains("closed") {
                        error!("{} finished with error: {}", peer_addr, e);
                    }
                }
            }
        });
    }
}

async fn process_connection(
    stream: TcpStream,
    handler: Arc<dyn IngressHandler>,
    services: Arc<Services>,
) -> std::io::Result<()> {
    let setup = async {
        let session = handler.setup_server_stream(stream).await?;

        let remote_kind = pick_remote_kind(&session.target, &services).await;
        let remote = create_remote(remote_kind, services.clone());
        debug!(
            "{} -> {} via {}",
            handler.name(),
            session.target,
            remote.name()
        );

        let remote_stream = remote.handshake(&session.target).await.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("{} to {} failed: {}", remote.name(), session.target, e),
            )
        })?;
        Ok::<_, std::io::Error>((session, remote_stream))
    };

    let (session, mut remote_stream) = match timeout(SESSION_SETUP_TIMEOUT, setup).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "session setup timed out",
            ));
        }
    };

    let IngressSession {
        mut stream,
        target,
        initial_remote_data,
    } = session;

    if let Some(data) = initial_remote_data {
        remote_stream.write_all(&data).await?;
        remote_stream.flush().await?;
    }

    if target.protocol == Protocol::Udp {
        if let Some(relay) = target.udp_relay {
            return run_udp_relay(stream, relay, remote_stream).await;
        }
    }

    let result = copy_bidirectional(&mut stream, &mut remote_stream, false, false).await;
    let _ = futures::join!(stream.shutdown(), remote_stream.shutdown());
    result
}

/// The UDP ASSOCIATE pump: datagrams from the client go onto the remote
/// byte transport; bytes coming back are sent as datagrams to wherever the
/// client last sent from. The TCP control stream going away ends the
/// association.
async fn run_udp_relay(
    mut control_stream: Box<dyn AsyncStream>,
    relay: UdpRelay,
    mut remote_stream: Box<dyn AsyncStream>,
) -> std::io::Result<()> {
    enum Event {
        Datagram(usize, std::net::SocketAddr),
        RemoteData(usize),
        ControlClosed,
    }

    let socket = relay.socket;
    let mut udp_buf = allocate_vec(65536);
    let mut remote_buf = allocate_vec(65536);
    let mut control_buf = [0u8; 64];
    let mut client_addr = None;

    loop {
        let event = tokio::select! {
            received = socket.recv_from(&mut udp_buf) => {
                let (n, peer) = received?;
                Event::Datagram(n, peer)
            }
            read = remote_stream.read(&mut remote_buf) => {
                Event::RemoteData(read?)
            }
            read = control_stream.read(&mut control_buf) => {
                // The client holds this open for the lifetime of the
                // association; EOF or error tears it down.
                if read? == 0 {
                    Event::ControlClosed
                } else {
                    continue;
                }
            }
        };

        match event {
            Event::Datagram(n, peer) => {
                client_addr = Some(peer);
                if n > 0 {
                    remote_stream.write_all(&udp_buf[..n]).await?;
                    remote_stream.flush().await?;
                }
            }
            Event::RemoteData(0) | Event::ControlClosed => break,
            Event::RemoteData(n) => {
                if let Some(addr) = client_addr {
                    socket.send_to(&remote_buf[..n], addr).await?;
                }
            }
        }
    }

    let _ = remote_stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoy_has_correct_content_length() {
        let response = decoy_response();
        let text = String::from_utf8(response).unwrap();
        let (headers, body) = text.split_once("\r\n\r\n").unwrap();
        let length_line = headers
            .lines()
            .find(|l| l.starts_with("Content-Length:"))
            .unwrap();
        let declared: usize = length_line["Content-Length:".len()..].trim().parse().unwrap();
        assert_eq!(declared, body.len());
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    }
}
