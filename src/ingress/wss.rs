use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::async_stream::AsyncStream;
use crate::cipher_stream::CipherStream;
use crate::prelude::read_prelude;
use crate::services::Services;
use crate::websocket::{server_upgrade, WebsocketStream};

use super::{write_decoy, IngressHandler, IngressSession, HANDSHAKE_READ_TIMEOUT};

/// Innocuous body sent on post-upgrade failures: to a probing client the
/// endpoint looks like a mundane JSON API.
const JSON_SUCCESS_BODY: &[u8] = br#"{"code":0, "data":[], "message":"success"}"#;

/// Tunnel ingress over a secure WebSocket. The upgrade happens at path `/`;
/// a request that is not a WebSocket upgrade gets the decoy page, and a
/// connection that upgrades but then fails the cipher handshake gets a
/// generic JSON success message so neither failure mode gives the protocol
/// away.
pub struct WssServer {
    services: Arc<Services>,
    acceptor: TlsAcceptor,
}

impl WssServer {
    pub fn new(services: Arc<Services>, acceptor: TlsAcceptor) -> Self {
        Self { services, acceptor }
    }
}

#[async_trait]
impl IngressHandler for WssServer {
    async fn setup_server_stream(&self, stream: TcpStream) -> std::io::Result<IngressSession> {
        let tls_stream = self.acceptor.accept(stream).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("tls accept failed: {}", e))
        })?;
        let mut tls_stream: Box<dyn AsyncStream> = Box::new(tls_stream);

        let upgrade =
            match timeout(HANDSHAKE_READ_TIMEOUT, server_upgrade(&mut tls_stream)).await {
                Ok(Ok(upgrade)) => upgrade,
                Ok(Err(e)) => {
                    debug!("wss upgrade failed, serving decoy: {}", e);
                    write_decoy(&mut *tls_stream).await;
                    return Err(e);
                }
                Err(_) => {
                    write_decoy(&mut *tls_stream).await;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "websocket upgrade timed out",
                    ));
                }
            };

        let websocket_stream = WebsocketStream::new(tls_stream, false, &upgrade.leftover);
        let mut cipher_stream = CipherStream::new(
            &self.services.cipher_key(),
            Box::new(websocket_stream) as Box<dyn AsyncStream>,
        );

        let target = match timeout(HANDSHAKE_READ_TIMEOUT, read_prelude(&mut cipher_stream)).await
        {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                warn!("wss ingress prelude rejected: {}", e);
                let mut inner = cipher_stream.into_inner();
                let _ = inner.write_all(JSON_SUCCESS_BODY).await;
                let _ = inner.flush().await;
                let _ = inner.shutdown().await;
                return Err(e);
            }
            Err(_) => {
                let mut inner = cipher_stream.into_inner();
                let _ = inner.write_all(JSON_SUCCESS_BODY).await;
                let _ = inner.flush().await;
                let _ = inner.shutdown().await;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "prelude read timed out",
                ));
            }
        };

        Ok(IngressSession {
            stream: Box::new(cipher_stream),
            target,
            initial_remote_data: None,
        })
    }

    fn name(&self) -> &'static str {
        "WssServer"
    }
}

#[cfg(test)]
mod tests {
    use crate::address::Target;
    use crate::async_stream::AsyncStream;
    use crate::cipher_stream::CipherStream;
    use crate::prelude::{read_prelude, write_prelude};
    use crate::websocket::{client_upgrade, server_upgrade, WebsocketStream};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KEY: [u8; 32] = [9u8; 32];

    #[tokio::test]
    async fn test_full_wss_tunnel_handshake() {
        // Upgrade, frame, encrypt, prelude - the full WSS ingress path minus
        // the TLS layer, which is in-memory here.
        let (client_side, server_side) = tokio::io::duplex(65536);

        let client = tokio::spawn(async move {
            let mut stream: Box<dyn AsyncStream> = Box::new(client_side);
            let leftover = client_upgrade(&mut stream, "peer.example.com:443")
                .await
                .unwrap();
            let ws = WebsocketStream::new(stream, true, &leftover);
            let mut cipher = CipherStream::new(&KEY, Box::new(ws) as Box<dyn AsyncStream>);

            let target = Target::from_host_port("origin.example.net:80").unwrap();
            write_prelude(&mut cipher, &target).await.unwrap();
            cipher.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            cipher.flush().await.unwrap();

            let mut buf = [0u8; 2];
            cipher.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ok");
        });

        let mut stream: Box<dyn AsyncStream> = Box::new(server_side);
        let upgrade = server_upgrade(&mut stream).await.unwrap();
        let ws = WebsocketStream::new(stream, false, &upgrade.leftover);
        let mut cipher = CipherStream::new(&KEY, Box::new(ws) as Box<dyn AsyncStream>);

        let target = read_prelude(&mut cipher).await.unwrap();
        assert_eq!(target.to_string(), "origin.example.net:80");

        let mut buf = [0u8; 18];
        cipher.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");

        cipher.write_all(b"ok").await.unwrap();
        cipher.flush().await.unwrap();
        client.await.unwrap();
    }
}
