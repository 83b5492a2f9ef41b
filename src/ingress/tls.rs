use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::async_stream::AsyncStream;
use crate::cipher_stream::CipherStream;
use crate::prelude::read_prelude;
use crate::prepend_stream::PrependStream;
use crate::services::Services;

use super::{write_decoy, IngressHandler, IngressSession, HANDSHAKE_READ_TIMEOUT};

/// Tunnel ingress over naked TLS. After the TLS handshake the first byte is
/// sniffed: an HTTP method letter means a probing browser, which gets the
/// decoy page; anything else is assumed to be the 24-byte cipher nonce and
/// the session prelude follows inside the cipher stream. Every failure on
/// this path answers with the same decoy so the service is
/// indistinguishable from a static web server.
pub struct TlsServer {
    services: Arc<Services>,
    acceptor: TlsAcceptor,
}

impl TlsServer {
    pub fn new(services: Arc<Services>, acceptor: TlsAcceptor) -> Self {
        Self { services, acceptor }
    }
}

#[async_trait]
impl IngressHandler for TlsServer {
    async fn setup_server_stream(&self, stream: TcpStream) -> std::io::Result<IngressSession> {
        let tls_stream = self.acceptor.accept(stream).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("tls accept failed: {}", e))
        })?;
        let mut tls_stream: Box<dyn AsyncStream> = Box::new(tls_stream);

        let mut first_byte = [0u8; 1];
        match timeout(HANDSHAKE_READ_TIMEOUT, tls_stream.read_exact(&mut first_byte)).await {
            Ok(Ok(_)) => (),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                write_decoy(&mut *tls_stream).await;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for first tls payload byte",
                ));
            }
        }

        if matches!(first_byte[0], b'C' | b'G' | b'P' | b'D' | b'H' | b'O') {
            debug!("plain http probe on tls ingress, serving decoy");
            write_decoy(&mut *tls_stream).await;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "http probe on tls ingress",
            ));
        }

        let stream = PrependStream::new(&first_byte, tls_stream);
        let mut cipher_stream = CipherStream::new(
            &self.services.cipher_key(),
            Box::new(stream) as Box<dyn AsyncStream>,
        );

        let target = match timeout(HANDSHAKE_READ_TIMEOUT, read_prelude(&mut cipher_stream)).await
        {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                warn!("tls ingress prelude rejected: {}", e);
                let mut inner = cipher_stream.into_inner();
                write_decoy(&mut *inner).await;
                return Err(e);
            }
            Err(_) => {
                let mut inner = cipher_stream.into_inner();
                write_decoy(&mut *inner).await;
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
        "TlsServer"
    }
}

#[cfg(test)]
mod tests {
    use super::super::decoy_response;
    use crate::address::{Protocol, Target};
    use crate::cipher_stream::CipherStream;
    use crate::prelude::{read_prelude, write_prelude};
    use crate::prepend_stream::PrependStream;
    use crate::util::current_time_secs;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KEY: [u8; 32] = [3u8; 32];

    // The handler body past the TLS accept is exercised against an in-memory
    // duplex here; the TLS layer itself is tokio-rustls.

    #[tokio::test]
    async fn test_prelude_session_over_cipher() {
        let (client_side, server_side) = tokio::io::duplex(65536);

        let client = tokio::spawn(async move {
            let mut cipher = CipherStream::new(&KEY, Box::new(client_side));
            let target = Target::from_host_port("www.example.com:443").unwrap();
            write_prelude(&mut cipher, &target).await.unwrap();
            cipher.write_all(b"payload after prelude").await.unwrap();
            cipher.flush().await.unwrap();
        });

        let mut cipher = CipherStream::new(&KEY, Box::new(server_side));
        let target = read_prelude(&mut cipher).await.unwrap();
        assert_eq!(target.to_string(), "www.example.com:443");
        assert_eq!(target.protocol, Protocol::Tcp);

        let mut buf = [0u8; 21];
        cipher.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload after prelude");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_skewed_clock_gets_rejected_with_decoy_shape() {
        let (mut client_side, server_side) = tokio::io::duplex(65536);

        // A client 100 seconds in the future.
        let client = tokio::spawn(async move {
            let mut cipher = CipherStream::new(&KEY, Box::new(client_side));
            let ts = current_time_secs() + 100;
            cipher.write_all(&ts.to_be_bytes()).await.unwrap();
            cipher.write_all(&1u16.to_be_bytes()).await.unwrap();
            cipher.write_all(&15u16.to_be_bytes()).await.unwrap();
            cipher.write_all(b"example.com:443").await.unwrap();
            cipher.flush().await.unwrap();
        });

        let mut cipher = CipherStream::new(&KEY, Box::new(server_side));
        assert!(read_prelude(&mut cipher).await.is_err());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_byte_pushback_preserves_nonce() {
        // Sniffing one byte must not eat into the nonce.
        let (client_side, server_side) = tokio::io::duplex(65536);

        let client = tokio::spawn(async move {
            let mut cipher = CipherStream::new(&KEY, Box::new(client_side));
            cipher.write_all(b"hello").await.unwrap();
            cipher.flush().await.unwrap();
        });

        let mut raw: Box<dyn crate::async_stream::AsyncStream> = Box::new(server_side);
        let mut first = [0u8; 1];
        raw.read_exact(&mut first).await.unwrap();

        let restored = PrependStream::new(&first, raw);
        let mut cipher = CipherStream::new(&KEY, Box::new(restored));
        let mut buf = [0u8; 5];
        cipher.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();
    }

    #[test]
    fn test_decoy_is_a_complete_http_response() {
        let text = String::from_utf8(decoy_response()).unwrap();
        assert!(text.contains("Server: nginx\r\n"));
        assert!(text.contains("</html>"));
    }
}
