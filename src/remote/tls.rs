use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use rustls::pki_types::ServerName;
use tokio::time::timeout;

use crate::address::{Address, NetLocation, Target};
use crate::async_stream::AsyncStream;
use crate::cipher_stream::CipherStream;
use crate::prelude::write_prelude;
use crate::services::Services;
use crate::tls_util::tunnel_connector;

use super::{dial_tcp, Remote, DIAL_TIMEOUT, HANDSHAKE_TIMEOUT};

/// Tunneled egress over TLS 1.3 to the remote peer on port 443. After the
/// TLS handshake the cipher stream is layered on and the session prelude is
/// written, so the returned transport carries payload bytes directly.
pub struct TlsRemote {
    services: Arc<Services>,
}

impl TlsRemote {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Remote for TlsRemote {
    async fn handshake(&self, target: &Target) -> std::io::Result<Box<dyn AsyncStream>> {
        let remote_addr = self.services.remote_addr();
        let location = NetLocation::new(Address::from(&remote_addr)?, 443);

        let tcp_stream = dial_tcp(&self.services, &location).await?;

        let server_name = ServerName::try_from(remote_addr.clone()).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bad peer server name {}: {}", remote_addr, e),
            )
        })?;

        let tls_stream = match timeout(
            DIAL_TIMEOUT,
            tunnel_connector().connect(server_name, tcp_stream),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("tls handshake with {} timed out", remote_addr),
                ));
            }
        };

        let mut cipher_stream = CipherStream::new(
            &self.services.cipher_key(),
            Box::new(tls_stream) as Box<dyn AsyncStream>,
        );

        match timeout(HANDSHAKE_TIMEOUT, write_prelude(&mut cipher_stream, target)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "prelude write timed out",
                ));
            }
        }

        debug!("tls egress to {} via {}", target, remote_addr);
        Ok(Box::new(cipher_stream))
    }

    fn name(&self) -> &'static str {
        "TlsRemote"
    }
}
