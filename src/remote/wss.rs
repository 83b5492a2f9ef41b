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
use crate::websocket::{client_upgrade, WebsocketStream};

use super::{dial_tcp, Remote, DIAL_TIMEOUT, HANDSHAKE_TIMEOUT};

/// Tunneled egress over a secure WebSocket at `wss://<peer>:443/`. The
/// cipher stream rides inside binary frames; the prelude is written before
/// the transport is handed back.
pub struct WssRemote {
    services: Arc<Services>,
}

impl WssRemote {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Remote for WssRemote {
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

        let mut stream: Box<dyn AsyncStream> = Box::new(tls_stream);
        let host = format!("{}:443", remote_addr);
        let leftover = match timeout(DIAL_TIMEOUT, client_upgrade(&mut stream, &host)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("websocket upgrade with {} timed out", remote_addr),
                ));
            }
        };

        let websocket_stream = WebsocketStream::new(stream, true, &leftover);
        let mut cipher_stream = CipherStream::new(
            &self.services.cipher_key(),
            Box::new(websocket_stream) as Box<dyn AsyncStream>,
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

        debug!("wss egress to {} via {}", target, remote_addr);
        Ok(Box::new(cipher_stream))
    }

    fn name(&self) -> &'static str {
        "WssRemote"
    }
}
