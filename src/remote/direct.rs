use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::address::{Protocol, Target};
use crate::async_stream::AsyncStream;
use crate::services::Services;
use crate::udp_stream::UdpStream;

use super::{dial_tcp, resolve_location, Remote};

/// Plain egress to the true origin, bound to the original interface.
/// No prelude and no cipher are involved.
pub struct DirectRemote {
    services: Arc<Services>,
}

impl DirectRemote {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Remote for DirectRemote {
    async fn handshake(&self, target: &Target) -> std::io::Result<Box<dyn AsyncStream>> {
        if target.protocol == Protocol::Udp {
            let addr = resolve_location(&target.location).await?;
            let socket = self.services.binder.new_udp_socket().await?;
            socket.connect(addr).await?;
            debug!("direct udp egress to {}", target);
            return Ok(Box::new(UdpStream::new(socket)));
        }

        let stream = dial_tcp(&self.services, &target.location).await?;
        debug!("direct tcp egress to {}", target);
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "DirectRemote"
    }
}
