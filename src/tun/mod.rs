//! Virtual-interface data plane: a TUN device feeds captured IPv4 packets
//! into the flow handler, which forwards them through the same routing and
//! egress machinery the proxy listeners use. DNS queries are intercepted
//! and answered locally via DoH.

pub mod device;
pub mod dns;
pub mod handler;
pub mod packet;

pub use device::PacketDevice;
pub use handler::TunHandler;

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::TunConfig;
use crate::route_manager::RouteManager;
use crate::services::Services;

pub const DEFAULT_DEVICE_NAME: &str = "ferry0";
pub const DEFAULT_ADDRESS: &str = "10.0.0.1";
pub const DEFAULT_NETMASK: &str = "255.255.255.0";
pub const DEFAULT_MTU: u16 = 1500;

pub struct TunService {
    route_manager: Arc<RouteManager>,
    handler_task: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TunService {
    /// Brings up the device, rewrites host routes, and starts the packet
    /// loop. Route setup failing for the peer is fatal here; individual
    /// route failures were already downgraded to warnings.
    pub async fn start(
        device: Arc<dyn PacketDevice>,
        services: Arc<Services>,
        route_manager: Arc<RouteManager>,
    ) -> std::io::Result<Self> {
        route_manager.setup_routes(&services).await?;

        let handler = Arc::new(TunHandler::new(
            device,
            services,
            route_manager.peer_ips(),
        ));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handler_task = tokio::spawn(async move {
            tokio::select! {
                result = handler.run() => {
                    if let Err(e) = result {
                        warn!("tun packet loop ended: {}", e);
                    }
                }
                _ = shutdown_rx => {}
            }
        });

        info!("TUN service started");
        Ok(Self {
            route_manager,
            handler_task,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Stops the packet loop and restores the host routing table.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handler_task.abort();
        self.route_manager.restore_routes().await;
        info!("TUN service stopped");
    }
}

/// Creates the kernel TUN device from config. Requires root or
/// CAP_NET_ADMIN; the error from the driver is surfaced as a permission
/// failure so startup can abort with a useful message.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn create_device(config: &TunConfig) -> std::io::Result<Arc<dyn PacketDevice>> {
    use std::net::Ipv4Addr;

    let name = if config.name.is_empty() {
        DEFAULT_DEVICE_NAME
    } else {
        &config.name
    };
    let address: Ipv4Addr = if config.address.is_empty() {
        DEFAULT_ADDRESS.parse().unwrap()
    } else {
        config.address.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad tun address {}: {}", config.address, e),
            )
        })?
    };
    let netmask: Ipv4Addr = if config.netmask.is_empty() {
        DEFAULT_NETMASK.parse().unwrap()
    } else {
        config.netmask.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad tun netmask {}: {}", config.netmask, e),
            )
        })?
    };
    let mtu = if config.mtu == 0 { DEFAULT_MTU } else { config.mtu };

    let mut device_config = ::tun::Configuration::default();
    device_config
        .tun_name(name)
        .address(address)
        .netmask(netmask)
        .mtu(mtu)
        .up();

    #[cfg(target_os = "linux")]
    device_config.platform_config(|platform| {
        platform.ensure_root_privileges(true);
    });

    let device = ::tun::create_as_async(&device_config).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!(
                "failed to create tun device {} (root or CAP_NET_ADMIN required): {}",
                name, e
            ),
        )
    })?;

    Ok(Arc::new(driver::TunDevice::new(
        device,
        name.to_string(),
        mtu,
    )))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn create_device(_config: &TunConfig) -> std::io::Result<Arc<dyn PacketDevice>> {
    Err(std::io::Error::other(
        "tun mode is not supported on this platform",
    ))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod driver {
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::Mutex;

    use super::PacketDevice;

    /// Adapter from the `tun` crate's async device to the abstract packet
    /// device the handler consumes.
    pub struct TunDevice {
        reader: Mutex<ReadHalf<::tun::AsyncDevice>>,
        writer: Mutex<WriteHalf<::tun::AsyncDevice>>,
        name: String,
        mtu: u16,
    }

    impl TunDevice {
        pub fn new(device: ::tun::AsyncDevice, name: String, mtu: u16) -> Self {
            let (reader, writer) = tokio::io::split(device);
            Self {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                name,
                mtu,
            }
        }
    }

    #[async_trait]
    impl PacketDevice for TunDevice {
        async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reader.lock().await.read(buf).await
        }

        async fn write_packet(&self, packet: &[u8]) -> std::io::Result<usize> {
            let mut writer = self.writer.lock().await;
            writer.write_all(packet).await?;
            Ok(packet.len())
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn mtu(&self) -> u16 {
            self.mtu
        }
    }
}
