use std::net::Ipv4Addr;

use log::{info, warn};
use parking_lot::RwLock;
use tokio::process::Command;

use crate::services::Services;

/// Cap on installed direct routes so a huge whitelist cannot blow up the
/// system routing table.
const MAX_ROUTES: usize = 1000;

const LOCAL_NETWORKS: [&str; 5] = [
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];

/// Tunnel peer addresses, shared with the virtual-interface handler so
/// packets to the peer are never re-captured.
#[derive(Debug, Default)]
pub struct PeerIps {
    ips: RwLock<Vec<Ipv4Addr>>,
}

impl PeerIps {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ips.read().contains(&ip)
    }

    pub fn replace(&self, ips: Vec<Ipv4Addr>) {
        *self.ips.write() = ips;
    }
}

/// Rewrites the host routing table around the virtual interface: direct
/// routes for the tunnel peer, local networks, and whitelisted networks via
/// the original gateway, then a default route through the tun device.
/// The original default gateway is captured first and the default route is
/// removed again on shutdown.
pub struct RouteManager {
    tun_interface: String,
    tun_gateway: String,
    original_gateway: RwLock<Option<String>>,
    peer_ips: std::sync::Arc<PeerIps>,
    backed_up: RwLock<bool>,
}

impl RouteManager {
    pub fn new(
        tun_interface: String,
        tun_gateway: String,
        peer_ips: std::sync::Arc<PeerIps>,
    ) -> Self {
        Self {
            tun_interface,
            tun_gateway,
            original_gateway: RwLock::new(None),
            peer_ips,
            backed_up: RwLock::new(false),
        }
    }

    pub fn peer_ips(&self) -> std::sync::Arc<PeerIps> {
        self.peer_ips.clone()
    }

    /// Reads the current default gateway and the IP of the interface that
    /// carries it, before anything is modified. The interface IP feeds the
    /// original-interface binder. Failing to find the gateway aborts setup.
    pub async fn backup_routes(&self, binder: &crate::binder::InterfaceBinder) -> std::io::Result<()> {
        if *self.backed_up.read() {
            return Ok(());
        }

        let gateway = default_gateway().await?;
        info!("Original default gateway: {}", gateway);

        match default_interface_ip().await {
            Ok(ip) => binder.set_original_ip(ip),
            Err(e) => {
                warn!(
                    "Could not detect original interface IP, egress will not be pinned: {}",
                    e
                );
            }
        }

        *self.original_gateway.write() = Some(gateway);
        *self.backed_up.write() = true;
        Ok(())
    }

    pub async fn setup_routes(&self, services: &Services) -> std::io::Result<()> {
        if !*self.backed_up.read() {
            self.backup_routes(&services.binder).await?;
        }

        let gateway = self
            .original_gateway
            .read()
            .clone()
            .expect("backup_routes succeeded");

        let mut installed = 0usize;

        // The peer routes go first: once the default route moves, the
        // tunnel's own traffic must already have a direct path or every
        // packet loops straight back into the tun device.
        self.add_peer_routes(services, &gateway, &mut installed)
            .await?;

        for network in LOCAL_NETWORKS {
            if installed >= MAX_ROUTES {
                break;
            }
            if let Err(e) = add_route(network, &gateway).await {
                warn!("Failed to add local route {}: {}", network, e);
            } else {
                installed += 1;
            }
        }

        for (network, prefix_len) in services.rules.white_networks() {
            if installed >= MAX_ROUTES {
                warn!("Route cap ({}) reached, remaining whitelist routes skipped", MAX_ROUTES);
                break;
            }
            let cidr = format!("{}/{}", network, prefix_len);
            if let Err(e) = add_route(&cidr, &gateway).await {
                warn!("Failed to add whitelist route {}: {}", cidr, e);
            } else {
                installed += 1;
            }
        }

        self.set_default_route().await?;
        info!("Installed {} direct routes, default via {}", installed, self.tun_interface);
        Ok(())
    }

    async fn add_peer_routes(
        &self,
        services: &Services,
        gateway: &str,
        installed: &mut usize,
    ) -> std::io::Result<()> {
        let remote_addr = services.remote_addr();
        let host = remote_addr.trim();
        if host.is_empty() {
            return Ok(());
        }

        // Resolved before the default route changes, so this lookup still
        // uses the original path.
        let addrs = tokio::net::lookup_host((host, 443))
            .await
            .map_err(|e| {
                std::io::Error::new(e.kind(), format!("cannot resolve peer {}: {}", host, e))
            })?;

        let mut peer_ips = Vec::new();
        for addr in addrs {
            if let std::net::IpAddr::V4(v4) = addr.ip() {
                peer_ips.push(v4);
            }
        }

        for ip in &peer_ips {
            let cidr = format!("{}/32", ip);
            add_route(&cidr, gateway).await.map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("failed to add peer route {}: {}", cidr, e),
                )
            })?;
            *installed += 1;
            info!("Added peer route {} via {}", cidr, gateway);
        }

        self.peer_ips.replace(peer_ips);
        Ok(())
    }

    #[cfg(target_os = "windows")]
    async fn set_default_route(&self) -> std::io::Result<()> {
        // A metric of 10 keeps the more specific direct routes (metric 1)
        // ahead of the tun default.
        run_checked(Command::new("route").args([
            "add",
            "0.0.0.0",
            "mask",
            "0.0.0.0",
            &self.tun_gateway,
            "metric",
            "10",
        ]))
        .await
    }

    #[cfg(not(target_os = "windows"))]
    async fn set_default_route(&self) -> std::io::Result<()> {
        let _ = &self.tun_gateway;
        add_route("0.0.0.0/0", &self.tun_interface).await
    }

    /// Deletes the default route we installed. Individual direct routes are
    /// left behind; they point at the still-valid original gateway and
    /// expire with the host's routing table.
    pub async fn restore_routes(&self) {
        if !*self.backed_up.read() {
            return;
        }

        #[cfg(target_os = "windows")]
        let result = run_checked(Command::new("route").args([
            "delete",
            "0.0.0.0",
            "mask",
            "0.0.0.0",
            &self.tun_gateway,
        ]))
        .await;

        #[cfg(not(target_os = "windows"))]
        let result = delete_route("0.0.0.0/0", &self.tun_interface).await;

        match result {
            Ok(()) => info!("Default route restored"),
            Err(e) => warn!("Failed to restore default route: {}", e),
        }

        *self.backed_up.write() = false;
    }
}

async fn run_checked(command: &mut Command) -> std::io::Result<()> {
    let output = command.output().await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "command failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn add_route(network: &str, via: &str) -> std::io::Result<()> {
    // `via` is a gateway IP for direct routes but a device name for the tun
    // default route.
    if via.parse::<Ipv4Addr>().is_ok() {
        run_checked(Command::new("ip").args(["route", "add", network, "via", via])).await
    } else {
        run_checked(Command::new("ip").args(["route", "add", network, "dev", via])).await
    }
}

#[cfg(target_os = "linux")]
async fn delete_route(network: &str, via: &str) -> std::io::Result<()> {
    if via.parse::<Ipv4Addr>().is_ok() {
        run_checked(Command::new("ip").args(["route", "delete", network, "via", via])).await
    } else {
        run_checked(Command::new("ip").args(["route", "delete", network, "dev", via])).await
    }
}

#[cfg(target_os = "linux")]
async fn default_gateway() -> std::io::Result<String> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    parse_field_after(&text, "via").ok_or_else(|| {
        std::io::Error::other("default gateway not found")
    })
}

#[cfg(target_os = "linux")]
async fn default_interface_ip() -> std::io::Result<Ipv4Addr> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    let interface = parse_field_after(&text, "dev").ok_or_else(|| {
        std::io::Error::other("default interface not found")
    })?;

    let output = Command::new("ip")
        .args(["-4", "addr", "show", "dev", &interface])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("inet ") {
            let addr = rest.split(['/', ' ']).next().unwrap_or("");
            if let Ok(ip) = addr.parse::<Ipv4Addr>() {
                return Ok(ip);
            }
        }
    }
    Err(std::io::Error::other(format!(
        "no ipv4 address on interface {}",
        interface
    )))
}

#[cfg(target_os = "macos")]
async fn add_route(network: &str, via: &str) -> std::io::Result<()> {
    let (addr, mask) = split_cidr(network)?;
    if via.parse::<Ipv4Addr>().is_ok() {
        run_checked(Command::new("route").args(["add", "-net", &addr, "-netmask", &mask, via]))
            .await
    } else {
        run_checked(
            Command::new("route").args(["add", "-net", &addr, "-netmask", &mask, "-interface", via]),
        )
        .await
    }
}

#[cfg(target_os = "macos")]
async fn delete_route(network: &str, via: &str) -> std::io::Result<()> {
    let (addr, mask) = split_cidr(network)?;
    let _ = via;
    run_checked(Command::new("route").args(["delete", "-net", &addr, "-netmask", &mask])).await
}

#[cfg(target_os = "macos")]
async fn default_gateway() -> std::io::Result<String> {
    let output = Command::new("route")
        .args(["-n", "get", "default"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if let Some(value) = line.trim().strip_prefix("gateway:") {
            return Ok(value.trim().to_string());
        }
    }
    Err(std::io::Error::other("default gateway not found"))
}

#[cfg(target_os = "macos")]
async fn default_interface_ip() -> std::io::Result<Ipv4Addr> {
    let output = Command::new("route")
        .args(["-n", "get", "default"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    let mut interface = None;
    for line in text.lines() {
        if let Some(value) = line.trim().strip_prefix("interface:") {
            interface = Some(value.trim().to_string());
            break;
        }
    }
    let interface = interface
        .ok_or_else(|| std::io::Error::other("default interface not found"))?;

    let output = Command::new("ipconfig")
        .args(["getifaddr", &interface])
        .output()
        .await?;
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|e| std::io::Error::other(format!("bad interface address: {}", e)))
}

#[cfg(target_os = "windows")]
async fn add_route(network: &str, via: &str) -> std::io::Result<()> {
    let (addr, mask) = split_cidr(network)?;
    run_checked(Command::new("route").args(["add", &addr, "mask", &mask, via, "metric", "1"]))
        .await
}

#[cfg(target_os = "windows")]
async fn default_gateway() -> std::io::Result<String> {
    let output = Command::new("route")
        .args(["print", "0.0.0.0"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[0] == "0.0.0.0" && fields[1] == "0.0.0.0" {
            return Ok(fields[2].to_string());
        }
    }
    Err(std::io::Error::other("default gateway not found"))
}

#[cfg(target_os = "windows")]
async fn default_interface_ip() -> std::io::Result<Ipv4Addr> {
    let output = Command::new("route")
        .args(["print", "0.0.0.0"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // interface address is the fourth column of the default route line
        if fields.len() >= 4 && fields[0] == "0.0.0.0" && fields[1] == "0.0.0.0" {
            if let Ok(ip) = fields[3].parse::<Ipv4Addr>() {
                return Ok(ip);
            }
        }
    }
    Err(std::io::Error::other("default interface not found"))
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn split_cidr(network: &str) -> std::io::Result<(String, String)> {
    let (addr, bits) = network.split_once('/').ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not a CIDR: {}", network),
        )
    })?;
    let bits: u8 = bits.parse().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("bad prefix length in {}: {}", network, e),
        )
    })?;
    let mask: u32 = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ok((addr.to_string(), Ipv4Addr::from(mask).to_string()))
}

#[cfg(target_os = "linux")]
fn parse_field_after(text: &str, field: &str) -> Option<String> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    fields
        .iter()
        .position(|f| *f == field)
        .and_then(|i| fields.get(i + 1))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_ips_set_and_lookup() {
        let peers = PeerIps::default();
        assert!(!peers.contains(Ipv4Addr::new(1, 2, 3, 4)));
        peers.replace(vec![Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)]);
        assert!(peers.contains(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(peers.contains(Ipv4Addr::new(5, 6, 7, 8)));
        peers.replace(vec![]);
        assert!(!peers.contains(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_field_after() {
        let output = "default via 192.168.1.1 dev eth0 proto dhcp metric 100";
        assert_eq!(
            parse_field_after(output, "via"),
            Some("192.168.1.1".to_string())
        );
        assert_eq!(parse_field_after(output, "dev"), Some("eth0".to_string()));
        assert_eq!(parse_field_after(output, "src"), None);
    }
}
