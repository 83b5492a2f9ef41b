use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::address::{NetLocation, Protocol, Target};
use crate::async_stream::AsyncStream;
use crate::remote::create_remote;
use crate::route_manager::PeerIps;
use crate::routing::pick_remote_kind;
use crate::services::Services;
use crate::util::allocate_vec;

use super::device::PacketDevice;
use super::dns::DnsInterceptor;
use super::packet::{parse_ipv4, parse_tcp, parse_udp, Ipv4Packet};
use super::packet::{build_ipv4, build_udp, IP_PROTOCOL_TCP, IP_PROTOCOL_UDP};

/// Upper bound on simultaneous flows; packets beyond it are dropped.
const MAX_FLOWS: usize = 1000;

struct Flow {
    id: String,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    protocol: u8,
    write_half: tokio::sync::Mutex<FlowWriter>,
}

struct FlowWriter {
    writer: WriteHalf<Box<dyn AsyncStream>>,
    closed: bool,
}

/// The virtual-interface data plane: drops bogons, intercepts DNS, tracks
/// flows by 5-tuple, and pumps payload bytes between captured packets and
/// the egress transport chosen by the routing decision.
///
/// There is intentionally no TCP state machine here - payload bytes are
/// forwarded as-is and return traffic is emitted as payload-only packets.
/// The deployed configuration puts a user-space TCP/IP stack between the
/// kernel and this handler; see DESIGN.md.
pub struct TunHandler {
    device: Arc<dyn PacketDevice>,
    services: Arc<Services>,
    peer_ips: Arc<PeerIps>,
    dns: DnsInterceptor,
    flows: RwLock<FxHashMap<String, Arc<Flow>>>,
    flow_count: Mutex<usize>,
}

impl TunHandler {
    pub fn new(
        device: Arc<dyn PacketDevice>,
        services: Arc<Services>,
        peer_ips: Arc<PeerIps>,
    ) -> Self {
        let dns = DnsInterceptor::new(services.doh.clone());
        Self {
            device,
            services,
            peer_ips,
            dns,
            flows: RwLock::new(FxHashMap::default()),
            flow_count: Mutex::new(0),
        }
    }

    /// Reads packets off the device until it closes or errors. Each packet
    /// is handled on its own task so a slow egress dial never stalls the
    /// read loop.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let mut buf = allocate_vec(65536);
        loop {
            let n = self.device.read_packet(&mut buf).await?;
            if n == 0 {
                break;
            }
            let packet = buf[..n].to_vec();
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_packet(&packet).await;
            });
        }
        Ok(())
    }

    pub(crate) async fn handle_packet(self: &Arc<Self>, packet: &[u8]) {
        // Malformed packets are dropped without a trace; a single bad
        // packet must never take the data plane down.
        let Ok(ip_packet) = parse_ipv4(packet) else {
            return;
        };

        if !self.should_handle(&ip_packet) {
            return;
        }

        if ip_packet.protocol != IP_PROTOCOL_TCP && ip_packet.protocol != IP_PROTOCOL_UDP {
            return;
        }

        if ip_packet.protocol == IP_PROTOCOL_UDP {
            if let Ok(datagram) = parse_udp(ip_packet.data) {
                if datagram.dst_port == 53 {
                    if let Some(reply) = self.dns.handle_query(&ip_packet, &datagram).await {
                        let _ = self.device.write_packet(&reply).await;
                    }
                    return;
                }
            } else {
                return;
            }
        }

        let Some(flow_id) = flow_id(&ip_packet) else {
            return;
        };

        let existing = self.flows.read().get(&flow_id).cloned();
        let flow = match existing {
            Some(flow) => flow,
            None => {
                {
                    let mut count = self.flow_count.lock();
                    if *count >= MAX_FLOWS {
                        warn!("flow table full ({}), dropping packet", MAX_FLOWS);
                        return;
                    }
                    *count += 1;
                }

                // Only a SYN may open a TCP flow; mid-stream segments for
                // unknown flows are stale and dropped.
                if ip_packet.protocol == IP_PROTOCOL_TCP {
                    match parse_tcp(ip_packet.data) {
                        Ok(segment) if segment.is_syn() => (),
                        _ => {
                            *self.flow_count.lock() -= 1;
                            return;
                        }
                    }
                }

                match self.create_flow(&ip_packet, flow_id.clone()).await {
                    Ok(flow) => {
                        self.flows.write().insert(flow_id.clone(), flow.clone());
                        flow
                    }
                    Err(e) => {
                        *self.flow_count.lock() -= 1;
                        debug!("failed to open flow to {}: {}", ip_packet.dst_ip, e);
                        return;
                    }
                }
            }
        };

        let payload: &[u8] = match ip_packet.protocol {
            IP_PROTOCOL_TCP => match parse_tcp(ip_packet.data) {
                // The SYN itself carries no forwardable payload.
                Ok(segment) if segment.is_syn() => return,
                Ok(segment) => segment.data,
                Err(_) => return,
            },
            _ => match parse_udp(ip_packet.data) {
                Ok(datagram) => datagram.data,
                Err(_) => return,
            },
        };

        if payload.is_empty() {
            return;
        }

        let mut writer = flow.write_half.lock().await;
        if writer.closed {
            return;
        }
        if let Err(e) = async {
            writer.writer.write_all(payload).await?;
            writer.writer.flush().await
        }
        .await
        {
            debug!("egress write for {} failed: {}", flow.id, e);
            writer.closed = true;
        }
    }

    async fn create_flow(
        self: &Arc<Self>,
        ip_packet: &Ipv4Packet<'_>,
        flow_id: String,
    ) -> std::io::Result<Arc<Flow>> {
        let (src_port, dst_port, protocol) = match ip_packet.protocol {
            IP_PROTOCOL_TCP => {
                let segment = parse_tcp(ip_packet.data)?;
                (segment.src_port, segment.dst_port, Protocol::Tcp)
            }
            _ => {
                let datagram = parse_udp(ip_packet.data)?;
                (datagram.src_port, datagram.dst_port, Protocol::Udp)
            }
        };

        let target = Target::new(
            NetLocation::from_ip_addr(IpAddr::V4(ip_packet.dst_ip), dst_port),
            protocol,
        );

        let remote_kind = pick_remote_kind(&target, &self.services).await;
        let remote = create_remote(remote_kind, self.services.clone());
        debug!("tun flow {} via {}", flow_id, remote.name());

        let stream = remote.handshake(&target).await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let flow = Arc::new(Flow {
            id: flow_id,
            src_ip: ip_packet.src_ip,
            dst_ip: ip_packet.dst_ip,
            src_port,
            dst_port,
            protocol: ip_packet.protocol,
            write_half: tokio::sync::Mutex::new(FlowWriter {
                writer: write_half,
                closed: false,
            }),
        });

        let this = self.clone();
        let flow_for_task = flow.clone();
        tokio::spawn(async move {
            this.run_return_path(flow_for_task, read_half).await;
        });

        Ok(flow)
    }

    /// Pumps egress bytes back onto the device as payload-only packets with
    /// source and destination swapped from the flow's first packet.
    async fn run_return_path(
        self: Arc<Self>,
        flow: Arc<Flow>,
        mut read_half: ReadHalf<Box<dyn AsyncStream>>,
    ) {
        let mut buf = allocate_vec(65536);

        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let packet = if flow.protocol == IP_PROTOCOL_UDP {
                let udp = build_udp(flow.dst_port, flow.src_port, &buf[..n]);
                build_ipv4(flow.dst_ip, flow.src_ip, IP_PROTOCOL_UDP, &udp)
            } else {
                build_ipv4(flow.dst_ip, flow.src_ip, flow.protocol, &buf[..n])
            };

            if self.device.write_packet(&packet).await.is_err() {
                break;
            }
        }

        self.flows.write().remove(&flow.id);
        *self.flow_count.lock() -= 1;

        let mut writer = flow.write_half.lock().await;
        writer.closed = true;
        let _ = writer.writer.shutdown().await;
    }

    /// Fast-path drop rules. Everything here should have been routed off
    /// the virtual interface in the first place; forwarding it anyway would
    /// loop traffic or leak local segments into the tunnel.
    fn should_handle(&self, ip_packet: &Ipv4Packet<'_>) -> bool {
        let dst = ip_packet.dst_ip;
        let octets = dst.octets();

        if dst.is_loopback() || ip_packet.src_ip.is_loopback() {
            return false;
        }

        if dst == Ipv4Addr::BROADCAST {
            return false;
        }

        // 224.0.0.0/4 multicast
        if octets[0] >= 224 && octets[0] <= 239 {
            return false;
        }

        // 169.254.0.0/16 link-local
        if octets[0] == 169 && octets[1] == 254 {
            return false;
        }

        // 10.0.0.0/8 stays local, except the tunnel's own 10.0.0.0/24.
        if octets[0] == 10 && (octets[1] != 0 || octets[2] != 0) {
            return false;
        }

        // 172.16.0.0/12
        if octets[0] == 172 && (16..=31).contains(&octets[1]) {
            return false;
        }

        // 192.168.0.0/16
        if octets[0] == 192 && octets[1] == 168 {
            return false;
        }

        // subnet broadcast
        if octets[3] == 255 {
            return false;
        }

        // The tunnel peer itself must never be re-captured or the tunnel
        // would carry its own packets forever.
        if self.peer_ips.contains(dst) {
            return false;
        }

        true
    }

    #[cfg(test)]
    fn flow_count(&self) -> usize {
        *self.flow_count.lock()
    }
}

fn flow_id(ip_packet: &Ipv4Packet<'_>) -> Option<String> {
    match ip_packet.protocol {
        IP_PROTOCOL_TCP => {
            let segment = parse_tcp(ip_packet.data).ok()?;
            Some(format!(
                "{}:{}-{}:{}-tcp",
                ip_packet.src_ip, segment.src_port, ip_packet.dst_ip, segment.dst_port
            ))
        }
        IP_PROTOCOL_UDP => {
            let datagram = parse_udp(ip_packet.data).ok()?;
            Some(format!(
                "{}:{}-{}:{}-udp",
                ip_packet.src_ip, datagram.src_port, ip_packet.dst_ip, datagram.dst_port
            ))
        }
        _ => None,
    }
}
