use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::doh::DohClient;

use super::packet::{build_ipv4, build_udp, Ipv4Packet, UdpDatagram, IP_PROTOCOL_UDP};

const MAX_POINTER_JUMPS: usize = 5;
const ANSWER_TTL_SECS: u32 = 60;
const CACHE_TTL: Duration = Duration::from_secs(60);

const RCODE_NXDOMAIN: u8 = 3;

#[derive(Debug, PartialEq)]
pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
}

/// Answers DNS queries captured on the virtual interface: resolution goes
/// through DoH (with the configured ECS hint) and replies are synthesized
/// directly back onto the device, so no cleartext DNS ever leaves the host.
pub struct DnsInterceptor {
    doh: Arc<DohClient>,
    cache: RwLock<FxHashMap<String, (Ipv4Addr, Instant)>>,
}

impl DnsInterceptor {
    pub fn new(doh: Arc<DohClient>) -> Self {
        Self {
            doh,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Handles one UDP/53 packet. The returned buffer is a complete IPv4
    /// packet ready to be written back to the device; None means the query
    /// was unparseable and should be dropped.
    pub async fn handle_query(
        &self,
        ip_packet: &Ipv4Packet<'_>,
        datagram: &UdpDatagram<'_>,
    ) -> Option<Vec<u8>> {
        let query = match parse_dns_query(datagram.data) {
            Ok(query) => query,
            Err(e) => {
                warn!("failed to parse dns query: {}", e);
                return None;
            }
        };

        let ip = match self.resolve(&query.name).await {
            Some(ip) => ip,
            None => {
                debug!("resolving {} failed, answering NXDOMAIN", query.name);
                let reply = build_dns_error_reply(&query, RCODE_NXDOMAIN);
                return Some(encapsulate_reply(ip_packet, datagram, &reply));
            }
        };

        debug!("dns intercept: {} -> {}", query.name, ip);
        let reply = build_dns_reply(&query, ip);
        Some(encapsulate_reply(ip_packet, datagram, &reply))
    }

    async fn resolve(&self, name: &str) -> Option<Ipv4Addr> {
        if let Some((ip, expires_at)) = self.cache.read().get(name) {
            if Instant::now() < *expires_at {
                return Some(*ip);
            }
        }

        let response = self.doh.query_a(name).await.ok()?;
        let ip = response.first_a_record()?;

        self.cache
            .write()
            .insert(name.to_string(), (ip, Instant::now() + CACHE_TTL));
        Some(ip)
    }

    #[cfg(test)]
    pub fn prime_cache(&self, name: &str, ip: Ipv4Addr) {
        self.cache
            .write()
            .insert(name.to_string(), (ip, Instant::now() + CACHE_TTL));
    }
}

pub fn parse_dns_query(data: &[u8]) -> std::io::Result<DnsQuery> {
    if data.len() < 12 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "dns query too short",
        ));
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let (name, offset) = parse_dns_name(data, 12)?;

    if data.len() < offset + 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "dns question truncated",
        ));
    }
    let qtype = u16::from_be_bytes([data[offset], data[offset + 1]]);

    Ok(DnsQuery { id, name, qtype })
}

/// Walks a possibly-compressed name. Pointer jumps are capped so a
/// malicious pointer loop cannot spin forever.
pub fn parse_dns_name(data: &[u8], mut offset: usize) -> std::io::Result<(String, usize)> {
    let mut name = String::new();
    let mut end_offset = 0usize;
    let mut jumped = false;
    let mut jumps = 0usize;

    loop {
        if offset >= data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "dns name out of bounds",
            ));
        }

        let length = data[offset] as usize;

        if length & 0xc0 == 0xc0 {
            if jumps >= MAX_POINTER_JUMPS {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "too many dns name pointer jumps",
                ));
            }
            if offset + 1 >= data.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "dns pointer out of bounds",
                ));
            }
            let pointer =
                (u16::from_be_bytes([data[offset], data[offset + 1]]) & 0x3fff) as usize;
            if !jumped {
                end_offset = offset + 2;
            }
            jumped = true;
            jumps += 1;
            offset = pointer;
            continue;
        }

        offset += 1;
        if length == 0 {
            break;
        }

        if offset + length > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "dns label out of bounds",
            ));
        }

        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(
            std::str::from_utf8(&data[offset..offset + length]).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("dns label is not utf8: {}", e),
                )
            })?,
        );
        offset += length;
    }

    if jumped {
        Ok((name, end_offset))
    } else {
        Ok((name, offset))
    }
}

/// Emits the wire form of a question section for `name`.
pub fn encode_question(name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 6);
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // class IN
    out
}

fn dns_header(id: u16, rcode: u8, answer_count: u16) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..2].copy_from_slice(&id.to_be_bytes());
    header[2] = 0x81; // QR=1, RD=1
    header[3] = 0x80 | (rcode & 0x0f); // RA=1
    header[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    header[6..8].copy_from_slice(&answer_count.to_be_bytes()); // ANCOUNT
    header
}

fn build_dns_reply(query: &DnsQuery, ip: Ipv4Addr) -> Vec<u8> {
    let mut reply = Vec::with_capacity(64);
    reply.extend_from_slice(&dns_header(query.id, 0, 1));
    reply.extend_from_slice(&encode_question(&query.name, query.qtype));

    // Answer: name pointer back to the question at offset 12.
    reply.extend_from_slice(&[0xc0, 0x0c]);
    reply.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
    reply.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
    reply.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    reply.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
    reply.extend_from_slice(&ip.octets());
    reply
}

fn build_dns_error_reply(query: &DnsQuery, rcode: u8) -> Vec<u8> {
    let mut reply = Vec::with_capacity(32);
    reply.extend_from_slice(&dns_header(query.id, rcode, 0));
    reply.extend_from_slice(&encode_question(&query.name, query.qtype));
    reply
}

/// Wraps a DNS payload in UDP and IPv4 with source/destination swapped from
/// the query packet.
fn encapsulate_reply(
    ip_packet: &Ipv4Packet<'_>,
    datagram: &UdpDatagram<'_>,
    dns_payload: &[u8],
) -> Vec<u8> {
    let udp = build_udp(datagram.dst_port, datagram.src_port, dns_payload);
    build_ipv4(ip_packet.dst_ip, ip_packet.src_ip, IP_PROTOCOL_UDP, &udp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::packet::{parse_ipv4, parse_udp};

    fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x00]); // RD
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&encode_question(name, qtype));
        out
    }

    #[test]
    fn test_query_parse() {
        let wire = encode_query(0xabcd, "foo.example", 1);
        let query = parse_dns_query(&wire).unwrap();
        assert_eq!(query.id, 0xabcd);
        assert_eq!(query.name, "foo.example");
        assert_eq!(query.qtype, 1);
    }

    #[test]
    fn test_name_emit_then_parse_round_trip() {
        for name in ["example.com", "a.b.c.d.example.org", "x.cn"] {
            let wire = encode_question(name, 1);
            let (parsed, offset) = parse_dns_name(&wire, 0).unwrap();
            assert_eq!(parsed, name);
            assert_eq!(offset, wire.len() - 4);
        }
    }

    #[test]
    fn test_compressed_name() {
        // Header + question, then a name that points back at offset 12.
        let mut wire = encode_query(1, "foo.example", 1);
        let pointer_at = wire.len();
        wire.extend_from_slice(&[0xc0, 0x0c]);
        let (name, offset) = parse_dns_name(&wire, pointer_at).unwrap();
        assert_eq!(name, "foo.example");
        assert_eq!(offset, pointer_at + 2);
    }

    #[test]
    fn test_pointer_loop_capped() {
        // A pointer at offset 12 pointing to itself.
        let mut wire = vec![0u8; 14];
        wire[12] = 0xc0;
        wire[13] = 0x0c;
        assert!(parse_dns_name(&wire, 12).is_err());
    }

    #[tokio::test]
    async fn test_intercepted_query_answered_from_cache() {
        let doh = Arc::new(DohClient::new(None, None).unwrap());
        let interceptor = DnsInterceptor::new(doh);
        interceptor.prime_cache("foo.example", Ipv4Addr::new(1, 2, 3, 4));

        let dns_query = encode_query(0xabcd, "foo.example", 1);
        let udp = build_udp(33999, 53, &dns_query);
        let ip = build_ipv4(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            IP_PROTOCOL_UDP,
            &udp,
        );

        let parsed_ip = parse_ipv4(&ip).unwrap();
        let parsed_udp = parse_udp(parsed_ip.data).unwrap();
        let reply = interceptor
            .handle_query(&parsed_ip, &parsed_udp)
            .await
            .unwrap();

        // IPs and ports are swapped relative to the query.
        let reply_ip = parse_ipv4(&reply).unwrap();
        assert_eq!(reply_ip.src_ip, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(reply_ip.dst_ip, Ipv4Addr::new(10, 0, 0, 2));

        let reply_udp = parse_udp(reply_ip.data).unwrap();
        assert_eq!(reply_udp.src_port, 53);
        assert_eq!(reply_udp.dst_port, 33999);

        let payload = reply_udp.data;
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 0xabcd);
        assert_eq!(payload[2] & 0x80, 0x80); // QR
        assert_eq!(payload[3] & 0x0f, 0); // RCODE 0
        assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), 1); // ANCOUNT

        // The answer section sits after the question: pointer, type A,
        // class IN, TTL 60, RDLENGTH 4, then the address.
        let question_len = encode_question("foo.example", 1).len();
        let answer = &payload[12 + question_len..];
        assert_eq!(&answer[0..2], &[0xc0, 0x0c]);
        assert_eq!(u16::from_be_bytes([answer[2], answer[3]]), 1);
        assert_eq!(u16::from_be_bytes([answer[4], answer[5]]), 1);
        assert_eq!(
            u32::from_be_bytes([answer[6], answer[7], answer[8], answer[9]]),
            60
        );
        assert_eq!(u16::from_be_bytes([answer[10], answer[11]]), 4);
        assert_eq!(&answer[12..16], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_unresolvable_name_yields_nxdomain() {
        // No DoH endpoint is reachable, so the resolver path fails and the
        // interceptor must degrade to NXDOMAIN.
        let doh = Arc::new(DohClient::new(None, None).unwrap());
        let interceptor = DnsInterceptor::new(doh);

        let dns_query = encode_query(7, "invalid.name.test.invalid", 1);
        let udp = build_udp(40000, 53, &dns_query);
        let ip = build_ipv4(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 4, 4),
            IP_PROTOCOL_UDP,
            &udp,
        );

        let parsed_ip = parse_ipv4(&ip).unwrap();
        let parsed_udp = parse_udp(parsed_ip.data).unwrap();
        let reply = interceptor
            .handle_query(&parsed_ip, &parsed_udp)
            .await
            .unwrap();

        let reply_ip = parse_ipv4(&reply).unwrap();
        let reply_udp = parse_udp(reply_ip.data).unwrap();
        let payload = reply_udp.data;
        assert_eq!(payload[3] & 0x0f, RCODE_NXDOMAIN);
        assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), 0);
    }
}
