use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

pub const MAX_HOSTNAME_LEN: usize = 253;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty address",
            ));
        }

        let mut dots = 0;
        let mut possible_ipv4 = true;
        let mut possible_ipv6 = true;
        let mut possible_hostname = true;
        for b in s.as_bytes().iter() {
            let c = *b;
            if c == b':' {
                possible_ipv4 = false;
                possible_hostname = false;
                break;
            } else if c == b'.' {
                possible_ipv6 = false;
                dots += 1;
                if dots > 3 {
                    // can only be a hostname.
                    break;
                }
            } else if (c >= b'A' && c <= b'F') || (c >= b'a' && c <= b'f') {
                possible_ipv4 = false;
            } else if c < b'0' || c > b'9' {
                possible_ipv4 = false;
                possible_ipv6 = false;
                break;
            }
        }

        if possible_ipv4 && dots == 3 {
            if let Ok(addr) = s.parse::<Ipv4Addr>() {
                return Ok(Address::Ipv4(addr));
            }
        }

        if possible_ipv6 {
            if let Ok(addr) = s.parse::<Ipv6Addr>() {
                return Ok(Address::Ipv6(addr));
            }
        }

        if !possible_hostname {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad address: {}", s),
            ));
        }

        if s.len() > MAX_HOSTNAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("hostname too long: {} bytes", s.len()),
            ));
        }

        Ok(Address::Hostname(s.to_string()))
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(ref hostname) => Some(hostname),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            Address::Ipv6(addr) => Some(IpAddr::V6(*addr)),
            Address::Hostname(_) => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(addr) => write!(f, "{}", addr),
            Address::Ipv6(addr) => write!(f, "{}", addr),
            Address::Hostname(hostname) => write!(f, "{}", hostname),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// Parses a `host:port` string. The port separator is the last colon,
    /// so bare (bracketless) IPv6 addresses with a trailing port still parse.
    /// An empty host maps to 127.0.0.1.
    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        let s = s.trim();

        // Bracketed IPv6: [::1]:8080
        if let Some(stripped) = s.strip_prefix('[') {
            let close = stripped.find(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad address: {}", s),
                )
            })?;
            let address = Address::from(&stripped[..close])?;
            let rest = &stripped[close + 1..];
            let port = if let Some(port_str) = rest.strip_prefix(':') {
                parse_port(port_str)?
            } else if rest.is_empty() {
                default_port.ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "missing port")
                })?
            } else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad address: {}", s),
                ));
            };
            return Ok(Self { address, port });
        }

        let (address_str, port) = match s.rfind(':') {
            Some(i) => {
                // The ':' could be part of a bare ipv6 address.
                match s[i + 1..].parse::<u16>() {
                    Ok(port) => (&s[0..i], Some(port)),
                    Err(_) => (s, default_port),
                }
            }
            None => (s, default_port),
        };

        let address = if address_str.is_empty() {
            Address::Ipv4(Ipv4Addr::LOCALHOST)
        } else {
            Address::from(address_str)?
        };

        let port = port.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "missing port")
        })?;

        Ok(Self { address, port })
    }

    pub fn from_ip_addr(ip: IpAddr, port: u16) -> Self {
        let address = match ip {
            IpAddr::V4(addr) => Address::Ipv4(addr),
            IpAddr::V6(addr) => Address::Ipv6(addr),
        };
        Self { address, port }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Address::Ipv6(ref addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

fn parse_port(s: &str) -> std::io::Result<u16> {
    s.parse::<u16>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad port {}: {}", s, e),
        )
    })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn to_u16(self) -> u16 {
        match self {
            Protocol::Tcp => 1,
            Protocol::Udp => 3,
        }
    }

    pub fn from_u16(value: u16) -> std::io::Result<Self> {
        match value {
            1 => Ok(Protocol::Tcp),
            3 => Ok(Protocol::Udp),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown protocol tag: {}", value),
            )),
        }
    }
}

/// State owned by a SOCKS5 UDP ASSOCIATE session: the locally bound relay
/// socket and the address we announced to the client.
#[derive(Debug)]
pub struct UdpRelay {
    pub socket: Arc<UdpSocket>,
    pub bound_addr: SocketAddr,
}

/// The destination a proxied session wants to reach: a hostname or IP plus
/// port and a protocol tag. UDP ASSOCIATE targets additionally carry the
/// relay socket used to shuttle datagrams.
#[derive(Debug)]
pub struct Target {
    pub location: NetLocation,
    pub protocol: Protocol,
    pub udp_relay: Option<UdpRelay>,
}

impl Target {
    pub fn new(location: NetLocation, protocol: Protocol) -> Self {
        Self {
            location,
            protocol,
            udp_relay: None,
        }
    }

    pub fn from_host_port(s: &str) -> std::io::Result<Self> {
        Ok(Self::new(NetLocation::from_str(s, None)?, Protocol::Tcp))
    }

    pub fn host(&self) -> String {
        self.location.address().to_string()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hostname_location() {
        let loc = NetLocation::from_str("www.example.com:443", None).unwrap();
        assert_eq!(loc.address().hostname(), Some("www.example.com"));
        assert_eq!(loc.port(), 443);
    }

    #[test]
    fn test_parse_ipv4_location() {
        let loc = NetLocation::from_str("10.5.5.5:80", None).unwrap();
        assert_eq!(
            loc.address().ip(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 5, 5, 5)))
        );
        assert_eq!(loc.port(), 80);
    }

    #[test]
    fn test_parse_bracketed_ipv6_location() {
        let loc = NetLocation::from_str("[2001:db8::1]:8080", None).unwrap();
        assert!(matches!(loc.address(), Address::Ipv6(_)));
        assert_eq!(loc.port(), 8080);
    }

    #[test]
    fn test_empty_host_becomes_loopback() {
        let loc = NetLocation::from_str(":1080", None).unwrap();
        assert_eq!(
            loc.address().ip(),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(loc.port(), 1080);
    }

    #[test]
    fn test_missing_port_fails() {
        assert!(NetLocation::from_str("example.com", None).is_err());
    }

    #[test]
    fn test_bad_port_fails() {
        assert!(NetLocation::from_str("example.com:notaport", None).is_err());
    }

    #[test]
    fn test_port_boundaries() {
        assert_eq!(NetLocation::from_str("host:0", None).unwrap().port(), 0);
        assert_eq!(
            NetLocation::from_str("host:65535", None).unwrap().port(),
            65535
        );
        assert!(NetLocation::from_str("host:65536", None).is_err());
    }

    #[test]
    fn test_hostname_length_limit() {
        let label = "a".repeat(59);
        let mut name = String::new();
        for _ in 0..4 {
            name.push_str(&label);
            name.push('.');
        }
        name.push_str("abcde.com");
        assert_eq!(name.len(), 249);
        assert!(Address::from(&name).is_ok());

        let too_long = "a".repeat(254);
        assert!(Address::from(&too_long).is_err());
        let max_len = "a".repeat(253);
        assert!(Address::from(&max_len).is_ok());
    }

    #[test]
    fn test_protocol_tags() {
        assert_eq!(Protocol::Tcp.to_u16(), 1);
        assert_eq!(Protocol::Udp.to_u16(), 3);
        assert!(Protocol::from_u16(2).is_err());
        assert_eq!(Protocol::from_u16(3).unwrap(), Protocol::Udp);
    }

    #[test]
    fn test_target_string_form() {
        let target = Target::from_host_port("www.example.com:443").unwrap();
        assert_eq!(target.to_string(), "www.example.com:443");
        assert_eq!(target.host(), "www.example.com");
    }
}
