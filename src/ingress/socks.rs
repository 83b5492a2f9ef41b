use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::address::{Address, NetLocation, Protocol, Target, UdpRelay};
use crate::async_stream::AsyncStream;
use crate::line_reader::LineReader;
use super::http::setup_http_session;
use super::{IngressHandler, IngressSession, HANDSHAKE_READ_TIMEOUT};

pub const VER_SOCKS5: u8 = 0x05;

pub const METHOD_NONE: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

/// SOCKS5 server (RFC 1928, no auth) with an HTTP-proxy fallthrough: a
/// first byte that looks like an HTTP method letter hands the connection to
/// the HTTP handler instead.
pub struct SocksServer;

impl SocksServer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IngressHandler for SocksServer {
    async fn setup_server_stream(&self, stream: TcpStream) -> std::io::Result<IngressSession> {
        let local_ip = stream.local_addr()?.ip();
        let mut stream: Box<dyn AsyncStream> = Box::new(stream);
        let mut reader = LineReader::new_with_buffer_size(512);

        let first_byte = match timeout(HANDSHAKE_READ_TIMEOUT, reader.peek_u8(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for first byte",
                ));
            }
        };

        if first_byte == VER_SOCKS5 {
            return setup_socks_session(stream, reader, local_ip).await;
        }

        // HTTP methods that can reach a proxy port: CONNECT, GET, POST/PUT/
        // PATCH, DELETE, HEAD, OPTIONS.
        if matches!(first_byte, b'C' | b'G' | b'P' | b'D' | b'H' | b'O') {
            debug!("first byte 0x{:02x}, handling as http proxy", first_byte);
            return setup_http_session(stream, reader).await;
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported protocol, first byte 0x{:02x}", first_byte),
        ))
    }

    fn name(&self) -> &'static str {
        "SocksServer"
    }
}

async fn setup_socks_session(
    mut stream: Box<dyn AsyncStream>,
    mut reader: LineReader,
    local_ip: IpAddr,
) -> std::io::Result<IngressSession> {
    let handshake = async {
        let version = reader.read_u8(&mut stream).await?;
        if version != VER_SOCKS5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported socks version: {}", version),
            ));
        }

        let method_count = reader.read_u8(&mut stream).await? as usize;
        if method_count == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no auth methods provided",
            ));
        }
        let methods = reader.read_slice(&mut stream, method_count).await?;
        if !methods.contains(&METHOD_NONE) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no-auth method not offered",
            ));
        }

        stream.write_all(&[VER_SOCKS5, METHOD_NONE]).await?;

        let version = reader.read_u8(&mut stream).await?;
        if version != VER_SOCKS5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bad request version: {}", version),
            ));
        }
        let command = reader.read_u8(&mut stream).await?;
        let _reserved = reader.read_u8(&mut stream).await?;

        let address_type = reader.read_u8(&mut stream).await?;
        let address = match address_type {
            ADDR_TYPE_IPV4 => {
                let bytes = reader.read_slice(&mut stream, 4).await?;
                let octets: [u8; 4] = bytes.try_into().unwrap();
                Address::Ipv4(Ipv4Addr::from(octets))
            }
            ADDR_TYPE_IPV6 => {
                let bytes = reader.read_slice(&mut stream, 16).await?;
                let octets: [u8; 16] = bytes.try_into().unwrap();
                Address::Ipv6(Ipv6Addr::from(octets))
            }
            ADDR_TYPE_DOMAIN_NAME => {
                let len = reader.read_u8(&mut stream).await? as usize;
                let bytes = reader.read_slice(&mut stream, len).await?;
                let name = std::str::from_utf8(bytes).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("bad domain name: {}", e),
                    )
                })?;
                // Some clients pass literal IPs with the domain type.
                Address::from(name)?
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown address type: {}", address_type),
                ));
            }
        };
        let port = reader.read_u16_be(&mut stream).await?;

        Ok((command, NetLocation::new(address, port)))
    };

    let (command, location) = match timeout(HANDSHAKE_READ_TIMEOUT, handshake).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "socks handshake timed out",
            ));
        }
    };

    match command {
        CMD_CONNECT => {
            let target = Target::new(location, Protocol::Tcp);

            // Reply with a zero bind address; the real bound address is not
            // known until the egress dial happens.
            stream
                .write_all(&[VER_SOCKS5, 0x00, 0x00, ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0])
                .await?;
            stream.flush().await?;

            Ok(IngressSession {
                stream,
                target,
                initial_remote_data: None,
            })
        }
        CMD_UDP_ASSOCIATE => {
            let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await.map_err(|e| {
                std::io::Error::new(e.kind(), format!("cannot bind udp relay socket: {}", e))
            })?;
            let bound_addr = socket.local_addr()?;

            let mut reply = Vec::with_capacity(22);
            reply.extend_from_slice(&[VER_SOCKS5, 0x00, 0x00]);
            match bound_addr.ip() {
                IpAddr::V4(v4) => {
                    reply.push(ADDR_TYPE_IPV4);
                    reply.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    reply.push(ADDR_TYPE_IPV6);
                    reply.extend_from_slice(&v6.octets());
                }
            }
            reply.extend_from_slice(&bound_addr.port().to_be_bytes());
            stream.write_all(&reply).await?;
            stream.flush().await?;

            let mut target = Target::new(location, Protocol::Udp);
            target.udp_relay = Some(UdpRelay {
                socket: Arc::new(socket),
                bound_addr,
            });

            Ok(IngressSession {
                stream,
                target,
                initial_remote_data: None,
            })
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported command: {}", command),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let (mut client, server) = accepted_pair().await;
        let handler = SocksServer::new();

        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0x05, 0x00]);

            // CONNECT example.com:443 via domain address type.
            let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
            request.extend_from_slice(b"example.com");
            request.extend_from_slice(&443u16.to_be_bytes());
            client.write_all(&request).await.unwrap();

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
            client
        });

        let session = handler.setup_server_stream(server).await.unwrap();
        assert_eq!(session.target.to_string(), "example.com:443");
        assert_eq!(session.target.protocol, Protocol::Tcp);
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_ipv4_with_port_boundaries() {
        for port in [0u16, 65535] {
            let (mut client, server) = accepted_pair().await;
            let handler = SocksServer::new();

            let client_task = tokio::spawn(async move {
                client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
                let mut buf = [0u8; 2];
                client.read_exact(&mut buf).await.unwrap();

                let mut request = vec![0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3];
                request.extend_from_slice(&port.to_be_bytes());
                client.write_all(&request).await.unwrap();

                let mut reply = [0u8; 10];
                client.read_exact(&mut reply).await.unwrap();
                client
            });

            let session = handler.setup_server_stream(server).await.unwrap();
            assert_eq!(session.target.location.port(), port);
            assert_eq!(session.target.host(), "10.1.2.3");
            client_task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_udp_associate_announces_bound_socket() {
        let (mut client, server) = accepted_pair().await;
        let handler = SocksServer::new();

        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).await.unwrap();

            let mut request = vec![0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0];
            request.extend_from_slice(&0u16.to_be_bytes());
            client.write_all(&request).await.unwrap();

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
            let port = u16::from_be_bytes([reply[8], reply[9]]);
            assert_ne!(port, 0);
            (client, port)
        });

        let session = handler.setup_server_stream(server).await.unwrap();
        assert_eq!(session.target.protocol, Protocol::Udp);
        let relay = session.target.udp_relay.as_ref().unwrap();
        let (_client, announced_port) = client_task.await.unwrap();
        assert_eq!(relay.bound_addr.port(), announced_port);
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (mut client, server) = accepted_pair().await;
        let handler = SocksServer::new();

        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).await.unwrap();
            // BIND is not supported.
            client
                .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
                .await
                .unwrap();
            client
        });

        assert!(handler.setup_server_stream(server).await.is_err());
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_fallthrough_on_same_port() {
        let (mut client, server) = accepted_pair().await;
        let handler = SocksServer::new();

        let client_task = tokio::spawn(async move {
            client
                .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .await
                .unwrap();
            client
        });

        let session = handler.setup_server_stream(server).await.unwrap();
        assert_eq!(session.target.to_string(), "example.com:443");
        client_task.await.unwrap();
    }
}
