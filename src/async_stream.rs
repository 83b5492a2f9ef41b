use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte transport. Everything that flows through the proxy -
/// plain TCP, TLS, WebSocket frames, the cipher wrapper, connected UDP -
/// is handled through this trait so handshakes and forwarding loops can be
/// written once.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl AsyncStream for TcpStream {}

impl AsyncStream for tokio_rustls::client::TlsStream<TcpStream> {}
impl AsyncStream for tokio_rustls::server::TlsStream<TcpStream> {}

impl AsyncStream for tokio::io::DuplexStream {}

impl AsyncStream for Box<dyn AsyncStream> {}
