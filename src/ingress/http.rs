use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::address::{NetLocation, Protocol, Target};
use crate::async_stream::AsyncStream;
use crate::line_reader::LineReader;

use super::{IngressHandler, IngressSession, HANDSHAKE_READ_TIMEOUT};

/// Dedicated HTTP proxy ingress.
pub struct HttpServer;

impl HttpServer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IngressHandler for HttpServer {
    async fn setup_server_stream(&self, stream: TcpStream) -> std::io::Result<IngressSession> {
        let stream: Box<dyn AsyncStream> = Box::new(stream);
        match timeout(
            HANDSHAKE_READ_TIMEOUT,
            setup_http_session(stream, LineReader::new()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "http handshake timed out",
            )),
        }
    }

    fn name(&self) -> &'static str {
        "HttpServer"
    }
}

const PROXY_CONNECTION_HEADER_PREFIX: &str = "proxy-connection:";
const CONNECTION_HEADER_PREFIX: &str = "connection:";

/// HTTP proxy handshake, shared between the dedicated HTTP ingress and the
/// SOCKS5 fallthrough on the same port.
///
/// CONNECT requests yield a raw tunnel after a `200 Connection Established`
/// reply. Requests with an absolute `http://` URL are rewritten to
/// origin-form and prepended to the egress stream; `Connection: close` is
/// forced so the response end is unambiguous.
pub async fn setup_http_session(
    mut stream: Box<dyn AsyncStream>,
    mut reader: LineReader,
) -> std::io::Result<IngressSession> {
    let line = reader.read_line(&mut stream).await?.to_string();
    if !line.ends_with(" HTTP/1.0") && !line.ends_with(" HTTP/1.1") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unrecognized http request: {}", line),
        ));
    }

    // Shortest sensible request: "GET http://a.ab/ HTTP/1.1"-style, with
    // method, one-character-ish host, and version.
    if line.len() < 19 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid http request: {}", line),
        ));
    }

    let http_version = line[line.len() - 8..].to_string();

    if let Some(rest) = line.strip_prefix("CONNECT ") {
        let address = &rest[..rest.len() - 9];
        let location = NetLocation::from_str(address, Some(443))?;

        // Consume the rest of the request headers.
        loop {
            let header = reader.read_line(&mut stream).await?;
            if header.is_empty() {
                break;
            }
            debug!("ignored CONNECT header: {}", header);
        }

        stream
            .write_all(
                format!("{} 200 Connection Established\r\n\r\n", http_version).as_bytes(),
            )
            .await?;
        stream.flush().await?;

        let leftover = reader.unparsed_data();
        let initial_remote_data = if leftover.is_empty() {
            None
        } else {
            Some(leftover.to_vec().into_boxed_slice())
        };

        return Ok(IngressSession {
            stream,
            target: Target::new(location, Protocol::Tcp),
            initial_remote_data,
        });
    }

    // A normal request carrying the full URL:
    //   GET http://example.org/path HTTP/1.1
    let line_no_version = &line[..line.len() - 9];
    let space_index = line_no_version.find(' ').ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unrecognized http request: {}", line),
        )
    })?;

    let method = &line_no_version[..space_index];
    let url = &line_no_version[space_index + 1..];

    let url = url.strip_prefix("http://").ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported forward url: {}", url),
        )
    })?;

    let (address, path) = match url.find('/') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, "/"),
    };
    let location = NetLocation::from_str(address, Some(80))?;

    let mut request = format!("{} {} {}\r\n", method, path, http_version);

    loop {
        let header = reader.read_line(&mut stream).await?;
        if header.is_empty() {
            break;
        }

        let lowercase = header.to_ascii_lowercase();
        // Hop-by-hop headers are dropped: keeping them would force us to
        // parse the origin's response framing to find the request boundary.
        if lowercase.starts_with(PROXY_CONNECTION_HEADER_PREFIX)
            || lowercase.starts_with(CONNECTION_HEADER_PREFIX)
        {
            continue;
        }

        request.push_str(header);
        request.push_str("\r\n");

        if request.len() > 16384 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "http request too long",
            ));
        }
    }
    request.push_str("Connection: close\r\n\r\n");

    let mut initial_remote_data = request.into_bytes();
    initial_remote_data.extend_from_slice(reader.unparsed_data());

    Ok(IngressSession {
        stream,
        target: Target::new(location, Protocol::Tcp),
        initial_remote_data: Some(initial_remote_data.into_boxed_slice()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    async fn session_for(request: &str) -> std::io::Result<IngressSession> {
        let (mut tx, rx) = tokio::io::duplex(8192);
        tx.write_all(request.as_bytes()).await.unwrap();
        setup_http_session(Box::new(rx), LineReader::new()).await
    }

    #[tokio::test]
    async fn test_connect_request() {
        let session = session_for("CONNECT example.com:8443 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(session.target.to_string(), "example.com:8443");
        assert!(session.initial_remote_data.is_none());
    }

    #[tokio::test]
    async fn test_connect_default_port() {
        let session = session_for("CONNECT example.com HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(session.target.location.port(), 443);
    }

    #[tokio::test]
    async fn test_absolute_url_rewritten_to_origin_form() {
        let session = session_for(
            "GET http://example.org/info HTTP/1.1\r\nHost: example.org\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await
        .unwrap();

        assert_eq!(session.target.to_string(), "example.org:80");
        let data = session.initial_remote_data.unwrap();
        let text = std::str::from_utf8(&data).unwrap();
        assert!(text.starts_with("GET /info HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org\r\n"));
        assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_https_url_rejected() {
        assert!(session_for("GET https://example.org/ HTTP/1.1\r\n\r\n")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        assert!(session_for("NONSENSE\r\n\r\n").await.is_err());
    }
}
