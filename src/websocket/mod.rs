mod websocket_stream;

pub use websocket_stream::WebsocketStream;

use aws_lc_rs::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt;

use crate::async_stream::AsyncStream;
use crate::line_reader::LineReader;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn create_accept_key(key: &str) -> String {
    let hash = digest(
        &SHA1_FOR_LEGACY_USE_ONLY,
        format!("{}{}", key, WEBSOCKET_GUID).as_bytes(),
    );
    BASE64.encode(hash.as_ref())
}

/// The parsed upgrade request, plus any bytes the client sent after it.
pub struct ServerUpgrade {
    pub leftover: Vec<u8>,
}

/// Reads a WebSocket upgrade request at path `/` and answers 101. Any other
/// request is an error so the caller can fall back to the decoy page.
pub async fn server_upgrade(
    stream: &mut Box<dyn AsyncStream>,
) -> std::io::Result<ServerUpgrade> {
    let mut reader = LineReader::new();

    let request_line = reader.read_line(stream).await?.to_string();
    if !request_line.ends_with(" HTTP/1.1") && !request_line.ends_with(" HTTP/1.0") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not an http request: {}", request_line),
        ));
    }
    if !request_line.starts_with("GET / ") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unexpected upgrade request: {}", request_line),
        ));
    }

    let mut headers: FxHashMap<String, String> = FxHashMap::default();
    loop {
        let line = reader.read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        if let Some(i) = line.find(':') {
            headers.insert(
                line[..i].trim().to_ascii_lowercase(),
                line[i + 1..].trim().to_string(),
            );
        }
    }

    let key = headers.get("sec-websocket-key").ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "missing Sec-WebSocket-Key header",
        )
    })?;

    let is_upgrade = headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_upgrade {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "missing websocket upgrade header",
        ));
    }

    let response = format!(
        concat!(
            "HTTP/1.1 101 Switching Protocols\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            "Sec-WebSocket-Accept: {}\r\n",
            "\r\n"
        ),
        create_accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(ServerUpgrade {
        leftover: reader.unparsed_data().to_vec(),
    })
}

/// Performs the client side of the upgrade against `host` at path `/`.
/// Returns bytes received after the 101 response, to seed the frame reader.
pub async fn client_upgrade(
    stream: &mut Box<dyn AsyncStream>,
    host: &str,
) -> std::io::Result<Vec<u8>> {
    let mut key_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let key = BASE64.encode(key_bytes);

    let request = format!(
        concat!(
            "GET / HTTP/1.1\r\n",
            "Host: {}\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            "Sec-WebSocket-Key: {}\r\n",
            "Sec-WebSocket-Version: 13\r\n",
            "\r\n"
        ),
        host, key
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = LineReader::new();
    let status_line = reader.read_line(stream).await?;
    if !status_line.starts_with("HTTP/1.1 101") && !status_line.starts_with("HTTP/1.0 101") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("websocket upgrade refused: {}", status_line),
        ));
    }

    let expected_accept = create_accept_key(&key);
    let mut accept_ok = false;
    loop {
        let line = reader.read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        if let Some(value) = line
            .strip_prefix("Sec-WebSocket-Accept:")
            .or_else(|| line.strip_prefix("sec-websocket-accept:"))
        {
            accept_ok = value.trim() == expected_accept;
        }
    }

    if !accept_ok {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "websocket accept key mismatch",
        ));
    }

    Ok(reader.unparsed_data().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_accept_key_rfc_example() {
        // RFC 6455 section 1.3.
        assert_eq!(
            create_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pAPLC1BTxaARnWEX+so74ZcSM="
        );
    }

    #[tokio::test]
    async fn test_upgrade_round_trip() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let mut client: Box<dyn AsyncStream> = Box::new(client_side);
        let mut server: Box<dyn AsyncStream> = Box::new(server_side);

        let server_task = tokio::spawn(async move {
            let upgrade = server_upgrade(&mut server).await.unwrap();
            assert!(upgrade.leftover.is_empty());
            server
        });

        let leftover = client_upgrade(&mut client, "peer.example.com:443")
            .await
            .unwrap();
        assert!(leftover.is_empty());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_upgrade_request_rejected() {
        let (mut client_side, server_side) = tokio::io::duplex(8192);
        let mut server: Box<dyn AsyncStream> = Box::new(server_side);

        client_side
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        assert!(server_upgrade(&mut server).await.is_err());
        let mut buf = [0u8; 1];
        // The server wrote nothing; the caller is responsible for the decoy.
        drop(server);
        assert_eq!(client_side.read(&mut buf).await.unwrap(), 0);
    }
}
