use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::address::{Protocol, Target, MAX_HOSTNAME_LEN};
use crate::async_stream::AsyncStream;
use crate::util::current_time_secs;

/// Permitted clock drift between the two ends of a tunnel, in seconds.
pub const MAX_CLOCK_SKEW_SECS: u64 = 10;

/// Writes the session prelude a tunneled client sends inside the cipher
/// stream: big-endian unix seconds, protocol tag, address length, and the
/// host:port string. The address length check runs before anything is
/// written, so an oversized target never puts partial data on the wire.
pub async fn write_prelude<S: AsyncStream + ?Sized>(
    stream: &mut S,
    target: &Target,
) -> std::io::Result<()> {
    let addr = target.to_string();
    if addr.len() > MAX_HOSTNAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("target address is longer than {} bytes", MAX_HOSTNAME_LEN),
        ));
    }

    stream.write_all(&current_time_secs().to_be_bytes()).await?;
    stream
        .write_all(&target.protocol.to_u16().to_be_bytes())
        .await?;
    stream.write_all(&(addr.len() as u16).to_be_bytes()).await?;
    stream.write_all(addr.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads and validates a prelude on the server side. The timestamp must be
/// within [`MAX_CLOCK_SKEW_SECS`] of the local clock in either direction.
pub async fn read_prelude<S: AsyncStream + ?Sized>(stream: &mut S) -> std::io::Result<Target> {
    let mut ts_buf = [0u8; 8];
    stream.read_exact(&mut ts_buf).await?;
    let ts = u64::from_be_bytes(ts_buf);

    let now = current_time_secs();
    if now.abs_diff(ts) > MAX_CLOCK_SKEW_SECS {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("clock skew too large: peer {} local {}", ts, now),
        ));
    }

    let mut proto_buf = [0u8; 2];
    stream.read_exact(&mut proto_buf).await?;
    let protocol = Protocol::from_u16(u16::from_be_bytes(proto_buf))?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_HOSTNAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("prelude address length {} too large", len),
        ));
    }

    let mut addr_buf = vec![0u8; len];
    stream.read_exact(&mut addr_buf).await?;
    let addr = std::str::from_utf8(&addr_buf).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("prelude address is not utf8: {}", e),
        )
    })?;

    let mut target = Target::from_host_port(addr)?;
    target.protocol = protocol;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetLocation;

    #[tokio::test]
    async fn test_prelude_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let target = Target::from_host_port("www.example.com:443").unwrap();
        write_prelude(&mut client, &target).await.unwrap();

        let parsed = read_prelude(&mut server).await.unwrap();
        assert_eq!(parsed.protocol, Protocol::Tcp);
        assert_eq!(parsed.to_string(), "www.example.com:443");
    }

    #[tokio::test]
    async fn test_udp_protocol_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut target = Target::from_host_port("8.8.8.8:53").unwrap();
        target.protocol = Protocol::Udp;
        write_prelude(&mut client, &target).await.unwrap();

        let parsed = read_prelude(&mut server).await.unwrap();
        assert_eq!(parsed.protocol, Protocol::Udp);
        assert_eq!(parsed.to_string(), "8.8.8.8:53");
    }

    #[tokio::test]
    async fn test_oversized_address_rejected_before_write() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let name = "a".repeat(250);
        let target = Target::new(
            NetLocation::new(crate::address::Address::Hostname(name), 443),
            Protocol::Tcp,
        );
        // 250 + ":443" = 254 bytes.
        assert!(write_prelude(&mut client, &target).await.is_err());

        // Nothing reached the wire.
        drop(client);
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut buf)
            .await
            .unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_clock_skew_boundaries() {
        for (offset, ok) in [(0i64, true), (10, true), (-10, true), (11, false), (-11, false)] {
            let (mut client, mut server) = tokio::io::duplex(4096);

            let ts = (current_time_secs() as i64 + offset) as u64;
            let addr = b"example.com:443";
            tokio::io::AsyncWriteExt::write_all(&mut client, &ts.to_be_bytes())
                .await
                .unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut client, &1u16.to_be_bytes())
                .await
                .unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut client, &(addr.len() as u16).to_be_bytes())
                .await
                .unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut client, addr)
                .await
                .unwrap();

            let result = read_prelude(&mut server).await;
            assert_eq!(result.is_ok(), ok, "offset {} expected ok={}", offset, ok);
        }
    }

    #[tokio::test]
    async fn test_bad_protocol_tag_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::io::AsyncWriteExt::write_all(&mut client, &current_time_secs().to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &2u16.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &4u16.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"a:80")
            .await
            .unwrap();

        assert!(read_prelude(&mut server).await.is_err());
    }
}
