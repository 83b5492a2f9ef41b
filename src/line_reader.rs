use memchr::memchr;
use tokio::io::AsyncReadExt;

use crate::util::allocate_vec;

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Buffered reader for handshake phases: CRLF header lines, fixed-size
/// fields, and a single-byte peek for protocol detection.
///
/// The buffer holds one contiguous window of the stream. `pos` marks the
/// consumed prefix, `filled` the end of valid data, and `searched` how far
/// the newline scan has already looked, so a long line split across reads
/// is never re-scanned from the start. Consumed bytes are reclaimed by
/// compacting just before the next refill. Bytes read past the handshake
/// stay available through `unparsed_data`, so nothing is lost when the
/// connection switches protocols.
pub struct LineReader {
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    searched: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self::new_with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// The buffer size caps both the longest line and the largest
    /// `read_slice` request.
    pub fn new_with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buf: allocate_vec(buffer_size).into_boxed_slice(),
            pos: 0,
            filled: 0,
            searched: 0,
        }
    }

    /// Reads one CRLF-terminated line, without the terminator. A bare LF is
    /// rejected; header parsing has no business accepting it.
    pub async fn read_line<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<&str> {
        loop {
            if let Some(found) = memchr(b'\n', &self.buf[self.searched..self.filled]) {
                let newline = self.searched + found;
                if newline == self.pos || self.buf[newline - 1] != b'\r' {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "header line missing CR before LF",
                    ));
                }
                let start = self.pos;
                self.pos = newline + 1;
                self.searched = self.pos;
                return std::str::from_utf8(&self.buf[start..newline - 1]).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("header line is not utf8: {}", e),
                    )
                });
            }

            // Everything buffered so far has been scanned; remember that
            // before pulling more.
            self.searched = self.filled;
            self.fill_more(stream).await?;
        }
    }

    /// Returns the next byte without consuming it.
    pub async fn peek_u8<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<u8> {
        self.ensure(stream, 1).await?;
        Ok(self.buf[self.pos])
    }

    pub async fn read_u8<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<u8> {
        let value = self.peek_u8(stream).await?;
        self.advance(1);
        Ok(value)
    }

    pub async fn read_u16_be<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<u16> {
        self.ensure(stream, 2).await?;
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.advance(2);
        Ok(value)
    }

    pub async fn read_slice<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
        len: usize,
    ) -> std::io::Result<&[u8]> {
        if len > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} bytes requested, buffer holds {}", len, self.buf.len()),
            ));
        }
        self.ensure(stream, len).await?;
        let start = self.pos;
        self.advance(len);
        Ok(&self.buf[start..start + len])
    }

    /// Bytes buffered beyond what the handshake consumed.
    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }

    fn advance(&mut self, len: usize) {
        self.pos += len;
        if self.searched < self.pos {
            self.searched = self.pos;
        }
    }

    async fn ensure<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
        len: usize,
    ) -> std::io::Result<()> {
        while self.filled - self.pos < len {
            self.fill_more(stream).await?;
        }
        Ok(())
    }

    async fn fill_more<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<()> {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.searched -= self.pos;
            self.pos = 0;
        }

        if self.filled == self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "handshake data exceeds buffer capacity",
            ));
        }

        loop {
            match stream.read(&mut self.buf[self.filled..]).await {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream closed during handshake",
                    ));
                }
                Ok(n) => {
                    self.filled += n;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_lines_and_peek() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nrest")
            .await
            .unwrap();

        let mut reader = LineReader::new();
        assert_eq!(reader.peek_u8(&mut rx).await.unwrap(), b'G');
        assert_eq!(reader.read_line(&mut rx).await.unwrap(), "GET / HTTP/1.1");
        assert_eq!(reader.read_line(&mut rx).await.unwrap(), "Host: a");
        assert_eq!(reader.read_line(&mut rx).await.unwrap(), "");
        assert_eq!(reader.unparsed_data(), b"rest");
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let reader_task = tokio::spawn(async move {
            let mut reader = LineReader::new_with_buffer_size(64);
            let line = reader.read_line(&mut rx).await.unwrap().to_string();
            line
        });

        tx.write_all(b"CONNECT example.co").await.unwrap();
        tx.flush().await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(b"m:443 HTTP/1.1\r\n").await.unwrap();

        assert_eq!(
            reader_task.await.unwrap(),
            "CONNECT example.com:443 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_bare_lf_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(b"broken line\n").await.unwrap();

        let mut reader = LineReader::new();
        assert!(reader.read_line(&mut rx).await.is_err());
    }

    #[tokio::test]
    async fn test_read_u16_and_slice() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&[0x01, 0x02, b'a', b'b', b'c']).await.unwrap();

        let mut reader = LineReader::new();
        assert_eq!(reader.read_u16_be(&mut rx).await.unwrap(), 0x0102);
        assert_eq!(reader.read_slice(&mut rx, 3).await.unwrap(), b"abc");
        assert!(reader.unparsed_data().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_line_fails() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&[b'x'; 64]).await.unwrap();

        let mut reader = LineReader::new_with_buffer_size(32);
        assert!(reader.read_line(&mut rx).await.is_err());
    }
}
