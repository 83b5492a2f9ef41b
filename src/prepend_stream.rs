use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::async_stream::AsyncStream;

/// A stream with already-read bytes pushed back in front of it, so protocol
/// sniffing can peek without losing data for the next layer.
pub struct PrependStream {
    stream: Box<dyn AsyncStream>,
    prefix: Vec<u8>,
    prefix_offset: usize,
}

impl PrependStream {
    pub fn new(prefix: &[u8], stream: Box<dyn AsyncStream>) -> Self {
        Self {
            stream,
            prefix: prefix.to_vec(),
            prefix_offset: 0,
        }
    }
}

impl AsyncRead for PrependStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.prefix_offset < this.prefix.len() {
            let remaining = &this.prefix[this.prefix_offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.prefix_offset += n;
            if this.prefix_offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.prefix_offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrependStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl AsyncStream for PrependStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_read_before_stream() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b" world").await.unwrap();

        let mut stream = PrependStream::new(b"hello", Box::new(rx));
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }
}
