use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use log::debug;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::async_stream::AsyncStream;
use crate::util::allocate_vec;

const MAX_CONTROL_PAYLOAD: usize = 125;
const READ_BUF_SIZE: usize = 16384;
const WRITE_FRAME_SIZE: usize = 32768;
// Frame overhead: 2 header bytes + up to 8 length bytes + 4 mask bytes.
const MAX_FRAME_OVERHEAD: usize = 14;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Unknown(u8),
}

impl OpCode {
    fn from(code: u8) -> Self {
        match code {
            0 => OpCode::Continue,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => OpCode::Unknown(code),
        }
    }
}

#[derive(Debug, PartialEq)]
enum ReadState {
    Header,
    ExtendedLength { length_bytes_len: usize },
    Mask,
    Content,
    ControlContent,
    Eof,
}

/// Minimal RFC 6455 framed stream carrying the tunnel's byte stream in
/// binary frames. Client-to-server frames are masked as the RFC requires;
/// pings are answered with pongs inline; a close frame reads as EOF.
/// Text and continuation frames are treated as payload bytes, which is all
/// the tunnel peer ever sends.
pub struct WebsocketStream {
    stream: Box<dyn AsyncStream>,
    is_client: bool,

    read_state: ReadState,
    frame_opcode: OpCode,
    frame_masked: bool,
    frame_remaining: u64,
    frame_mask: [u8; 4],
    frame_mask_offset: usize,
    control_payload: [u8; MAX_CONTROL_PAYLOAD],
    control_payload_len: usize,

    unprocessed_buf: Box<[u8]>,
    unprocessed_start_offset: usize,
    unprocessed_end_offset: usize,

    write_frame: Box<[u8]>,
    write_frame_start_offset: usize,
    write_frame_end_offset: usize,
    pending_pong: Option<usize>,
}

impl WebsocketStream {
    pub fn new(stream: Box<dyn AsyncStream>, is_client: bool, initial_data: &[u8]) -> Self {
        let mut unprocessed_buf = allocate_vec(READ_BUF_SIZE).into_boxed_slice();
        let mut unprocessed_end_offset = 0;
        if !initial_data.is_empty() {
            unprocessed_buf[0..initial_data.len()].copy_from_slice(initial_data);
            unprocessed_end_offset = initial_data.len();
        }

        Self {
            stream,
            is_client,
            read_state: ReadState::Header,
            frame_opcode: OpCode::Unknown(0xff),
            frame_masked: false,
            frame_remaining: 0,
            frame_mask: [0u8; 4],
            frame_mask_offset: 0,
            control_payload: [0u8; MAX_CONTROL_PAYLOAD],
            control_payload_len: 0,
            unprocessed_buf,
            unprocessed_start_offset: 0,
            unprocessed_end_offset,
            write_frame: allocate_vec(WRITE_FRAME_SIZE).into_boxed_slice(),
            write_frame_start_offset: 0,
            write_frame_end_offset: 0,
            pending_pong: None,
        }
    }

    fn unprocessed_len(&self) -> usize {
        self.unprocessed_end_offset - self.unprocessed_start_offset
    }

    fn consume_unprocessed(&mut self, len: usize) {
        self.unprocessed_start_offset += len;
        if self.unprocessed_start_offset == self.unprocessed_end_offset {
            self.unprocessed_start_offset = 0;
            self.unprocessed_end_offset = 0;
        }
    }

    fn fill_unprocessed(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
        if self.unprocessed_start_offset > 0 {
            self.unprocessed_buf
                .copy_within(self.unprocessed_start_offset..self.unprocessed_end_offset, 0);
            self.unprocessed_end_offset -= self.unprocessed_start_offset;
            self.unprocessed_start_offset = 0;
        }
        let mut read_buf = ReadBuf::new(&mut self.unprocessed_buf[self.unprocessed_end_offset..]);
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        self.unprocessed_end_offset += n;
        Poll::Ready(Ok(n))
    }

    /// Advances the frame state machine as far as buffered bytes allow.
    /// Returns the number of payload bytes placed into `buf`.
    fn process_frames(&mut self, buf: &mut ReadBuf<'_>) -> std::io::Result<usize> {
        let mut written = 0usize;

        loop {
            match self.read_state {
                ReadState::Header => {
                    if self.unprocessed_len() < 2 {
                        return Ok(written);
                    }
                    let first = self.unprocessed_buf[self.unprocessed_start_offset];
                    let second = self.unprocessed_buf[self.unprocessed_start_offset + 1];
                    self.consume_unprocessed(2);

                    self.frame_opcode = OpCode::from(first & 0x0f);
                    self.frame_masked = second & 0x80 != 0;
                    self.frame_mask_offset = 0;
                    self.control_payload_len = 0;

                    if let OpCode::Unknown(code) = self.frame_opcode {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("unknown websocket opcode: {}", code),
                        ));
                    }

                    let length = (second & 0x7f) as u64;
                    if length == 126 {
                        self.read_state = ReadState::ExtendedLength { length_bytes_len: 2 };
                    } else if length == 127 {
                        self.read_state = ReadState::ExtendedLength { length_bytes_len: 8 };
                    } else {
                        self.frame_remaining = length;
                        self.read_state = if self.frame_masked {
                            ReadState::Mask
                        } else {
                            self.content_state()?
                        };
                    }
                }
                ReadState::ExtendedLength { length_bytes_len } => {
                    if self.unprocessed_len() < length_bytes_len {
                        return Ok(written);
                    }
                    let mut length = 0u64;
                    for i in 0..length_bytes_len {
                        length = (length << 8)
                            | (self.unprocessed_buf[self.unprocessed_start_offset + i] as u64);
                    }
                    self.consume_unprocessed(length_bytes_len);
                    self.frame_remaining = length;
                    self.read_state = if self.frame_masked {
                        ReadState::Mask
                    } else {
                        self.content_state()?
                    };
                }
                ReadState::Mask => {
                    if self.unprocessed_len() < 4 {
                        return Ok(written);
                    }
                    for i in 0..4 {
                        self.frame_mask[i] =
                            self.unprocessed_buf[self.unprocessed_start_offset + i];
                    }
                    self.consume_unprocessed(4);
                    self.read_state = self.content_state()?;
                }
                ReadState::Content => {
                    if self.frame_remaining == 0 {
                        self.read_state = ReadState::Header;
                        continue;
                    }
                    if buf.remaining() == 0 {
                        return Ok(written);
                    }
                    let available = self.unprocessed_len();
                    if available == 0 {
                        return Ok(written);
                    }
                    let n = (self.frame_remaining as usize)
                        .min(available)
                        .min(buf.remaining());

                    let start = self.unprocessed_start_offset;
                    if self.frame_masked {
                        for i in 0..n {
                            self.unprocessed_buf[start + i] ^=
                                self.frame_mask[(self.frame_mask_offset + i) % 4];
                        }
                        self.frame_mask_offset = (self.frame_mask_offset + n) % 4;
                    }
                    buf.put_slice(&self.unprocessed_buf[start..start + n]);
                    self.consume_unprocessed(n);
                    self.frame_remaining -= n as u64;
                    written += n;
                    if self.frame_remaining == 0 {
                        self.read_state = ReadState::Header;
                    }
                }
                ReadState::ControlContent => {
                    if self.frame_remaining > 0 {
                        let available = self.unprocessed_len();
                        if available == 0 {
                            return Ok(written);
                        }
                        let n = (self.frame_remaining as usize).min(available);
                        let start = self.unprocessed_start_offset;
                        for i in 0..n {
                            let mut byte = self.unprocessed_buf[start + i];
                            if self.frame_masked {
                                byte ^= self.frame_mask[(self.frame_mask_offset + i) % 4];
                            }
                            self.control_payload[self.control_payload_len + i] = byte;
                        }
                        if self.frame_masked {
                            self.frame_mask_offset = (self.frame_mask_offset + n) % 4;
                        }
                        self.control_payload_len += n;
                        self.consume_unprocessed(n);
                        self.frame_remaining -= n as u64;
                        if self.frame_remaining > 0 {
                            return Ok(written);
                        }
                    }

                    match self.frame_opcode {
                        OpCode::Ping => {
                            debug!("Answering websocket ping ({} bytes)", self.control_payload_len);
                            self.pending_pong = Some(self.control_payload_len);
                        }
                        OpCode::Pong => (),
                        OpCode::Close => {
                            self.read_state = ReadState::Eof;
                            return Ok(written);
                        }
                        _ => unreachable!(),
                    }
                    self.read_state = ReadState::Header;
                }
                ReadState::Eof => {
                    return Ok(written);
                }
            }
        }
    }

    fn content_state(&mut self) -> std::io::Result<ReadState> {
        match self.frame_opcode {
            OpCode::Binary | OpCode::Text | OpCode::Continue => Ok(ReadState::Content),
            OpCode::Ping | OpCode::Pong | OpCode::Close => {
                if self.frame_remaining as usize > MAX_CONTROL_PAYLOAD {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("control frame payload too large: {}", self.frame_remaining),
                    ));
                }
                Ok(ReadState::ControlContent)
            }
            OpCode::Unknown(_) => unreachable!(),
        }
    }

    /// Frames `payload` with the given opcode into the write buffer.
    /// Returns false when the buffer lacks space.
    fn enqueue_frame(&mut self, opcode: u8, payload_len: usize, fill: impl FnOnce(&mut [u8])) -> bool {
        let space = self.write_frame.len() - self.write_frame_end_offset;
        if space < payload_len + MAX_FRAME_OVERHEAD {
            return false;
        }

        let mut offset = self.write_frame_end_offset;
        self.write_frame[offset] = 0x80 | opcode;
        offset += 1;

        let mask_bit = if self.is_client { 0x80u8 } else { 0 };
        if payload_len <= 125 {
            self.write_frame[offset] = mask_bit | payload_len as u8;
            offset += 1;
        } else if payload_len <= 0xffff {
            self.write_frame[offset] = mask_bit | 126;
            offset += 1;
            self.write_frame[offset..offset + 2]
                .copy_from_slice(&(payload_len as u16).to_be_bytes());
            offset += 2;
        } else {
            self.write_frame[offset] = mask_bit | 127;
            offset += 1;
            self.write_frame[offset..offset + 8]
                .copy_from_slice(&(payload_len as u64).to_be_bytes());
            offset += 8;
        }

        let mut mask = [0u8; 4];
        if self.is_client {
            rand::thread_rng().fill_bytes(&mut mask);
            self.write_frame[offset..offset + 4].copy_from_slice(&mask);
            offset += 4;
        }

        fill(&mut self.write_frame[offset..offset + payload_len]);
        if self.is_client {
            for i in 0..payload_len {
                self.write_frame[offset + i] ^= mask[i % 4];
            }
        }

        self.write_frame_end_offset = offset + payload_len;
        true
    }

    /// Returns true once the write buffer has fully drained.
    fn do_write_frame(&mut self, cx: &mut Context<'_>) -> std::io::Result<bool> {
        while self.write_frame_start_offset < self.write_frame_end_offset {
            match Pin::new(&mut self.stream).poll_write(
                cx,
                &self.write_frame[self.write_frame_start_offset..self.write_frame_end_offset],
            ) {
                Poll::Ready(Ok(written)) => {
                    if written == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "EOF while writing websocket frame",
                        ));
                    }
                    self.write_frame_start_offset += written;
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => return Ok(false),
            }
        }
        self.write_frame_start_offset = 0;
        self.write_frame_end_offset = 0;
        Ok(true)
    }

    fn flush_pending_pong(&mut self, cx: &mut Context<'_>) -> std::io::Result<()> {
        if let Some(len) = self.pending_pong {
            let payload = self.control_payload;
            if self.enqueue_frame(0x0a, len, |out| out.copy_from_slice(&payload[..len])) {
                self.pending_pong = None;
                let _ = self.do_write_frame(cx)?;
            }
        }
        Ok(())
    }
}

impl AsyncRead for WebsocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            let written = this.process_frames(buf)?;
            this.flush_pending_pong(cx)?;

            if written > 0 || this.read_state == ReadState::Eof {
                return Poll::Ready(Ok(()));
            }

            let n = ready!(this.fill_unprocessed(cx))?;
            if n == 0 {
                // Inner EOF. Surface whatever state we're in as stream end.
                this.read_state = ReadState::Eof;
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl AsyncWrite for WebsocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.write_frame_end_offset > 0 && !this.do_write_frame(cx)? {
            let space = this.write_frame.len() - this.write_frame_end_offset;
            if space < MAX_FRAME_OVERHEAD + 1 {
                return Poll::Pending;
            }
        }

        let space = this.write_frame.len() - this.write_frame_end_offset;
        let payload_len = buf.len().min(space.saturating_sub(MAX_FRAME_OVERHEAD));
        if payload_len == 0 {
            return Poll::Pending;
        }

        if !this.enqueue_frame(0x02, payload_len, |out| {
            out.copy_from_slice(&buf[..payload_len])
        }) {
            return Poll::Pending;
        }

        let _ = this.do_write_frame(cx)?;
        Poll::Ready(Ok(payload_len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        while this.write_frame_end_offset > 0 {
            if !this.do_write_frame(cx)? {
                return Poll::Pending;
            }
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        while this.write_frame_end_offset > 0 {
            if !this.do_write_frame(cx)? {
                return Poll::Pending;
            }
        }
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl AsyncStream for WebsocketStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (WebsocketStream, WebsocketStream) {
        let (a, b) = tokio::io::duplex(65536);
        (
            WebsocketStream::new(Box::new(a), true, &[]),
            WebsocketStream::new(Box::new(b), false, &[]),
        )
    }

    #[tokio::test]
    async fn test_client_to_server_masked_round_trip() {
        let (mut client, mut server) = pair();

        client.write_all(b"tunnel payload").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 14];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel payload");
    }

    #[tokio::test]
    async fn test_server_to_client_round_trip() {
        let (mut client, mut server) = pair();

        server.write_all(b"reply").await.unwrap();
        server.flush().await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_payload_split_across_reads() {
        let (mut client, mut server) = pair();

        let payload: Vec<u8> = (0..600).map(|i| (i % 256) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();

        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (a, b) = tokio::io::duplex(65536);
        let mut raw = a;
        let mut server = WebsocketStream::new(Box::new(b), false, &[]);

        // Unmasked ping with payload "hi" followed by a data frame.
        raw.write_all(&[0x89, 0x02, b'h', b'i']).await.unwrap();
        raw.write_all(&[0x82, 0x03, b'x', b'y', b'z']).await.unwrap();

        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xyz");

        // The pong comes back unmasked from the server side: 0x8a len=2 "hi".
        let mut pong = [0u8; 4];
        raw.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8a, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_close_frame_reads_as_eof() {
        let (a, b) = tokio::io::duplex(65536);
        let mut raw = a;
        let mut server = WebsocketStream::new(Box::new(b), false, &[]);

        raw.write_all(&[0x88, 0x00]).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_initial_data_consumed_first() {
        let (a, b) = tokio::io::duplex(65536);
        drop(a);
        // Frame bytes that arrived together with the upgrade response.
        let initial = [0x82u8, 0x02, b'o', b'k'];
        let mut client = WebsocketStream::new(Box::new(b), true, &initial);

        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
