use std::pin::Pin;
use std::task::{Context, Poll};

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use futures::ready;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::async_stream::AsyncStream;
use crate::util::allocate_vec;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

const WRITE_CACHE_SIZE: usize = 16384 + NONCE_LEN;

/// Unauthenticated XChaCha20 keystream over a byte transport.
///
/// Each direction lazily sets up its keystream: the first write generates a
/// random 24-byte nonce and emits it in the clear before any ciphertext, and
/// the first read consumes 24 nonce bytes before yielding any plaintext.
/// There is no framing and no authentication - an on-path attacker can flip
/// bits or truncate without detection. The wire format is fixed by the peer,
/// so no MAC is added here.
pub struct CipherStream {
    stream: Box<dyn AsyncStream>,
    key: [u8; KEY_LEN],

    encoder: Option<XChaCha20>,
    decoder: Option<XChaCha20>,

    read_nonce: [u8; NONCE_LEN],
    read_nonce_len: usize,

    write_cache: Box<[u8]>,
    write_cache_start_offset: usize,
    write_cache_end_offset: usize,
}

impl CipherStream {
    pub fn new(key: &[u8; KEY_LEN], stream: Box<dyn AsyncStream>) -> Self {
        Self {
            stream,
            key: *key,
            encoder: None,
            decoder: None,
            read_nonce: [0u8; NONCE_LEN],
            read_nonce_len: 0,
            write_cache: allocate_vec(WRITE_CACHE_SIZE).into_boxed_slice(),
            write_cache_start_offset: 0,
            write_cache_end_offset: 0,
        }
    }

    /// Recovers the underlying transport, e.g. to answer a failed handshake
    /// in plaintext. Any buffered unsent ciphertext is discarded.
    pub fn into_inner(self) -> Box<dyn AsyncStream> {
        self.stream
    }

    fn init_encoder(&mut self) {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.encoder = Some(XChaCha20::new(&self.key.into(), &nonce.into()));
        // The nonce travels in the clear ahead of any ciphertext.
        self.write_cache[0..NONCE_LEN].copy_from_slice(&nonce);
        self.write_cache_end_offset = NONCE_LEN;
    }

    /// Returns true once the cache is fully drained.
    fn do_write_cache(&mut self, cx: &mut Context<'_>) -> std::io::Result<bool> {
        while self.write_cache_start_offset < self.write_cache_end_offset {
            match Pin::new(&mut self.stream).poll_write(
                cx,
                &self.write_cache[self.write_cache_start_offset..self.write_cache_end_offset],
            ) {
                Poll::Ready(Ok(written)) => {
                    if written == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "EOF while writing cached cipher data",
                        ));
                    }
                    self.write_cache_start_offset += written;
                }
                Poll::Ready(Err(e)) => {
                    return Err(e);
                }
                Poll::Pending => {
                    return Ok(false);
                }
            }
        }
        self.write_cache_start_offset = 0;
        self.write_cache_end_offset = 0;
        Ok(true)
    }
}

impl AsyncRead for CipherStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.decoder.is_none() {
            // Block until the peer's full nonce has arrived.
            while this.read_nonce_len < NONCE_LEN {
                let mut nonce_buf = ReadBuf::new(&mut this.read_nonce[this.read_nonce_len..]);
                ready!(Pin::new(&mut this.stream).poll_read(cx, &mut nonce_buf))?;
                let n = nonce_buf.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "EOF while reading cipher nonce",
                    )));
                }
                this.read_nonce_len += n;
            }
            this.decoder = Some(XChaCha20::new(
                &this.key.into(),
                &this.read_nonce.into(),
            ));
        }

        let filled_before = buf.filled().len();
        ready!(Pin::new(&mut this.stream).poll_read(cx, buf))?;
        let newly_filled = &mut buf.filled_mut()[filled_before..];
        if !newly_filled.is_empty() {
            this.decoder.as_mut().unwrap().apply_keystream(newly_filled);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for CipherStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.encoder.is_none() {
            this.init_encoder();
        }

        if this.write_cache_end_offset > 0 {
            match this.do_write_cache(cx) {
                Ok(true) => (),
                Ok(false) => {
                    if this.write_cache_end_offset == this.write_cache.len() {
                        return Poll::Pending;
                    }
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }

        let available = this.write_cache.len() - this.write_cache_end_offset;
        let write_len = std::cmp::min(buf.len(), available);
        if write_len == 0 {
            return Poll::Pending;
        }

        let end = this.write_cache_end_offset + write_len;
        this.write_cache[this.write_cache_end_offset..end].copy_from_slice(&buf[0..write_len]);
        this.encoder
            .as_mut()
            .unwrap()
            .apply_keystream(&mut this.write_cache[this.write_cache_end_offset..end]);
        this.write_cache_end_offset = end;

        if let Err(e) = this.do_write_cache(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(write_len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        while this.write_cache_end_offset > 0 {
            match this.do_write_cache(cx) {
                Ok(true) => break,
                Ok(false) => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        while this.write_cache_end_offset > 0 {
            match this.do_write_cache(cx) {
                Ok(true) => break,
                Ok(false) => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl AsyncStream for CipherStream {}
