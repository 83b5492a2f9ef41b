// Forked from tokio's copy.rs and copy_bidirectional.rs.
//
// Changes:
// - Circular buffer, not initialized before use
// - Read and write whenever there's space
// - Optional initial flush for handshake responses still sitting in
//   stream-level caches

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::ReadBuf;

use crate::async_stream::AsyncStream;
use crate::util::allocate_vec;

const DEFAULT_BUF_SIZE: usize = 16384;

struct CopyBuffer {
    read_done: bool,
    need_flush: bool,
    start_index: usize,
    cache_length: usize,
    size: usize,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new(size: usize, need_initial_flush: bool) -> Self {
        Self {
            read_done: false,
            need_flush: need_initial_flush,
            start_index: 0,
            cache_length: 0,
            size,
            buf: allocate_vec(size).into_boxed_slice(),
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncStream + ?Sized,
        W: AsyncStream + ?Sized,
    {
        loop {
            let mut read_pending = false;
            let mut write_pending = false;

            // Read as much as possible before writing, so that stream
            // implementations which packetize individual writes see fewer,
            // larger buffers.
            while !self.read_done && self.cache_length < self.size {
                let unused_start_index = (self.start_index + self.cache_length) % self.size;
                let unused_end_index_exclusive = if unused_start_index < self.start_index {
                    self.start_index
                } else {
                    self.size
                };

                let me = &mut *self;
                let mut buf =
                    ReadBuf::new(&mut me.buf[unused_start_index..unused_end_index_exclusive]);
                match reader.as_mut().poll_read(cx, &mut buf) {
                    Poll::Ready(val) => {
                        val?;
                        let n = buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cache_length += n;
                        }
                    }
                    Poll::Pending => {
                        read_pending = true;
                        break;
                    }
                }
            }

            // Drain as much of the cache as the writer will take.
            while self.cache_length > 0 {
                let used_start_index = self.start_index;
                let used_end_index_exclusive =
                    std::cmp::min(self.start_index + self.cache_length, self.size);

                let me = &mut *self;
                match writer
                    .as_mut()
                    .poll_write(cx, &me.buf[used_start_index..used_end_index_exclusive])
                {
                    Poll::Ready(val) => {
                        let written = val?;
                        if written == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "write zero byte into writer",
                            )));
                        } else {
                            self.cache_length -= written;
                            if self.cache_length == 0 {
                                self.start_index = 0;
                            } else {
                                self.start_index = (self.start_index + written) % self.size;
                            }
                            self.need_flush = true;
                        }
                    }
                    Poll::Pending => {
                        write_pending = true;
                        break;
                    }
                }
            }

            if self.need_flush {
                ready!(writer.as_mut().poll_flush(cx))?;
                self.need_flush = false;
            }

            // If we've written all the data and we've seen EOF, finish the transfer.
            if self.read_done && self.cache_length == 0 {
                return Poll::Ready(Ok(()));
            }

            if read_pending || write_pending {
                return Poll::Pending;
            }
        }
    }
}

enum TransferState {
    Running,
    ShuttingDown,
    Done,
}

struct CopyBidirectional<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_buf: CopyBuffer,
    b_buf: CopyBuffer,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

fn transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    buf: &mut CopyBuffer,
    r: &mut A,
    w: &mut B,
) -> Poll<io::Result<()>>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    let mut r = Pin::new(r);
    let mut w = Pin::new(w);

    loop {
        match state {
            TransferState::Running => {
                ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = TransferState::ShuttingDown;
            }
            TransferState::ShuttingDown => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = TransferState::Done;
            }
            TransferState::Done => return Poll::Ready(Ok(())),
        }
    }
}

impl<A, B> Future for CopyBidirectional<'_, A, B>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let CopyBidirectional {
            a,
            b,
            a_buf,
            b_buf,
            a_to_b,
            b_to_a,
        } = &mut *self;

        let a_to_b = transfer_one_direction(cx, a_to_b, &mut *a_buf, &mut **a, &mut **b);
        let b_to_a = transfer_one_direction(cx, b_to_a, &mut *b_buf, &mut **b, &mut **a);

        // Either side finishing (EOF or error) ends the session.
        if a_to_b.is_ready() {
            return a_to_b;
        } else if b_to_a.is_ready() {
            return b_to_a;
        }

        Poll::Pending
    }
}

/// Copies data in both directions between `a` and `b` until either side
/// reports EOF or an error. When one direction finishes, the opposing
/// writer is shut down.
pub async fn copy_bidirectional<A, B>(
    a: &mut A,
    b: &mut B,
    a_need_initial_flush: bool,
    b_need_initial_flush: bool,
) -> io::Result<()>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    CopyBidirectional {
        a,
        b,
        // Correctly reversed: a_buf copies from a (reader) to b (writer), so
        // its flush signal belongs to b, and vice versa.
        a_buf: CopyBuffer::new(DEFAULT_BUF_SIZE, b_need_initial_flush),
        b_buf: CopyBuffer::new(DEFAULT_BUF_SIZE, a_need_initial_flush),
        a_to_b: TransferState::Running,
        b_to_a: TransferState::Running,
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let (mut client_side, mut proxy_client_side) = tokio::io::duplex(4096);
        let (mut proxy_remote_side, mut remote_side) = tokio::io::duplex(4096);

        let copier = tokio::spawn(async move {
            copy_bidirectional(&mut proxy_client_side, &mut proxy_remote_side, false, false)
                .await
        });

        client_side.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        remote_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        remote_side.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(client_side);
        drop(remote_side);
        copier.await.unwrap().unwrap();
    }
}
