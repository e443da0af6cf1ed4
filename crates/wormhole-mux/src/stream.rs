//! A single logical stream carried by a [`Multiplexer`](crate::Multiplexer)

use crate::multiplexer::{Shared, StreamItem};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::PollSemaphore;
use tracing::trace;
use wormhole_proto::{Frame, StreamId};

/// Multiplexed stream handle
///
/// Reads return EOF once the peer closes its write side. Shutting down the
/// write side sends a close frame but keeps the read side usable. Dropping the
/// handle closes both directions.
///
/// Writes wait while the peer's receive window is full, so a peer that stops
/// reading stalls the writer instead of growing buffers.
pub struct MuxStream {
    stream_id: StreamId,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    pending: Bytes,
    buffered: Arc<AtomicUsize>,
    credit: Arc<Semaphore>,
    poll_credit: PollSemaphore,
    /// Read but not yet granted back to the peer
    unacked: usize,
    read_closed: bool,
    write_closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: StreamId,
        shared: Arc<Shared>,
        rx: mpsc::UnboundedReceiver<StreamItem>,
        buffered: Arc<AtomicUsize>,
        credit: Arc<Semaphore>,
    ) -> Self {
        Self {
            stream_id,
            shared,
            rx,
            pending: Bytes::new(),
            buffered,
            poll_credit: PollSemaphore::new(credit.clone()),
            credit,
            unacked: 0,
            read_closed: false,
            write_closed: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Abort the stream, the peer sees a connection reset
    pub fn abort(mut self) {
        self.write_closed = true;
        let _ = self.shared.send_frame(Frame::reset(self.stream_id));
    }

    /// Account for `n` bytes handed to the reader, returning credit in
    /// batches of half a window
    fn consumed(&mut self, n: usize) {
        self.buffered.fetch_sub(n, Ordering::AcqRel);
        self.unacked += n;

        let threshold = (self.shared.receive_window() / 2).max(1);
        if self.unacked >= threshold {
            self.shared.grant(self.stream_id, self.unacked);
            self.unacked = 0;
        }
    }

    fn write_error(&self) -> io::Error {
        if self.shared.is_closed() {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("stream {}: multiplexer closed", self.stream_id),
            )
        } else {
            io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("stream {} reset", self.stream_id),
            )
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pending.is_empty() {
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(data)) => this.pending = data,
                Some(Err(kind)) => {
                    this.read_closed = true;
                    return Poll::Ready(Err(io::Error::new(
                        kind,
                        format!("stream {} terminated", this.stream_id),
                    )));
                }
                None => {
                    trace!("Stream {} reached EOF", this.stream_id);
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        this.consumed(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("stream {} closed for writing", this.stream_id),
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // Wait for at least one byte of credit, then take what else is there
        let Some(permit) = ready!(this.poll_credit.poll_acquire(cx)) else {
            return Poll::Ready(Err(this.write_error()));
        };
        permit.forget();

        let wanted = buf.len().min(this.shared.config.max_frame_payload.max(1));
        let mut n = 1;
        let extra = (wanted - 1).min(this.credit.available_permits());
        if extra > 0 {
            if let Ok(more) = this.credit.try_acquire_many(extra as u32) {
                more.forget();
                n += extra;
            }
        }

        let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(&buf[..n]));
        match this.shared.send_frame(frame) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionAborted, e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            let _ = this.shared.send_frame(Frame::close(this.stream_id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.write_closed {
            let _ = self.shared.send_frame(Frame::close(self.stream_id));
        }
        self.shared.forget(self.stream_id);
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("stream_id", &self.stream_id)
            .field("send_credit", &self.credit.available_permits())
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}
