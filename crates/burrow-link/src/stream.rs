//! One multiplexed stream, shaped like a socket.

use burrow_proto::{Frame, StreamId};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

/// Largest payload carried in a single data frame. Writes beyond this are
/// split; `poll_write` reports the short count and the caller loops.
const MAX_CHUNK: usize = 64 * 1024;

/// A bidirectional byte pipe carved from a [`crate::Link`].
///
/// Reading returns `Ok(0)` once the peer half-closes (Fin); shutting down
/// the write half sends Fin to the peer. If the parent link dies, every
/// subsequent read and write fails.
pub struct TunnelStream {
    id: StreamId,
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    out: PollSender<Frame>,
    link_closed: CancellationToken,
    read_eof: bool,
    wrote_fin: bool,
}

impl TunnelStream {
    pub(crate) fn new(
        id: StreamId,
        rx: mpsc::Receiver<Bytes>,
        out: mpsc::Sender<Frame>,
        link_closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            rx,
            current: Bytes::new(),
            out: PollSender::new(out),
            link_closed,
            read_eof: false,
            wrote_fin: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    fn closed_err() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "link closed")
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.current.is_empty() {
            let n = this.current.len().min(buf.remaining());
            buf.put_slice(&this.current.split_to(n));
            return Poll::Ready(Ok(()));
        }

        if this.read_eof {
            return Poll::Ready(Ok(()));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                if data.is_empty() {
                    // Fin sentinel from the link's read task.
                    this.read_eof = true;
                    Poll::Ready(Ok(()))
                } else {
                    let n = data.len().min(buf.remaining());
                    let mut data = data;
                    buf.put_slice(&data.split_to(n));
                    this.current = data;
                    Poll::Ready(Ok(()))
                }
            }
            // Channel torn down without a Fin: the link is gone.
            Poll::Ready(None) => Poll::Ready(Err(Self::closed_err())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.wrote_fin {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream write half closed",
            )));
        }
        if this.link_closed.is_cancelled() {
            return Poll::Ready(Err(Self::closed_err()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.out.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(Self::closed_err()));
        }

        let n = buf.len().min(MAX_CHUNK);
        let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
        if this.out.send_item(frame).is_err() {
            return Poll::Ready(Err(Self::closed_err()));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.wrote_fin {
            return Poll::Ready(Ok(()));
        }
        if this.link_closed.is_cancelled() {
            // Nothing left to tell the peer.
            this.wrote_fin = true;
            return Poll::Ready(Ok(()));
        }

        if ready!(this.out.poll_reserve(cx)).is_err() {
            this.wrote_fin = true;
            return Poll::Ready(Ok(()));
        }
        let _ = this.out.send_item(Frame::fin(this.id));
        this.wrote_fin = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        // Best-effort Fin so the peer is not left waiting on a stream the
        // local side silently abandoned.
        if !self.wrote_fin && !self.link_closed.is_cancelled() {
            if let Some(tx) = self.out.get_ref() {
                let _ = tx.try_send(Frame::fin(self.id));
            }
        }
    }
}
