//! Byte-pipe adapter over a message-oriented WebSocket.
//!
//! The multiplexer above expects an ordered, reliable byte stream; the
//! WebSocket below delivers discrete frames. [`FramedTransport`] bridges the
//! two: every `write` emits exactly one binary frame (no buffering across
//! calls, no coalescing), every `read` drains the current inbound binary
//! frame and then blocks for the next one. Text frames never surface on the
//! byte pipe: they are the control plane and are routed to the
//! [`ControlReceiver`].
//!
//! A single writer task owns the WebSocket sink; the byte pipe and the
//! control plane both feed it through a channel, so frame writes are
//! serialised while a read and a write may proceed concurrently.

use crate::{TransportError, WRITE_TIMEOUT};
use burrow_proto::{ControlError, ControlMessage};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

/// Byte streams the WebSocket can run over (TCP, TLS, in-memory pipes).
pub trait Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug> Io for T {}

/// Type-erased underlying stream, so relay, agent and tests share one
/// WebSocket type regardless of TLS.
pub type BoxedIo = Box<dyn Io>;

pub type WsStream = WebSocketStream<BoxedIo>;

/// Wrap an already-established byte stream in the WebSocket protocol
/// without an HTTP upgrade. Used where the upgrade happened elsewhere.
pub async fn upgrade_raw(io: impl Io + 'static, role: Role) -> WsStream {
    WebSocketStream::from_raw_socket(Box::new(io) as BoxedIo, role, None).await
}

/// Sending half of the control plane. One JSON text frame per message.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Message>,
}

impl ControlSender {
    /// Send one control message, bounded by the per-write deadline.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), TransportError> {
        let send = self.tx.send(Message::Text(msg.encode()));
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }
}

/// Receiving half of the control plane.
///
/// Single-consumer: control reads must not be interleaved from multiple
/// tasks, which the `&mut self` receiver enforces.
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ControlReceiver {
    /// Next inbound control message, or `None` once the transport is gone.
    ///
    /// A malformed or unknown-type message is surfaced as `Some(Err(_))` so
    /// the caller can log it and keep reading.
    pub async fn recv(&mut self) -> Option<Result<ControlMessage, ControlError>> {
        let text = self.rx.recv().await?;
        Some(ControlMessage::decode(&text))
    }
}

/// The byte pipe. See module docs for the read/write contract.
pub struct FramedTransport {
    source: SplitStream<WsStream>,
    /// Remainder of the inbound binary frame currently being drained.
    current: Bytes,
    outbound: PollSender<Message>,
    control_in: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    /// Cancelling this makes the writer task close the WebSocket even while
    /// control senders are still alive.
    writer_stop: CancellationToken,
}

impl FramedTransport {
    /// Split a WebSocket into the byte pipe and the control-plane halves.
    pub fn new(ws: WsStream) -> (FramedTransport, ControlSender, ControlReceiver) {
        let (sink, source) = ws.split();

        let (frame_tx, frame_rx) = mpsc::channel::<Message>(64);
        let (control_in_tx, control_in_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let writer_stop = CancellationToken::new();

        tokio::spawn(writer_task(
            sink,
            frame_rx,
            closed.clone(),
            writer_stop.clone(),
        ));

        let transport = FramedTransport {
            source,
            current: Bytes::new(),
            outbound: PollSender::new(frame_tx.clone()),
            control_in: control_in_tx,
            closed,
            writer_stop,
        };
        let sender = ControlSender { tx: frame_tx };
        let receiver = ControlReceiver { rx: control_in_rx };

        (transport, sender, receiver)
    }

    fn poll_next_frame(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<Bytes>>> {
        loop {
            match Pin::new(&mut self.source).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    trace!(len = data.len(), "inbound binary frame");
                    return Poll::Ready(Ok(Some(Bytes::from(data))));
                }
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    // Control plane: hand off and keep reading the byte pipe.
                    if self.control_in.send(text).is_err() {
                        trace!("control receiver dropped; discarding control frame");
                    }
                }
                Poll::Ready(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {
                    // WebSocket-level keepalive; tungstenite answers pings itself.
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    debug!("websocket closed by remote");
                    self.closed.store(true, Ordering::SeqCst);
                    return Poll::Ready(Ok(None));
                }
                Poll::Ready(Some(Ok(Message::Frame(_)))) => {
                    // Raw frames do not surface outside tungstenite internals.
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncRead for FramedTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match futures_util::ready!(this.poll_next_frame(cx))? {
                Some(frame) => this.current = frame,
                // EOF
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for FramedTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport closed",
            )));
        }

        match futures_util::ready!(this.outbound.poll_reserve(cx)) {
            Ok(()) => {}
            Err(_) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "transport closed",
                )))
            }
        }

        if this
            .outbound
            .send_item(Message::Binary(buf.to_vec()))
            .is_err()
        {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport closed",
            )));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer task flushes every frame it sends.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.closed.store(true, Ordering::SeqCst);
        this.outbound.close();
        this.writer_stop.cancel();
        Poll::Ready(Ok(()))
    }
}

/// Owns the WebSocket sink; everything outbound funnels through here.
async fn writer_task(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Message>,
    closed: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = stop.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if let Err(e) = sink.send(msg).await {
            warn!("websocket send failed: {e}");
            break;
        }
    }

    closed.store(true, Ordering::SeqCst);
    let _ = sink.close().await;
    debug!("websocket writer task ended");
}
