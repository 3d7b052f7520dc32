//! Link lifecycle: mux tasks, control plane, liveness bookkeeping.

use crate::stream::TunnelStream;
use burrow_proto::{ControlError, ControlMessage, Frame, FrameKind, StreamId};
use burrow_transport::{ControlReceiver, ControlSender, FramedTransport, TransportError};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Which side of the link this is. Determines stream-id parity so both
/// sides can open streams without coordinating: the relay allocates even
/// ids, the agent odd ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Server,
    Agent,
}

impl LinkRole {
    fn first_stream_id(self) -> u32 {
        match self {
            LinkRole::Server => 2,
            LinkRole::Agent => 1,
        }
    }

    /// Parity (`id % 2`) of ids the *peer* allocates.
    fn peer_parity(self) -> u32 {
        match self {
            LinkRole::Server => 1,
            LinkRole::Agent => 0,
        }
    }
}

type StreamMap = Arc<RwLock<HashMap<StreamId, mpsc::Sender<Bytes>>>>;

/// One live tunnel connection.
///
/// Owns the framed transport through two background tasks (one reader, one
/// writer); everything else holds channels into them. Dropping the last
/// reference tears the underlying WebSocket down.
pub struct Link {
    role: LinkRole,
    frame_tx: mpsc::Sender<Frame>,
    streams: StreamMap,
    accept_rx: Mutex<mpsc::Receiver<TunnelStream>>,
    next_stream_id: AtomicU32,
    control_tx: ControlSender,
    control_rx: Mutex<ControlReceiver>,
    last_activity: std::sync::Mutex<Instant>,
    pending_ping: std::sync::Mutex<Option<Instant>>,
    shutdown: CancellationToken,
}

impl Link {
    /// Build a link over an established framed transport.
    pub fn new(
        transport: FramedTransport,
        control_tx: ControlSender,
        control_rx: ControlReceiver,
        role: LinkRole,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);
        let (accept_tx, accept_rx) = mpsc::channel::<TunnelStream>(64);
        let streams: StreamMap = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(write_task(write_half, frame_rx, shutdown.clone()));
        tokio::spawn(read_task(
            read_half,
            streams.clone(),
            accept_tx,
            frame_tx.clone(),
            shutdown.clone(),
            role,
        ));

        Self {
            role,
            frame_tx,
            streams,
            accept_rx: Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            control_tx,
            control_rx: Mutex::new(control_rx),
            last_activity: std::sync::Mutex::new(Instant::now()),
            pending_ping: std::sync::Mutex::new(None),
            shutdown,
        }
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Open a new outgoing stream. Fails once the link is closed.
    pub async fn open_stream(&self) -> Result<TunnelStream, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }

        let id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(256);
        self.streams.write().await.insert(id, tx);

        trace!(stream_id = id, "opened stream");
        Ok(TunnelStream::new(
            id,
            rx,
            self.frame_tx.clone(),
            self.shutdown.clone(),
        ))
    }

    /// Wait for the peer to open a stream. Fails once the link is closed.
    pub async fn accept_stream(&self) -> Result<TunnelStream, LinkError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(LinkError::Closed),
            stream = rx.recv() => stream.ok_or(LinkError::Closed),
        }
    }

    /// Send one control message.
    pub async fn send_control(&self, msg: ControlMessage) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        Ok(self.control_tx.send(msg).await?)
    }

    /// Read the next control message. Single consumer; any observed
    /// ping/pong refreshes the activity clock. `None` means the link is
    /// gone.
    pub async fn recv_control(&self) -> Option<Result<ControlMessage, ControlError>> {
        let mut rx = self.control_rx.lock().await;
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            msg = rx.recv() => msg?,
        };
        if result.is_ok() {
            self.mark_activity();
        }
        Some(result)
    }

    /// Send a keepalive ping and remember when, for round-trip measurement.
    pub async fn ping(&self) -> Result<(), LinkError> {
        self.send_control(ControlMessage::Ping).await?;
        *self.pending_ping.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    /// Reply to a peer ping.
    pub async fn pong(&self) -> Result<(), LinkError> {
        self.send_control(ControlMessage::Pong).await
    }

    /// Most recent time a ping or pong was observed on this link.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub fn mark_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Round trip of the most recent outstanding ping, if one was pending.
    pub fn take_ping_rtt(&self) -> Option<Duration> {
        self.pending_ping.lock().unwrap().take().map(|t| t.elapsed())
    }

    /// Tear the link down: all streams fail, both mux tasks exit, the
    /// transport closes. Safe to call any number of times.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("closing link");
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves when the link has closed, whatever the reason.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Number of streams currently routed on this link.
    pub async fn active_streams(&self) -> usize {
        self.streams.read().await.len()
    }
}

/// Pulls bytes off the transport, decodes frames, routes them to streams.
async fn read_task(
    mut reader: ReadHalf<FramedTransport>,
    streams: StreamMap,
    accept_tx: mpsc::Sender<TunnelStream>,
    frame_tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    role: LinkRole,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);

    'outer: loop {
        loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => {
                    dispatch_frame(frame, &streams, &accept_tx, &frame_tx, &shutdown, role).await;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("frame decode failed: {e}");
                    break 'outer;
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!("transport reached eof");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("transport read failed: {e}");
                    break;
                }
            },
        }
    }

    shutdown.cancel();
    // Dropping the senders fails every in-flight stream read.
    streams.write().await.clear();
    debug!("link read task ended");
}

async fn dispatch_frame(
    frame: Frame,
    streams: &StreamMap,
    accept_tx: &mpsc::Sender<TunnelStream>,
    frame_tx: &mpsc::Sender<Frame>,
    shutdown: &CancellationToken,
    role: LinkRole,
) {
    let id = frame.stream_id;

    match frame.kind {
        FrameKind::Data => {
            let known = streams.read().await.get(&id).cloned();
            match known {
                Some(tx) => {
                    if tx.send(frame.payload).await.is_err() {
                        // Local consumer went away; stop routing to it.
                        streams.write().await.remove(&id);
                    }
                }
                None if id % 2 == role.peer_parity() => {
                    // First frame of a peer-initiated stream.
                    let (tx, rx) = mpsc::channel(256);
                    if tx.send(frame.payload).await.is_err() {
                        return;
                    }
                    streams.write().await.insert(id, tx);

                    let stream = TunnelStream::new(id, rx, frame_tx.clone(), shutdown.clone());
                    if accept_tx.send(stream).await.is_err() {
                        warn!(stream_id = id, "nobody accepting streams; dropping");
                        streams.write().await.remove(&id);
                    }
                }
                None => {
                    trace!(stream_id = id, "data for retired stream");
                }
            }
        }
        FrameKind::Fin => {
            let removed = streams.write().await.remove(&id);
            if let Some(tx) = removed {
                // Empty payload is the in-band eof marker.
                let _ = tx.send(Bytes::new()).await;
            }
        }
    }
}

/// Serialises outbound frames onto the transport.
async fn write_task(
    mut writer: WriteHalf<FramedTransport>,
    mut rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("frame encode failed: {e}");
                continue;
            }
        };

        if let Err(e) = writer.write_all(&encoded).await {
            debug!("transport write failed: {e}");
            break;
        }
    }

    shutdown.cancel();
    let _ = writer.shutdown().await;
    debug!("link write task ended");
}
