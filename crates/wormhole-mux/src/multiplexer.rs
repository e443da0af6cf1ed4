//! Multiplexed connection implementation

use crate::stream::MuxStream;
use crate::{MuxConfig, MuxError, Role};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use wormhole_proto::{Frame, FrameCodec, FrameType, StreamId};

/// What the reader task delivers to a stream: payload, or the reason it died
pub(crate) type StreamItem = Result<Bytes, io::ErrorKind>;

/// Upper bound on a receive window, so every grant fits a window update
const MAX_WINDOW: usize = (u32::MAX / 2) as usize;

pub(crate) enum Outbound {
    Frame(Frame),
    /// Flush everything queued so far, then shut the transport down
    Shutdown,
}

/// What the reader task keeps for each open stream
struct StreamSlot {
    /// Dropped once the peer has finished writing, which the stream reads as EOF
    tx: Option<mpsc::UnboundedSender<StreamItem>>,
    /// Delivered to the stream but not read yet
    buffered: Arc<AtomicUsize>,
    /// Bytes we may still send, topped up by the peer's window updates
    send_credit: Arc<Semaphore>,
}

impl StreamSlot {
    fn fail(mut self, kind: io::ErrorKind) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(kind));
        }
        self.send_credit.close();
    }
}

/// State shared by the multiplexer handle, its I/O tasks and every stream
pub(crate) struct Shared {
    role: Role,
    next_stream_id: AtomicU32,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
    pub(crate) config: MuxConfig,
}

impl Shared {
    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, StreamSlot>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if self.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| MuxError::Closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Bytes each stream may buffer unread, and the credit granted to the peer
    pub(crate) fn receive_window(&self) -> usize {
        self.config.max_receive_buffer.clamp(1, MAX_WINDOW)
    }

    /// Hand `bytes` of send credit back to the peer
    pub(crate) fn grant(&self, stream_id: StreamId, bytes: usize) {
        let increment = u32::try_from(bytes).unwrap_or(u32::MAX);
        trace!("Granting {} bytes on stream {}", increment, stream_id);
        let _ = self.send_frame(Frame::window_update(stream_id, increment));
    }

    fn allocate_stream_id(&self) -> Result<StreamId, MuxError> {
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        if stream_id >= u32::MAX - 1 {
            return Err(MuxError::NoAvailableStreamIds);
        }
        Ok(stream_id)
    }

    fn register(self: &Arc<Self>, stream_id: StreamId) -> Result<MuxStream, MuxError> {
        let mut streams = self.streams();
        // Checked under the lock so `terminate` cannot miss a late registration
        if self.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        if streams.contains_key(&stream_id) {
            return Err(MuxError::StreamAlreadyExists(stream_id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let send_credit = Arc::new(Semaphore::new(0));
        streams.insert(
            stream_id,
            StreamSlot {
                tx: Some(tx),
                buffered: buffered.clone(),
                send_credit: send_credit.clone(),
            },
        );

        Ok(MuxStream::new(stream_id, self.clone(), rx, buffered, send_credit))
    }

    pub(crate) fn forget(&self, stream_id: StreamId) {
        self.streams().remove(&stream_id);
    }

    fn stream_count(&self) -> usize {
        self.streams().len()
    }

    /// Fail a stream locally; returns whether it was still open
    fn fail_stream(&self, stream_id: StreamId, kind: io::ErrorKind) -> bool {
        let slot = self.streams().remove(&stream_id);
        match slot {
            Some(slot) => {
                slot.fail(kind);
                true
            }
            None => false,
        }
    }

    /// Fail a stream and tell the peer
    fn reset_stream(&self, stream_id: StreamId) {
        self.fail_stream(stream_id, io::ErrorKind::ConnectionReset);
        let _ = self.send_frame(Frame::reset(stream_id));
    }

    /// Mark the multiplexer dead and fail every open stream
    fn terminate(&self) {
        self.closed.cancel();

        let slots: Vec<_> = self.streams().drain().map(|(_, slot)| slot).collect();
        if !slots.is_empty() {
            debug!("Aborting {} open streams", slots.len());
        }
        for slot in slots {
            slot.fail(io::ErrorKind::ConnectionAborted);
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, incoming: &mpsc::Sender<MuxStream>) {
        let stream_id = frame.stream_id;

        match frame.frame_type {
            FrameType::Open => {
                if stream_id == 0 || self.role.owns(stream_id) {
                    warn!("Peer opened stream {} from our ID space, resetting", stream_id);
                    let _ = self.send_frame(Frame::reset(stream_id));
                    return;
                }

                let stream = match self.register(stream_id) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Rejecting stream {}: {}", stream_id, e);
                        let _ = self.send_frame(Frame::reset(stream_id));
                        return;
                    }
                };
                self.grant(stream_id, self.receive_window());

                debug!("Accepted incoming stream: {}", stream_id);
                if let Err(e) = incoming.try_send(stream) {
                    warn!("Accept backlog full, resetting stream {}", stream_id);
                    match e {
                        mpsc::error::TrySendError::Full(stream)
                        | mpsc::error::TrySendError::Closed(stream) => stream.abort(),
                    }
                }
            }
            FrameType::Data => {
                let len = frame.payload.len();
                if len == 0 {
                    return;
                }
                trace!("Received {} bytes on stream {}", len, stream_id);

                let overrun = {
                    let streams = self.streams();
                    let Some((tx, buffered)) = streams
                        .get(&stream_id)
                        .and_then(|slot| Some((slot.tx.as_ref()?, &slot.buffered)))
                    else {
                        trace!("Dropping data for closed stream {}", stream_id);
                        return;
                    };
                    if buffered.fetch_add(len, Ordering::AcqRel) + len > self.receive_window() {
                        true
                    } else {
                        let _ = tx.send(Ok(frame.payload));
                        false
                    }
                };

                if overrun {
                    warn!("Stream {} overran its receive window, resetting", stream_id);
                    self.reset_stream(stream_id);
                }
            }
            FrameType::Close if frame.is_reset() => {
                if self.fail_stream(stream_id, io::ErrorKind::ConnectionReset) {
                    debug!("Stream {} reset by peer", stream_id);
                } else {
                    trace!("Reset for unknown stream {}", stream_id);
                }
            }
            FrameType::Close => match self.streams().get_mut(&stream_id) {
                Some(slot) => {
                    slot.tx = None;
                    debug!("Stream {} closed by peer", stream_id);
                }
                None => trace!("Close for unknown stream {}", stream_id),
            },
            FrameType::WindowUpdate => {
                let Some(increment) = frame.window_increment() else {
                    warn!("Malformed window update on stream {}, resetting", stream_id);
                    self.reset_stream(stream_id);
                    return;
                };

                let overflow = match self.streams().get(&stream_id) {
                    Some(slot) => {
                        let credit = slot.send_credit.available_permits();
                        let limit = MAX_WINDOW.min(Semaphore::MAX_PERMITS);
                        if credit.saturating_add(increment as usize) > limit {
                            true
                        } else {
                            slot.send_credit.add_permits(increment as usize);
                            false
                        }
                    }
                    None => {
                        trace!("Window update for unknown stream {}", stream_id);
                        false
                    }
                };

                if overflow {
                    warn!("Peer over-granted credit on stream {}, resetting", stream_id);
                    self.reset_stream(stream_id);
                }
            }
        }
    }
}

/// Many logical streams over one physical connection
///
/// Dropping the multiplexer tears the connection down, which fails every
/// stream still open on it.
pub struct Multiplexer {
    shared: Arc<Shared>,
    incoming: AsyncMutex<mpsc::Receiver<MuxStream>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Start multiplexing over `transport`
    ///
    /// Spawns one reader and one writer task; must be called from inside a
    /// tokio runtime.
    pub fn new<T>(transport: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog.max(1));

        let reader = FramedRead::new(read_half, FrameCodec::with_max_payload(config.max_frame_payload));
        let writer = FramedWrite::new(write_half, FrameCodec::new());

        let shared = Arc::new(Shared {
            role,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            streams: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            closed: CancellationToken::new(),
            config,
        });

        let read_task = tokio::spawn(read_loop(shared.clone(), reader, incoming_tx));
        let write_task = tokio::spawn(write_loop(shared.clone(), writer, outbound_rx));

        debug!("Multiplexer started ({:?})", role);

        Self {
            shared,
            incoming: AsyncMutex::new(incoming_rx),
            tasks: Mutex::new(vec![read_task, write_task]),
        }
    }

    /// Client side multiplexer with default settings
    pub fn client<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(transport, Role::Client, MuxConfig::default())
    }

    /// Server side multiplexer with default settings
    pub fn server<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(transport, Role::Server, MuxConfig::default())
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a new outgoing stream
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let stream_id = self.shared.allocate_stream_id()?;
        let stream = self.shared.register(stream_id)?;

        self.shared.send_frame(Frame::open(stream_id))?;
        self.shared.grant(stream_id, self.shared.receive_window());

        debug!("Opened stream: {}", stream_id);
        Ok(stream)
    }

    /// Wait for the peer to open a stream
    ///
    /// Returns `None` once the multiplexer is closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream,
            _ = self.shared.closed.cancelled() => None,
        }
    }

    /// Number of streams not yet dropped, reset or torn down
    pub fn active_streams(&self) -> usize {
        self.shared.stream_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the multiplexer is dead, whether closed locally or by
    /// a transport failure
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Flush pending frames, shut the transport down and fail all streams
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            let _ = self.shared.outbound.send(Outbound::Shutdown);
            let grace = self.shared.config.close_timeout;
            if tokio::time::timeout(grace, self.shared.closed.cancelled())
                .await
                .is_err()
            {
                debug!("Transport did not shut down within {:?}, forcing", grace);
            }
            self.shared.terminate();
        }

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut frames: FramedRead<R, FrameCodec>,
    incoming: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            next = frames.next() => next,
            _ = shared.closed.cancelled() => break,
        };

        match next {
            Some(Ok(frame)) => shared.dispatch(frame, &incoming),
            Some(Err(e)) => {
                warn!("Multiplexer read failed: {}", e);
                break;
            }
            None => {
                debug!("Transport closed by peer");
                break;
            }
        }
    }

    shared.terminate();
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut frames: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            next = outbound.recv() => next,
            _ = shared.closed.cancelled() => break,
        };

        match next {
            Some(Outbound::Frame(frame)) => {
                let result = tokio::select! {
                    result = frames.send(frame) => result,
                    _ = shared.closed.cancelled() => break,
                };
                if let Err(e) = result {
                    warn!("Multiplexer write failed: {}", e);
                    break;
                }
            }
            Some(Outbound::Shutdown) | None => {
                tokio::select! {
                    result = frames.close() => {
                        if let Err(e) = result {
                            debug!("Transport shutdown failed: {}", e);
                        }
                    }
                    _ = shared.closed.cancelled() => {}
                }
                break;
            }
        }
    }

    shared.terminate();
}
