//! One duplex stream and the three loops that drive it.
//!
//! ```text
//!            ┌────────────┐  inbound (bounded)  ┌───────────────┐
//!  stream ──▶│ read loop  │────────────────────▶│ dispatch loop │──▶ ConnectionHandler::on_message
//!            └────────────┘                     └───────────────┘
//!            ┌────────────┐  outbound (bounded)
//!  stream ◀──│ write loop │◀──────────────────── Connection::send (any task)
//!            └────────────┘
//! ```
//!
//! All three loops stop on the shared close signal, and any loop that exits
//! (error, EOF, deadline, panic) closes the connection on its way out.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerwire_frame::{Frame, FrameError, FrameKind, FrameReader, FrameWriter, Message};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{Result, RpcError};

/// Process-unique connection identifier, used for logging and call ownership.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Callbacks supplied by the connection's owner.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called from the dispatch loop for every request or response message.
    ///
    /// Must not block; long-running work belongs in a spawned task.
    fn on_message(&self, conn: &Connection, kind: FrameKind, message: Message);

    /// Called exactly once when the connection starts closing.
    fn on_close(&self, conn: &Connection) {
        let _ = conn;
    }
}

/// Cheaply cloneable handle to a running connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    peer_label: String,
    state: AtomicU8,
    shutdown: CancellationToken,
    outbound: mpsc::Sender<Frame>,
    max_payload_size: usize,
    handler: Arc<dyn ConnectionHandler>,
}

/// The not-yet-started loops of a connection.
///
/// Splitting construction from [`ConnectionDriver::start`] lets an owner
/// publish the [`Connection`] (for example to an "on open" callback) before
/// any frame can be read or the connection can close.
pub struct ConnectionDriver<S> {
    conn: Connection,
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    outbound: mpsc::Receiver<Frame>,
    config: ConnectionConfig,
}

impl Connection {
    /// Wrap `stream` and start its loops on the current tokio runtime.
    pub fn spawn<S>(
        stream: S,
        peer_label: impl Into<String>,
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let driver = Self::new(stream, peer_label, config, handler);
        let conn = driver.connection().clone();
        driver.start();
        conn
    }

    /// Wrap `stream` without starting the loops.
    pub fn new<S>(
        stream: S,
        peer_label: impl Into<String>,
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ConnectionDriver<S>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));

        let conn = Connection {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_label: peer_label.into(),
                state: AtomicU8::new(STATE_OPEN),
                shutdown: CancellationToken::new(),
                outbound: outbound_tx,
                max_payload_size: config.max_payload_size,
                handler,
            }),
        };

        ConnectionDriver {
            reader: FrameReader::with_config(read_half, config.frame_config()),
            writer: FrameWriter::with_config(write_half, config.frame_config()),
            outbound: outbound_rx,
            conn,
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Description of the remote side, for logs.
    pub fn peer_label(&self) -> &str {
        &self.inner.peer_label
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// True once close has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != STATE_OPEN
    }

    /// Resolves once close has begun.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// A token cancelled when this connection closes.
    pub fn close_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Queue a message for the write loop.
    ///
    /// Frames are written whole by a single writer, so concurrent senders
    /// never interleave. Waits while the outbound queue is full.
    pub async fn send(&self, kind: FrameKind, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ClosedConnection);
        }
        let frame = Frame::new(kind, message.encode());
        if frame.payload.len() > self.inner.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.inner.max_payload_size,
            }
            .into());
        }
        self.enqueue(frame).await
    }

    /// Queue a message without waiting for room in the outbound queue.
    ///
    /// Fails with [`RpcError::Backpressure`] when the queue is full.
    pub fn try_send(&self, kind: FrameKind, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ClosedConnection);
        }
        let frame = Frame::new(kind, message.encode());
        if frame.payload.len() > self.inner.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.inner.max_payload_size,
            }
            .into());
        }
        self.inner.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RpcError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => RpcError::ClosedConnection,
        })
    }

    /// Queue a heartbeat frame.
    pub async fn send_heartbeat(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ClosedConnection);
        }
        self.enqueue(Frame::heartbeat()).await
    }

    async fn enqueue(&self, frame: Frame) -> Result<()> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(RpcError::ClosedConnection),
            sent = self.inner.outbound.send(frame) => sent.map_err(|_| RpcError::ClosedConnection),
        }
    }

    /// Close the connection. Idempotent; only the first call has an effect.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        debug!(conn = self.id(), peer = %self.peer_label(), "closing connection");
        self.inner.shutdown.cancel();

        let handler = Arc::clone(&self.inner.handler);
        if std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_close(self))).is_err() {
            warn!(conn = self.id(), "close callback panicked");
        }

        self.inner.state.store(STATE_CLOSED, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer", &self.peer_label())
            .field("state", &self.state())
            .finish()
    }
}

impl<S> ConnectionDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// The handle for the connection this driver runs.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Spawn the read, dispatch and write loops.
    pub fn start(self) {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity.max(1));

        debug!(
            conn = self.conn.id(),
            peer = %self.conn.peer_label(),
            "starting connection loops"
        );

        tokio::spawn(read_loop(
            self.conn.clone(),
            self.reader,
            inbound_tx,
            self.config.read_timeout,
        ));
        tokio::spawn(dispatch_loop(self.conn.clone(), inbound_rx));
        tokio::spawn(write_loop(
            self.conn,
            self.writer,
            self.outbound,
            self.config.heartbeat_interval,
        ));
    }
}

/// Closes the connection when a loop returns or unwinds.
struct CloseOnExit<'a> {
    conn: &'a Connection,
    task: &'static str,
}

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!(conn = self.conn.id(), task = self.task, "connection loop panicked");
        } else {
            trace!(conn = self.conn.id(), task = self.task, "connection loop exited");
        }
        self.conn.close();
    }
}

async fn read_loop<R>(
    conn: Connection,
    mut reader: FrameReader<R>,
    inbound: mpsc::Sender<(FrameKind, Message)>,
    read_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    let _guard = CloseOnExit {
        conn: &conn,
        task: "read",
    };
    let shutdown = conn.inner.shutdown.clone();

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = tokio::time::timeout(read_timeout, reader.read_frame()) => match result {
                Ok(Ok(frame)) => frame,
                Ok(Err(FrameError::ConnectionClosed)) => {
                    debug!(conn = conn.id(), "peer closed the stream");
                    break;
                }
                Ok(Err(err)) => {
                    warn!(conn = conn.id(), error = %err, "failed to read frame");
                    break;
                }
                Err(_) => {
                    warn!(conn = conn.id(), timeout = ?read_timeout, "read deadline expired");
                    break;
                }
            },
        };

        let kind = frame.kind;
        let message = match frame.into_message() {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!(conn = conn.id(), "heartbeat received");
                continue;
            }
            Err(err) => {
                warn!(conn = conn.id(), error = %err, "failed to decode envelope");
                break;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = inbound.send((kind, message)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn dispatch_loop(conn: Connection, mut inbound: mpsc::Receiver<(FrameKind, Message)>) {
    let _guard = CloseOnExit {
        conn: &conn,
        task: "dispatch",
    };
    let shutdown = conn.inner.shutdown.clone();
    let handler = Arc::clone(&conn.inner.handler);

    loop {
        // Suspends until a message or the close signal; never polls in a loop.
        tokio::select! {
            biased;
            next = inbound.recv() => match next {
                Some((kind, message)) => handler.on_message(&conn, kind, message),
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn write_loop<W>(
    conn: Connection,
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Frame>,
    heartbeat_interval: Option<Duration>,
) where
    W: AsyncWrite + Unpin,
{
    let guard = CloseOnExit {
        conn: &conn,
        task: "write",
    };
    let shutdown = conn.inner.shutdown.clone();
    let mut heartbeat = heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
            _ = next_tick(&mut heartbeat) => {
                trace!(conn = conn.id(), "sending heartbeat");
                Frame::heartbeat()
            }
        };

        let written = tokio::select! {
            _ = shutdown.cancelled() => break,
            written = writer.write_frame(&frame) => written,
        };
        if let Err(err) = written {
            warn!(conn = conn.id(), error = %err, "failed to write frame");
            break;
        }
        if let Some(interval) = heartbeat.as_mut() {
            interval.reset();
        }
    }

    drop(guard);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
