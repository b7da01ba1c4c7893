//! Session read loop.
//!
//! A session owns one accepted connection. Once started with a packet
//! handler it runs on its own task:
//!
//! 1. compact the receive buffer if the tail is full
//! 2. read from the socket into the free tail, racing the read against the
//!    liveness timeout (the timeout only probes the connection, it never
//!    cancels the read)
//! 3. offer the unread bytes to the handler until it reports no progress
//!
//! The loop ends on peer close, liveness timeout, I/O error, buffer
//! exhaustion, handler fault or dispose. Teardown runs once on every path.

use crate::runtime::buffer::{BufferExhausted, RecvBuffer, DEFAULT_CAPACITY};
use crate::runtime::connection::{is_connected, Connection};
use crate::runtime::handler::{HandlerError, PacketHandler};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Default interval of the connectivity probe during an outstanding read.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(600);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Connectivity check run on every liveness timeout.
pub(crate) type ConnectivityProbe = fn(&TcpStream) -> bool;

/// Per-session tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Receive buffer capacity in bytes.
    pub buffer_size: usize,
    /// How often an outstanding read re-checks the connection.
    pub liveness_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CAPACITY,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The peer closed its side (zero-length read).
    GracefulClose,
    /// A liveness probe found the connection gone.
    Timeout,
    /// Transport failure or buffer exhaustion.
    IoError,
    /// The packet handler failed or broke its contract.
    HandlerFault,
    /// `dispose` was called.
    Disposed,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not reading yet.
    Created,
    /// Read loop is active.
    Running,
    /// Terminal; teardown has run.
    Stopped(StopReason),
}

/// Session failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot start session twice")]
    AlreadyStarted,

    #[error("session was disposed before it started")]
    Disposed,

    #[error(transparent)]
    BufferExhausted(#[from] BufferExhausted),

    #[error("session I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("packet handler fault: {0}")]
    HandlerFault(#[source] HandlerError),

    #[error("packet handler processed {processed} bytes but only {available} were available")]
    HandlerOverrun { processed: usize, available: usize },
}

impl SessionError {
    /// Terminal reason this error puts a running session in.
    ///
    /// `None` for errors that reject a call without touching the read loop.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            SessionError::AlreadyStarted | SessionError::Disposed => None,
            SessionError::BufferExhausted(_) | SessionError::Io(_) => Some(StopReason::IoError),
            SessionError::HandlerFault(_) | SessionError::HandlerOverrun { .. } => {
                Some(StopReason::HandlerFault)
            }
        }
    }
}

/// One accepted connection and its read loop.
#[derive(Debug)]
pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    config: SessionConfig,
    /// Present until the read loop takes ownership (or dispose releases it).
    conn: Mutex<Option<Connection>>,
    state: Mutex<SessionState>,
    started: AtomicBool,
    running: AtomicBool,
    disposed: AtomicBool,
    probe: ConnectivityProbe,
}

impl Session {
    /// Wrap an accepted stream. The session does not read until started.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, config: SessionConfig) -> Arc<Self> {
        Self::with_probe(stream, peer_addr, config, is_connected)
    }

    pub(crate) fn with_probe(
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: SessionConfig,
        probe: ConnectivityProbe,
    ) -> Arc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);

        Arc::new(Self {
            id,
            peer_addr,
            config,
            conn: Mutex::new(Some(Connection::new(stream, config.buffer_size, id))),
            state: Mutex::new(SessionState::Created),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            probe,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Attach `handler` and spawn the read loop.
    ///
    /// A session starts at most once; later calls fail with
    /// [`SessionError::AlreadyStarted`] and leave the running loop alone.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn start(
        self: &Arc<Self>,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<SessionTask, SessionError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyStarted);
        }

        let conn = lock(&self.conn).take().ok_or(SessionError::Disposed)?;

        self.running.store(true, Ordering::Release);
        self.set_state(SessionState::Running);

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.run(conn, handler).await });

        Ok(SessionTask { handle })
    }

    /// Stop the session and release its connection.
    ///
    /// Idempotent: returns `true` only for the call that performed the
    /// transition. A running loop notices at its next iteration or liveness
    /// probe and tears down on its own task; a session that was never started
    /// is released here.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let conn = lock(&self.conn).take();
        if let Some(conn) = conn {
            drop(conn);
            self.running.store(false, Ordering::Release);
            self.set_state(SessionState::Stopped(StopReason::Disposed));
            debug!(session = self.id, peer = %self.peer_addr, "Session disposed before start");
        }

        true
    }

    async fn run(
        self: Arc<Self>,
        conn: Connection,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<StopReason, SessionError> {
        debug!(session = self.id, peer = %self.peer_addr, "Session started");

        // Declared before `conn` so an unwind drops the connection first.
        let mut guard = RunGuard {
            session: &self,
            armed: true,
        };
        let mut conn = conn;

        let result = self.recv_loop(&mut conn, handler.as_ref()).await;

        // Teardown: clears the buffer, shuts the socket down, closes it.
        drop(conn);

        guard.armed = false;
        self.finish(result)
    }

    async fn recv_loop(
        &self,
        conn: &mut Connection,
        handler: &dyn PacketHandler,
    ) -> Result<StopReason, SessionError> {
        let buffer = &mut conn.buffer;
        let (mut reader, writer) = conn.stream.split();

        while !self.disposed.load(Ordering::Acquire) {
            if !buffer.is_writable() {
                buffer.unwind()?;
            }

            let received = match self
                .recv(&mut reader, &writer, buffer.writable_mut())
                .await?
            {
                Recv::Data(0) => return Ok(StopReason::GracefulClose),
                Recv::Data(n) => n,
                Recv::Stopped(reason) => return Ok(reason),
            };

            buffer.write(received);
            trace!(
                session = self.id,
                received,
                readable = buffer.readable_space(),
                "Received"
            );

            drain(buffer, handler)?;
        }

        Ok(StopReason::Disposed)
    }

    /// Read into `dst`, probing the connection every liveness interval.
    ///
    /// The read future is pinned once and polled again after each probe, so
    /// bytes that arrive during a probe are never lost.
    async fn recv(
        &self,
        reader: &mut ReadHalf<'_>,
        writer: &WriteHalf<'_>,
        dst: &mut [u8],
    ) -> io::Result<Recv> {
        let read = reader.read(dst);
        tokio::pin!(read);

        loop {
            tokio::select! {
                biased;

                res = &mut read => return res.map(Recv::Data),

                _ = tokio::time::sleep(self.config.liveness_timeout) => {
                    if self.disposed.load(Ordering::Acquire) {
                        return Ok(Recv::Stopped(StopReason::Disposed));
                    }
                    if !(self.probe)(writer.as_ref()) {
                        debug!(session = self.id, "Liveness timeout, disconnected");
                        return Ok(Recv::Stopped(StopReason::Timeout));
                    }
                    trace!(session = self.id, "Liveness timeout, still connected");
                }
            }
        }
    }

    fn finish(
        &self,
        result: Result<StopReason, SessionError>,
    ) -> Result<StopReason, SessionError> {
        let reason = match &result {
            Ok(reason) => *reason,
            Err(e) => e.stop_reason().unwrap_or(StopReason::IoError),
        };

        match &result {
            Ok(_) => info!(session = self.id, peer = %self.peer_addr, ?reason, "Session ended"),
            Err(SessionError::Io(e)) => {
                debug!(session = self.id, peer = %self.peer_addr, error = %e, "Session I/O error")
            }
            Err(e) => {
                error!(session = self.id, peer = %self.peer_addr, error = %e, "Session failed")
            }
        }

        self.mark_stopped(reason);
        result
    }

    fn mark_stopped(&self, reason: StopReason) {
        self.running.store(false, Ordering::Release);
        self.disposed.store(true, Ordering::Release);
        self.set_state(SessionState::Stopped(reason));
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }
}

/// Records the terminal state when the read loop never reaches `finish`:
/// a panicking handler, or the task being dropped by the runtime.
struct RunGuard<'a> {
    session: &'a Session,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let session = self.session;
        let reason = if std::thread::panicking() {
            error!(session = session.id, peer = %session.peer_addr, "Packet handler panicked");
            StopReason::HandlerFault
        } else {
            debug!(session = session.id, peer = %session.peer_addr, "Session task dropped");
            StopReason::Disposed
        };
        session.mark_stopped(reason);
    }
}

enum Recv {
    Data(usize),
    Stopped(StopReason),
}

/// Offer the readable region to `handler` until it reports no progress.
pub(crate) fn drain(
    buffer: &mut RecvBuffer,
    handler: &dyn PacketHandler,
) -> Result<(), SessionError> {
    loop {
        let available = buffer.readable_space();
        let processed = handler
            .handle(buffer.readable())
            .map_err(SessionError::HandlerFault)?;

        if processed == 0 {
            return Ok(());
        }
        if processed > available {
            return Err(SessionError::HandlerOverrun {
                processed,
                available,
            });
        }

        buffer.read(processed);
    }
}

/// Handle to a running session task.
#[derive(Debug)]
pub struct SessionTask {
    handle: JoinHandle<Result<StopReason, SessionError>>,
}

impl SessionTask {
    /// Wait for the session to stop.
    ///
    /// A panic inside the packet handler is resumed on the caller.
    pub async fn join(self) -> Result<StopReason, SessionError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(e) => Err(SessionError::Io(io::Error::other(e))),
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
