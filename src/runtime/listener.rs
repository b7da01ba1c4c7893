//! TCP listener that turns accepted connections into sessions.
//!
//! The accept loop runs on its own task. Each accepted connection becomes a
//! [`Session`] that is handed to the caller's `on_create` callback before the
//! next accept, so the callback must stay cheap: attach a handler, call
//! [`Session::start`] (which only spawns) and return.
//!
//! Stopping the listener closes the listening socket. Sessions that are
//! already running are not affected.

use crate::runtime::session::{Session, SessionConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Listener failures.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener is already running")]
    AlreadyRunning,

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Accepts connections and creates sessions.
#[derive(Debug)]
pub struct Listener {
    config: SessionConfig,
    running: AtomicBool,
    /// Wakes the accept loop of the current run.
    shutdown: Mutex<Option<Arc<Notify>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Listener {
    /// Create a stopped listener; sessions it creates use `config`.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the current run is bound to; `None` while stopped.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Bind `addr` and spawn the accept loop.
    ///
    /// Returns as soon as the socket is listening. `on_create` is called on
    /// the accept task for every accepted connection, before that connection
    /// reads anything; it is responsible for starting the session.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn start<F>(
        self: &Arc<Self>,
        addr: SocketAddr,
        on_create: F,
    ) -> Result<ListenerTask, ListenerError>
    where
        F: FnMut(Arc<Session>) + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ListenerError::AlreadyRunning);
        }

        let listener = match bind(addr) {
            Ok(listener) => listener,
            Err(source) => {
                self.running.store(false, Ordering::Release);
                return Err(ListenerError::Bind { addr, source });
            }
        };

        let local_addr = listener.local_addr().unwrap_or(addr);
        let shutdown = Arc::new(Notify::new());
        {
            let mut current = lock(&self.shutdown);
            *current = Some(Arc::clone(&shutdown));
            *lock(&self.local_addr) = Some(local_addr);
        }

        info!(addr = %local_addr, "Listening");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.accept_loop(listener, shutdown, on_create).await;
        });

        Ok(ListenerTask { handle })
    }

    /// Stop accepting connections.
    ///
    /// Idempotent and callable from anywhere; only the call that moves the
    /// listener from running to stopped closes the socket and returns `true`.
    pub fn stop(&self) -> bool {
        let mut current = lock(&self.shutdown);
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }

        self.end_run(&mut current);
        true
    }

    /// Stop only if `run` is still the current run.
    fn stop_run(&self, run: &Arc<Notify>) {
        let mut current = lock(&self.shutdown);
        if !current.as_ref().is_some_and(|c| Arc::ptr_eq(c, run)) {
            return;
        }

        self.running.store(false, Ordering::Release);
        self.end_run(&mut current);
    }

    /// Caller holds the `shutdown` lock; `start` publishes a run under it.
    fn end_run(&self, current: &mut Option<Arc<Notify>>) {
        if let Some(shutdown) = current.take() {
            // `notify_one` stores a permit if the loop is not waiting yet.
            shutdown.notify_one();
        }
        *lock(&self.local_addr) = None;

        info!("Listener stopping");
    }

    async fn accept_loop<F>(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: Arc<Notify>,
        mut on_create: F,
    ) where
        F: FnMut(Arc<Session>) + Send + 'static,
    {
        let _stop = StopOnExit {
            listener: &self,
            run: Arc::clone(&shutdown),
        };

        while self.is_running() {
            let accepted = tokio::select! {
                _ = shutdown.notified() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let session = Session::new(stream, peer, self.config);
                    debug!(session = session.id(), peer = %peer, "Accepted connection");

                    on_create(session);
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, stopping listener");
                    break;
                }
            }
        }

        drop(listener);
        info!("Listener stopped");
    }
}

/// Stops the listener when the accept loop exits, unless a newer run has
/// already replaced this one.
struct StopOnExit<'a> {
    listener: &'a Listener,
    run: Arc<Notify>,
}

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.listener.stop_run(&self.run);
    }
}

/// Handle to the accept loop task.
#[derive(Debug)]
pub struct ListenerTask {
    handle: JoinHandle<()>,
}

impl ListenerTask {
    /// Wait for the accept loop to exit.
    ///
    /// A panic in `on_create` is resumed on the caller.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if let Ok(payload) = e.try_into_panic() {
                std::panic::resume_unwind(payload);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Create a non-blocking listening socket with SO_REUSEADDR.
fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::length_prefixed::{encode_frame, LengthPrefixedHandler};
    use crate::runtime::handler::PacketHandler;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_test::assert_ok;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn recording_handler() -> (Arc<dyn PacketHandler>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = LengthPrefixedHandler::with_sink(move |msg: &str| {
            sink.lock().unwrap().push(msg.to_string());
        });
        (Arc::new(handler), seen)
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {count} messages");
    }

    #[tokio::test]
    async fn test_accepts_and_starts_sessions() {
        let listener = Listener::new(SessionConfig::default());
        let (handler, seen) = recording_handler();

        let task = assert_ok!(listener.start(loopback(), move |session| {
            session.start(Arc::clone(&handler)).unwrap();
        }));
        let addr = listener.local_addr().unwrap();
        assert!(listener.is_running());

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(&encode_frame("from a")).await.unwrap();
        wait_for(&seen, 1).await;
        b.write_all(&encode_frame("from b")).await.unwrap();
        wait_for(&seen, 2).await;

        assert_eq!(*seen.lock().unwrap(), vec!["from a", "from b"]);

        assert!(listener.stop());
        task.join().await;
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let listener = Listener::new(SessionConfig::default());

        let task = assert_ok!(listener.start(loopback(), |_session| {}));
        let second = listener.start(loopback(), |_session| {});
        assert!(matches!(second, Err(ListenerError::AlreadyRunning)));

        assert!(listener.stop());
        task.join().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let listener = Listener::new(SessionConfig::default());
        assert!(!listener.stop());

        let task = assert_ok!(listener.start(loopback(), |_session| {}));
        assert!(listener.stop());
        assert!(!listener.stop());

        task.join().await;
        assert!(!listener.is_running());
        assert!(!listener.stop());
    }

    #[tokio::test]
    async fn test_concurrent_stop_transitions_once() {
        let listener = Listener::new(SessionConfig::default());
        let task = assert_ok!(listener.start(loopback(), |_session| {}));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let listener = Arc::clone(&listener);
            handles.push(tokio::spawn(async move { listener.stop() }));
        }

        let mut transitions = 0;
        for handle in handles {
            if handle.await.unwrap() {
                transitions += 1;
            }
        }

        assert_eq!(transitions, 1);
        task.join().await;
    }

    #[tokio::test]
    async fn test_stop_closes_socket_but_keeps_sessions() {
        let listener = Listener::new(SessionConfig::default());
        let (handler, seen) = recording_handler();

        let task = assert_ok!(listener.start(loopback(), move |session| {
            session.start(Arc::clone(&handler)).unwrap();
        }));
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&encode_frame("before")).await.unwrap();
        wait_for(&seen, 1).await;

        assert!(listener.stop());
        assert_eq!(listener.local_addr(), None);
        task.join().await;

        assert!(TcpStream::connect(addr).await.is_err());

        client.write_all(&encode_frame("after")).await.unwrap();
        wait_for(&seen, 2).await;
        assert_eq!(*seen.lock().unwrap(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_bind_failure_releases_run_flag() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let listener = Listener::new(SessionConfig::default());
        let result = listener.start(addr, |_session| {});

        assert!(matches!(result, Err(ListenerError::Bind { .. })));
        assert!(!listener.is_running());

        // A later start on a free port still works.
        let task = assert_ok!(listener.start(loopback(), |_session| {}));
        assert!(listener.stop());
        task.join().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let listener = Listener::new(SessionConfig::default());

        let first = assert_ok!(listener.start(loopback(), |_session| {}));
        assert!(listener.stop());
        first.join().await;

        let second = assert_ok!(listener.start(loopback(), |_session| {}));
        assert!(listener.is_running());
        assert!(!second.is_finished());
        assert!(listener.stop());
        second.join().await;
    }

    #[tokio::test]
    async fn test_restart_before_old_loop_exits() {
        let listener = Listener::new(SessionConfig::default());

        let first = assert_ok!(listener.start(loopback(), |_session| {}));
        assert!(listener.stop());
        let second = assert_ok!(listener.start(loopback(), |_session| {}));
        let addr = listener.local_addr().unwrap();

        // The old loop winds down after the new run is live.
        first.join().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(listener.is_running());
        assert!(!second.is_finished());
        assert_eq!(listener.local_addr(), Some(addr));
        assert_ok!(TcpStream::connect(addr).await);

        assert!(listener.stop());
        second.join().await;
        assert!(!listener.is_running());
    }
}
