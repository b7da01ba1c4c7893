//! Owned connection resources for a session.
//!
//! A `Connection` holds the accepted socket and the session's receive buffer.
//! Teardown is bound to ownership: dropping the connection clears the buffer,
//! shuts both directions of the socket down and closes the handle. Every exit
//! path of a session, including an unwinding panic in a packet handler, goes
//! through `Drop`, so the socket is released exactly once.

use crate::runtime::buffer::RecvBuffer;
use socket2::SockRef;
use std::net::Shutdown;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Socket plus receive buffer owned by one session.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) buffer: RecvBuffer,
    session_id: u64,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, buffer_size: usize, session_id: u64) -> Self {
        Self {
            stream,
            buffer: RecvBuffer::new(buffer_size),
            session_id,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.buffer.clear();

        // Graceful disconnect; the handle itself is closed when `stream` drops.
        match SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            Ok(()) => trace!(session = self.session_id, "Socket shut down"),
            Err(e) => debug!(session = self.session_id, error = %e, "Socket shutdown failed"),
        }
    }
}

/// Probe whether the peer is still attached to `stream`.
///
/// Does not read from the socket, so it is safe to call while a read on the
/// same stream is outstanding.
pub(crate) fn is_connected(stream: &TcpStream) -> bool {
    stream.peer_addr().is_ok()
}
