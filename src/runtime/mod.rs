//! Session I/O core.
//!
//! - `RecvBuffer`: fixed-capacity receive buffer with read/write cursors
//! - `PacketHandler`: contract for delimiting and consuming messages
//! - `Session`: per-connection read loop with liveness probing
//! - `Listener`: accept loop that creates sessions
//!
//! Each session runs on its own Tokio task and owns its socket and buffer;
//! nothing is shared between sessions except the handler.

pub mod buffer;
mod connection;
pub mod handler;
pub mod listener;
pub mod session;

pub use buffer::{BufferExhausted, RecvBuffer};
pub use handler::{HandlerError, PacketHandler};
pub use listener::{Listener, ListenerError, ListenerTask};
pub use session::{Session, SessionConfig, SessionError, SessionState, SessionTask, StopReason};
