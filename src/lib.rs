//! asyncer: a minimal TCP session server.
//!
//! Accepted connections become sessions that read into a fixed-size,
//! compacting receive buffer and hand the unread bytes to a pluggable
//! [`PacketHandler`](runtime::PacketHandler), which decides how many bytes
//! form one complete message.

pub mod config;
pub mod protocols;
pub mod runtime;

pub use config::Config;
pub use runtime::{Listener, PacketHandler, Session};
