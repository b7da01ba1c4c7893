//! Length-prefixed text protocol.
//!
//! The reference packet handler: every frame carries one text message.
//!
//! ## Protocol Format
//!
//! ```text
//! +----------------+-------------------+------------------+
//! | frame length   | string length     | UTF-8 bytes      |
//! | u32 LE         | 7-bit varint      | string length    |
//! +----------------+-------------------+------------------+
//!
//! Example ("hello", 10 bytes total):
//! 0a 00 00 00 05 68 65 6c 6c 6f
//! ```
//!
//! The frame length counts the whole frame, its own 4 bytes included. The
//! string length uses 7 bits per byte, least significant group first, with the
//! high bit set on every byte but the last (at most 5 bytes).
//!
//! Clients build a frame by writing a zero length, then the string, then
//! overwriting the length with the final size; [`encode_frame`] does the same.

pub mod handler;
pub mod parser;

pub use handler::LengthPrefixedHandler;
pub use parser::{encode_frame, parse, FrameError, ParseResult};
