//! Packet handler implementations.
//!
//! - `length_prefixed`: 4-byte length prefix followed by one text message
//!   (the reference handler used by the server binary)

pub mod length_prefixed;
