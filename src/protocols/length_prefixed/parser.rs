//! Length-prefixed frame parser and encoder.

use bytes::{Buf, BufMut, BytesMut};
use std::str::{self, Utf8Error};
use thiserror::Error;

/// Size of the frame length field.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Longest valid 7-bit encoded string length (a 32-bit value).
const MAX_VARINT_BYTES: usize = 5;

/// Malformed frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame length {0} is smaller than the length prefix")]
    LengthTooSmall(usize),

    #[error("malformed string length")]
    MalformedStringLength,

    #[error("string of {string_len} bytes does not fit in a {frame_len} byte frame")]
    StringOverrun { string_len: usize, frame_len: usize },

    #[error("message is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] Utf8Error),
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// A whole frame: the message and the frame length.
    Complete(&'a str, usize),
    /// Need more data.
    Incomplete,
    /// The frame can never be decoded.
    Error(FrameError),
}

/// Parse one frame from the start of `input`.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    if input.len() < LENGTH_PREFIX_SIZE {
        return ParseResult::Incomplete;
    }

    let mut header = &input[..LENGTH_PREFIX_SIZE];
    let frame_len = header.get_u32_le() as usize;

    if frame_len < LENGTH_PREFIX_SIZE {
        return ParseResult::Error(FrameError::LengthTooSmall(frame_len));
    }
    if frame_len > input.len() {
        return ParseResult::Incomplete;
    }

    let body = &input[LENGTH_PREFIX_SIZE..frame_len];
    let (string_len, varint_len) = match read_varint(body) {
        Some(v) => v,
        None => return ParseResult::Error(FrameError::MalformedStringLength),
    };

    let text = match body[varint_len..].get(..string_len) {
        Some(text) => text,
        None => {
            return ParseResult::Error(FrameError::StringOverrun {
                string_len,
                frame_len,
            })
        }
    };

    match str::from_utf8(text) {
        Ok(message) => ParseResult::Complete(message, frame_len),
        Err(e) => ParseResult::Error(e.into()),
    }
}

/// Encode `message` as one frame.
///
/// # Panics
/// Panics if the frame would be longer than `u32::MAX` bytes.
pub fn encode_frame(message: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + MAX_VARINT_BYTES + message.len());

    buf.put_u32_le(0);
    write_varint(&mut buf, message.len());
    buf.extend_from_slice(message.as_bytes());

    let frame_len = buf.len();
    assert!(frame_len <= u32::MAX as usize, "frame too large");
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&(frame_len as u32).to_le_bytes());

    buf
}

/// Decode a 7-bit encoded length. Returns the value and the bytes it used.
fn read_varint(input: &[u8]) -> Option<(usize, usize)> {
    let mut value: u32 = 0;

    for (i, &byte) in input.iter().take(MAX_VARINT_BYTES).enumerate() {
        let group = u32::from(byte & 0x7f);
        if i == MAX_VARINT_BYTES - 1 && (byte & 0x80 != 0 || group > 0x0f) {
            return None;
        }

        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value as usize, i + 1));
        }
    }

    None
}

fn write_varint(buf: &mut BytesMut, mut value: usize) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}
