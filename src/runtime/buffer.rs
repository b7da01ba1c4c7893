//! Fixed-capacity receive buffer.
//!
//! Network input is accumulated at the tail (`write_offset`) and consumed from
//! the head (`read_offset`). The packet handler always sees one flat,
//! contiguous region, so framing code never has to deal with wraparound.
//!
//! When the tail is full, `unwind` copies the unread bytes back to offset 0.
//! Capacity is fixed: a single message larger than the buffer can never be
//! completed, and `unwind` reports that as `BufferExhausted`.

use thiserror::Error;

/// Default capacity of a session receive buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Returned by [`RecvBuffer::unwind`] when compaction frees no space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("receive buffer exhausted: unread data fills all {capacity} bytes")]
pub struct BufferExhausted {
    pub capacity: usize,
}

/// Receive buffer with read/write cursors.
///
/// Invariant: `0 <= read_offset <= write_offset <= capacity`.
#[derive(Debug)]
pub struct RecvBuffer {
    storage: Box<[u8]>,
    read_offset: usize,
    write_offset: usize,
}

impl RecvBuffer {
    /// Create an empty buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            read_offset: 0,
            write_offset: 0,
        }
    }

    /// Total size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Index of the first unconsumed byte.
    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    /// Index one past the last received byte.
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    /// Bytes received but not yet consumed.
    pub fn readable_space(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Free bytes at the tail.
    pub fn writable_space(&self) -> usize {
        self.storage.len() - self.write_offset
    }

    pub fn is_writable(&self) -> bool {
        self.writable_space() > 0
    }

    /// The unread region `[read_offset, write_offset)`.
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read_offset..self.write_offset]
    }

    /// The free tail `[write_offset, capacity)`, target of the next receive.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_offset..]
    }

    /// Record that `n` bytes were placed at the previous `write_offset`.
    ///
    /// # Panics
    /// Panics if `n` exceeds the writable space (debug builds only).
    pub fn write(&mut self, n: usize) {
        debug_assert!(n <= self.writable_space(), "write past capacity");
        self.write_offset += n;
    }

    /// Record that `n` bytes starting at `read_offset` were consumed.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable space (debug builds only).
    pub fn read(&mut self, n: usize) {
        debug_assert!(n <= self.readable_space(), "read past write offset");
        self.read_offset += n;
    }

    /// Move the unread region to the start of the storage.
    ///
    /// Fails if the buffer is still full afterwards, i.e. the unread bytes
    /// alone occupy the whole capacity.
    pub fn unwind(&mut self) -> Result<(), BufferExhausted> {
        if self.read_offset > 0 {
            self.storage
                .copy_within(self.read_offset..self.write_offset, 0);
            self.write_offset -= self.read_offset;
            self.read_offset = 0;
        }

        if self.is_writable() {
            Ok(())
        } else {
            Err(BufferExhausted {
                capacity: self.capacity(),
            })
        }
    }

    /// Reset both cursors without touching the storage.
    pub fn clear(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut RecvBuffer, data: &[u8]) {
        buf.writable_mut()[..data.len()].copy_from_slice(data);
        buf.write(data.len());
    }

    fn assert_invariant(buf: &RecvBuffer) {
        assert!(buf.read_offset() <= buf.write_offset());
        assert!(buf.write_offset() <= buf.capacity());
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = RecvBuffer::new(16);

        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.readable_space(), 0);
        assert_eq!(buf.writable_space(), 16);
        assert!(buf.is_writable());
        assert!(buf.readable().is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let mut buf = RecvBuffer::new(16);

        fill(&mut buf, b"hello world");
        assert_eq!(buf.readable(), b"hello world");
        assert_eq!(buf.writable_space(), 5);

        buf.read(6);
        assert_eq!(buf.readable(), b"world");
        assert_eq!(buf.read_offset(), 6);
        assert_eq!(buf.write_offset(), 11);
    }

    #[test]
    fn test_invariant_holds_over_mixed_operations() {
        let mut buf = RecvBuffer::new(8);
        let chunks: [&[u8]; 5] = [b"abc", b"de", b"fgh", b"ij", b"k"];
        let reads = [2usize, 0, 4, 1, 3];

        for (chunk, consumed) in chunks.iter().zip(reads) {
            if buf.writable_space() < chunk.len() {
                buf.unwind().unwrap();
                assert_invariant(&buf);
            }
            fill(&mut buf, chunk);
            assert_invariant(&buf);

            let consumed = consumed.min(buf.readable_space());
            buf.read(consumed);
            assert_invariant(&buf);
        }
    }

    #[test]
    fn test_unwind_preserves_readable_region() {
        let mut buf = RecvBuffer::new(8);
        fill(&mut buf, b"12345678");
        buf.read(5);
        assert!(!buf.is_writable());

        buf.unwind().unwrap();

        assert_eq!(buf.read_offset(), 0);
        assert_eq!(buf.write_offset(), 3);
        assert_eq!(buf.readable_space(), 3);
        assert_eq!(buf.readable(), b"678");
        assert_eq!(buf.writable_space(), 5);
    }

    #[test]
    fn test_unwind_when_everything_consumed() {
        let mut buf = RecvBuffer::new(4);
        fill(&mut buf, b"abcd");
        buf.read(4);

        buf.unwind().unwrap();
        assert_eq!(buf.readable_space(), 0);
        assert_eq!(buf.writable_space(), 4);
    }

    #[test]
    fn test_unwind_full_of_unread_data_is_exhausted() {
        let mut buf = RecvBuffer::new(4);
        fill(&mut buf, b"abcd");

        assert_eq!(buf.unwind(), Err(BufferExhausted { capacity: 4 }));
        // Nothing was lost.
        assert_eq!(buf.readable(), b"abcd");
    }

    #[test]
    fn test_clear_resets_cursors() {
        let mut buf = RecvBuffer::new(8);
        fill(&mut buf, b"abcdef");
        buf.read(2);

        buf.clear();
        assert_eq!(buf.read_offset(), 0);
        assert_eq!(buf.write_offset(), 0);
        assert_eq!(buf.writable_space(), 8);
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(RecvBuffer::default().capacity(), DEFAULT_CAPACITY);
    }
}
