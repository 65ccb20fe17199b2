//! Bounded byte history of a session's output, replayed to reattaching clients.

use std::collections::VecDeque;

/// Default per-session scrollback capacity in bytes.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 64 * 1024;

/// A fixed-capacity byte ring. Once full, the oldest bytes are discarded.
///
/// The buffer stores raw PTY output and never interprets it, so a snapshot
/// may begin in the middle of an escape sequence or a UTF-8 code point.
#[derive(Debug, Clone)]
pub struct ScrollbackBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    total_appended: u64,
}

impl ScrollbackBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    ///
    /// A zero capacity is bumped to one byte so the ring is never degenerate.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: VecDeque::with_capacity(capacity.min(DEFAULT_SCROLLBACK_BYTES)),
            capacity,
            total_appended: 0,
        }
    }

    /// Append output, evicting from the front when the ring overflows.
    pub fn append(&mut self, data: &[u8]) {
        self.total_appended += data.len() as u64;

        if data.len() >= self.capacity {
            self.bytes.clear();
            self.bytes.extend(&data[data.len() - self.capacity..]);
            return;
        }

        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend(data);
    }

    /// Copy of the retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever appended, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let buf = ScrollbackBuffer::new(16);
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn test_append_below_capacity_keeps_everything() {
        let mut buf = ScrollbackBuffer::new(16);
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.snapshot(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_overflow_discards_oldest() {
        let mut buf = ScrollbackBuffer::new(8);
        buf.append(b"abcdef");
        buf.append(b"ghij");
        assert_eq!(buf.snapshot(), b"cdefghij");
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_single_chunk_larger_than_capacity() {
        let mut buf = ScrollbackBuffer::new(4);
        buf.append(b"xy");
        buf.append(b"0123456789");
        assert_eq!(buf.snapshot(), b"6789");
    }

    #[test]
    fn test_snapshot_is_tail_of_everything_appended() {
        let mut buf = ScrollbackBuffer::new(100);
        let mut all = Vec::new();
        for i in 0..500u32 {
            let chunk = format!("line {i}\r\n");
            all.extend_from_slice(chunk.as_bytes());
            buf.append(chunk.as_bytes());
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 100);
        assert_eq!(snap.as_slice(), &all[all.len() - 100..]);
        assert_eq!(buf.total_appended(), all.len() as u64);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut buf = ScrollbackBuffer::new(8);
        buf.append(b"abc");
        let first = buf.snapshot();
        let second = buf.snapshot();
        assert_eq!(first, second);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buf = ScrollbackBuffer::new(0);
        buf.append(b"abc");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.snapshot(), b"c");
    }

    #[test]
    fn test_default_capacity() {
        let buf = ScrollbackBuffer::default();
        assert_eq!(buf.capacity(), DEFAULT_SCROLLBACK_BYTES);
    }
}
