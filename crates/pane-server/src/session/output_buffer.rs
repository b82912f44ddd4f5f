//! Bounded byte buffer for output produced while no subscriber is attached.
//!
//! Keeps the newest `capacity` bytes. When appending would exceed the
//! capacity the oldest bytes are dropped and the buffer remembers that it
//! was truncated, so the reattaching client can warn that scrollback is
//! incomplete. The retained bytes always stay in emission order.

use std::collections::VecDeque;

/// Buffered bytes handed out at reattach.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferedOutput {
    pub bytes: Vec<u8>,
    /// Whether any bytes were evicted since the buffer was last emptied.
    pub truncated: bool,
}

/// A fixed-capacity, oldest-first-eviction byte buffer.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    truncated: bool,
    /// Bytes evicted since the buffer was last emptied.
    dropped: u64,
}

impl OutputBuffer {
    /// Create an empty buffer that retains at most `capacity` bytes.
    ///
    /// Memory is allocated as output arrives, not up front.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            capacity,
            truncated: false,
            dropped: 0,
        }
    }

    /// Append bytes, evicting the oldest ones if the capacity is exceeded.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.capacity == 0 {
            self.note_dropped(data.len());
            return;
        }

        if data.len() >= self.capacity {
            let skip = data.len() - self.capacity;
            self.note_dropped(self.buf.len() + skip);
            self.buf.clear();
            self.buf.extend(&data[skip..]);
            return;
        }

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.note_dropped(overflow);
        }
        self.buf.extend(data);
    }

    fn note_dropped(&mut self, n: usize) {
        if n > 0 {
            self.truncated = true;
            self.dropped += n as u64;
        }
    }

    /// Remove and return everything buffered, resetting the truncation flag.
    pub fn take(&mut self) -> BufferedOutput {
        let bytes: Vec<u8> = self.buf.drain(..).collect();
        let truncated = std::mem::take(&mut self.truncated);
        self.dropped = 0;
        BufferedOutput { bytes, truncated }
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.truncated = false;
        self.dropped = 0;
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[cfg(test)]
    pub(crate) fn peek(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order_below_capacity() {
        let mut buf = OutputBuffer::new(16);
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.len(), 11);
        assert!(!buf.is_truncated());
        assert_eq!(
            buf.take(),
            BufferedOutput {
                bytes: b"hello world".to_vec(),
                truncated: false
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn evicts_oldest_and_flags_truncation() {
        let mut buf = OutputBuffer::new(5);
        buf.append(b"abcde");
        assert!(!buf.is_truncated(), "filling exactly is not truncation");
        buf.append(b"fg");
        assert!(buf.is_truncated());
        assert_eq!(buf.dropped(), 2);
        let out = buf.take();
        assert_eq!(out.bytes, b"cdefg");
        assert!(out.truncated);
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut buf = OutputBuffer::new(4);
        buf.append(b"xy");
        buf.append(b"0123456789");
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.dropped(), 8);
        assert_eq!(buf.take().bytes, b"6789");
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut buf = OutputBuffer::new(1000);
        let chunk: Vec<u8> = (0..=255u8).collect();
        for _ in 0..100 {
            buf.append(&chunk);
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.len(), 1000);
        let out = buf.take();
        assert!(out.truncated);
        // Newest byte is the last byte of the last chunk, and every retained
        // byte follows its predecessor in the original sequence.
        assert_eq!(*out.bytes.last().unwrap(), 255);
        for pair in out.bytes.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn take_resets_truncation() {
        let mut buf = OutputBuffer::new(2);
        buf.append(b"abc");
        assert!(buf.take().truncated);
        buf.append(b"d");
        assert!(!buf.take().truncated);
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut buf = OutputBuffer::new(0);
        buf.append(b"test");
        assert!(buf.is_empty());
        assert!(buf.is_truncated());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut buf = OutputBuffer::new(3);
        buf.append(b"abcdef");
        buf.clear();
        assert!(buf.is_empty());
        assert!(!buf.is_truncated());
        assert_eq!(buf.dropped(), 0);
    }
}
