//! Inbound byte accumulator.
//!
//! Both transports buffer not-yet-consumed device bytes here. The buffer
//! grows at the tail as reads (or the listener pump) append, and is consumed
//! from the head via `BytesMut::split_to`, so consumed bytes are released
//! without copying the remainder and the read position never rewinds.

use bytes::{Bytes, BytesMut};

/// Growable buffer of inbound bytes, consumed left-to-right.
#[derive(Debug, Default)]
pub struct ByteAccumulator {
    buf: BytesMut,
}

impl ByteAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes at the tail.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether a complete line is waiting.
    pub fn has_line(&self) -> bool {
        self.buf.contains(&b'\n')
    }

    /// Take the next newline-terminated record, without the newline. The
    /// newline itself is consumed. Returns None when no complete line is
    /// buffered yet.
    pub fn take_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos).freeze();
        let _ = self.buf.split_to(1);
        Some(line)
    }

    /// Take everything currently buffered.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Take the first `n` buffered bytes.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// View the buffered bytes without consuming them.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop all buffered bytes (a fresh Open starts clean).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_line_consumes_newline() {
        let mut acc = ByteAccumulator::new();
        acc.push(b"one\ntwo\nthree");
        assert_eq!(acc.take_line().unwrap().as_ref(), b"one");
        assert_eq!(acc.take_line().unwrap().as_ref(), b"two");
        assert!(acc.take_line().is_none());
        assert_eq!(acc.take_all().as_ref(), b"three");
        assert!(acc.is_empty());
    }

    #[test]
    fn partial_line_defers_until_newline_arrives() {
        let mut acc = ByteAccumulator::new();
        acc.push(b"par");
        assert!(!acc.has_line());
        assert!(acc.take_line().is_none());
        acc.push(b"tial\n");
        assert_eq!(acc.take_line().unwrap().as_ref(), b"partial");
    }

    #[test]
    fn empty_line_is_a_record() {
        let mut acc = ByteAccumulator::new();
        acc.push(b"\nrest");
        assert_eq!(acc.take_line().unwrap().as_ref(), b"");
        assert_eq!(acc.take_all().as_ref(), b"rest");
    }
}
