//! Sideband channel framing.
//!
//! Motor-controller firmware multiplexes a secondary binary telemetry
//! channel inline with its textual console output: an escape marker
//! followed by a fixed-length payload. The framer splices those sequences
//! out of the byte stream, queueing the payloads for streaming consumers,
//! and hands the cleaned text back to the caller.
//!
//! A marker whose payload has not fully arrived yet is left untouched at
//! the tail of the returned bytes; the transport holds the tail and feeds
//! it back through once more bytes arrive, so a payload is never truncated
//! by a read boundary.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use crate::tracing::prelude::*;

/// Sideband extraction settings, fixed at Open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandConfig {
    /// Escape marker bytes. Empty disables extraction entirely.
    pub marker: Bytes,
    /// Exact payload length following each marker.
    pub payload_len: usize,
}

impl SidebandConfig {
    /// Extraction disabled; the framer becomes a passthrough.
    pub fn disabled() -> Self {
        Self {
            marker: Bytes::new(),
            payload_len: 0,
        }
    }

    pub fn new(marker: impl Into<Bytes>, payload_len: usize) -> Self {
        Self {
            marker: marker.into(),
            payload_len,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.marker.is_empty()
    }
}

impl Default for SidebandConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Stateful scanner that extracts sideband payloads from a byte stream.
#[derive(Debug)]
pub struct SidebandFramer {
    config: SidebandConfig,
    queue: VecDeque<Bytes>,
}

impl SidebandFramer {
    pub fn new(config: SidebandConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Number of extracted payloads waiting to be collected.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Splice all complete marker+payload sequences out of `input`,
    /// queueing each payload, and return the cleaned remainder.
    ///
    /// A marker within `payload_len` bytes of the end is incomplete: it is
    /// returned in place (not truncated) so the caller can retry after
    /// more bytes arrive. On marker-free input this is the identity and
    /// the queue is untouched.
    pub fn frame(&mut self, input: &[u8]) -> BytesMut {
        if !self.config.is_enabled() {
            return BytesMut::from(input);
        }

        let marker = &self.config.marker;
        let mut out = BytesMut::with_capacity(input.len());
        let mut rest = input;

        while let Some(i) = find(rest, marker) {
            let payload_start = i + marker.len();
            if rest.len() < payload_start + self.config.payload_len {
                // Incomplete payload at the tail: defer, don't truncate.
                break;
            }
            let payload_end = payload_start + self.config.payload_len;
            out.extend_from_slice(&rest[..i]);
            let payload = Bytes::copy_from_slice(&rest[payload_start..payload_end]);
            trace!(payload = %hex::encode(&payload), "Sideband payload extracted.");
            self.queue.push_back(payload);
            rest = &rest[payload_end..];
        }

        out.extend_from_slice(rest);
        out
    }

    /// Whether `data` ends inside an unfinished marker+payload sequence.
    ///
    /// Used by the serial transport's line policy: a line for which this
    /// holds must not be delivered until the next line has been appended.
    pub fn ends_mid_payload(&self, data: &[u8]) -> bool {
        self.open_tail_start(data).is_some()
    }

    /// Offset where an unfinished marker+payload sequence begins, if `data`
    /// ends inside one. Bytes before the offset frame cleanly; a transport
    /// can deliver them and keep the tail buffered for reassembly.
    pub fn open_tail_start(&self, data: &[u8]) -> Option<usize> {
        if !self.config.is_enabled() {
            return None;
        }

        let marker = &self.config.marker;
        let mut consumed = 0;
        while let Some(i) = find(&data[consumed..], marker) {
            let payload_start = consumed + i + marker.len();
            if data.len() < payload_start + self.config.payload_len {
                return Some(consumed + i);
            }
            consumed = payload_start + self.config.payload_len;
        }
        None
    }

    /// Atomically drain the payload queue, oldest first. Payloads are
    /// never re-delivered.
    pub fn collect(&mut self) -> Vec<Bytes> {
        self.queue.drain(..).collect()
    }

    /// Discard queued payloads (a fresh Open starts clean).
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
