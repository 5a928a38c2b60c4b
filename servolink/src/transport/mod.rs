//! Physical transport layer for device connections.
//!
//! This module handles the low-level channel to the motor controller. Two
//! interchangeable transports exist: a direct serial port
//! ([`SerialTransport`]) and a bridge to an external listener process that
//! tunnels a USB packet interface into a line protocol
//! ([`BridgedTransport`]). Which one a session uses is a configuration
//! choice, not a compile-time one, so both can live in the same binary and
//! the same test suite.
//!
//! All inbound bytes pass through the sideband framer before being handed
//! back as text; extracted payloads queue separately and are drained via
//! [`TransportPort::collect_sideband`].

pub mod bridge;
pub mod serial;

pub use bridge::BridgedTransport;
pub use serial::SerialTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::TransportError;
use crate::sideband::SidebandConfig;

/// Which concrete transport a channel runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Point-to-point serial link, synchronous reads.
    Serial,
    /// External listener process speaking the line protocol.
    Bridged,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Bridged => "bridged",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tagged data stream understood by the listener process (the firmware's
/// packet_type), used for stream capture and console echo commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamId(pub u8);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a transport can do beyond raw bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Sideband payloads are framed inline from the byte stream.
    pub inline_sideband: bool,
    /// Tagged streams can be recorded to files / echoed by the link itself.
    pub stream_capture: bool,
}

/// Immutable snapshot of an addressable endpoint.
///
/// Descriptors carry no persistent identity: re-enumeration may renumber.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortDescriptor {
    /// Endpoint identifier to pass to `open` (port name or listener index).
    pub identifier: String,
    /// Human-readable description.
    pub description: String,
    /// Where the endpoint lives (bus position, device path), best effort.
    pub location: String,
}

/// Uniform contract for a device channel.
///
/// One open port per physical/process endpoint at a time; opening an
/// already-open port is rejected with [`TransportError::AlreadyOpen`]
/// rather than silently replacing the channel. Writing or reading while
/// closed is an error, never a silent drop.
#[async_trait]
pub trait TransportPort: Send {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Capability query for sideband / stream-recording support.
    fn capabilities(&self) -> Capabilities;

    /// List addressable endpoints, sorted by identifier.
    async fn enumerate(&mut self) -> Result<Vec<PortDescriptor>, TransportError>;

    /// Configure and open the channel. Clears any stale accumulator and
    /// sideband state from a previous open.
    async fn open(
        &mut self,
        endpoint: &str,
        baud: u32,
        sideband: SidebandConfig,
    ) -> Result<(), TransportError>;

    /// Release the channel. Safe to call when not open.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Raw byte write to the device.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Return whatever is currently buffered, framed, without blocking
    /// beyond a minimal poll. May be empty.
    async fn read_available(&mut self) -> Result<Bytes, TransportError>;

    /// Wait up to `budget` for at least one byte, then return whatever is
    /// buffered, framed. Returns empty bytes when nothing arrived in time.
    async fn read_for(&mut self, budget: Duration) -> Result<Bytes, TransportError>;

    /// Next newline-delimited record, scanned through the sideband framer.
    /// Fails with [`TransportError::LineTimeout`] when no complete line
    /// arrives within `timeout`; never returns a partial line.
    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// Atomically drain the extracted sideband payloads, oldest first.
    fn collect_sideband(&mut self) -> Vec<Bytes>;

    /// Start recording a tagged stream to `path` (bridged only).
    async fn capture_start(
        &mut self,
        stream: StreamId,
        path: &Path,
    ) -> Result<(), TransportError> {
        let _ = (stream, path);
        Err(TransportError::Unsupported(self.kind().name()))
    }

    /// Stop recording a tagged stream (bridged only).
    async fn capture_stop(&mut self, stream: StreamId) -> Result<(), TransportError> {
        let _ = stream;
        Err(TransportError::Unsupported(self.kind().name()))
    }

    /// Toggle console echo of a tagged stream (bridged only).
    async fn stream_echo(
        &mut self,
        stream: StreamId,
        enable: bool,
    ) -> Result<(), TransportError> {
        let _ = (stream, enable);
        Err(TransportError::Unsupported(self.kind().name()))
    }
}
