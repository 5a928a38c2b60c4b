//! Bridged transport via an external listener process.
//!
//! The listener bridges the controller's USB packet interface into a
//! line-oriented text protocol on its stdio. Outbound commands are single
//! ASCII lines:
//!
//! - `i` — enumerate endpoints
//! - `n <id>` — open endpoint `<id>`
//! - `c` — close the endpoint
//! - `q` — quit the listener
//! - `>` + payload — write payload to the device
//! - `p <stream> <file>` — start recording a tagged stream to a file
//! - `p <stream>` — stop recording that stream
//! - `d <stream> on|off` — toggle console echo of a tagged stream
//!
//! Inbound bytes arrive asynchronously: a pump task appends listener
//! stdout to a shared accumulator and signals a notifier. `read_line` is
//! therefore bounded polling (look for a newline, wait a short slice for
//! more bytes, retry), with the worst case capped by the caller's timeout.
//!
//! Sideband framing is normally disabled here; the listener itself
//! records tagged streams via the `p`/`d` commands instead of
//! interleaving them inline.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::accumulator::ByteAccumulator;
use crate::error::TransportError;
use crate::sideband::{SidebandConfig, SidebandFramer};
use crate::tracing::prelude::*;
use crate::transport::{Capabilities, PortDescriptor, StreamId, TransportKind, TransportPort};

/// Polling slice while waiting for listener output.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Default line timeout: 50 slices of 50 ms.
pub const LINE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Endpoint listing stops after this many lines if the listener never
/// sends a terminator.
const MAX_LISTING_LINES: usize = 10;

/// How long to wait for the listener's boot banner after spawning.
const BOOT_WAIT: Duration = Duration::from_millis(300);

/// State shared with the pump task. The accumulator is written by the
/// pump and read by request-issuing code, so it sits behind a mutex even
/// though the consumer side is single-owner.
struct Shared {
    acc: Mutex<ByteAccumulator>,
    bytes_arrived: Notify,
    eof: AtomicBool,
}

/// Bridged implementation of [`TransportPort`].
///
/// Construction connects to the listener ([`spawn`](Self::spawn) a child
/// process, or [`from_io`](Self::from_io) for an already-running listener
/// reachable over arbitrary byte streams). `open` then selects a device
/// endpoint over the established connection.
pub struct BridgedTransport {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    shared: Arc<Shared>,
    framer: SidebandFramer,
    endpoint: Option<String>,
    shutdown: CancellationToken,
    child: Option<Child>,
}

impl BridgedTransport {
    /// Start the listener process and wait for its boot banner.
    pub async fn spawn(program: &str) -> Result<Self, TransportError> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Listener(format!("failed to start {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Listener("listener has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Listener("listener has no stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        let mut transport = Self::from_io(stdout, stdin);
        transport.child = Some(child);

        let banner = transport.read_for(BOOT_WAIT).await?;
        if !banner.is_empty() {
            info!(banner = %String::from_utf8_lossy(&banner).trim_end(), "Listener started.");
        } else {
            info!("Listener started (no banner).");
        }
        Ok(transport)
    }

    /// Connect to an already-running listener over arbitrary byte
    /// streams (a socket, an ssh channel, a test harness).
    pub fn from_io(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            acc: Mutex::new(ByteAccumulator::new()),
            bytes_arrived: Notify::new(),
            eof: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(pump(reader, Arc::clone(&shared), shutdown.clone()));

        Self {
            stdin: Box::new(writer),
            shared,
            framer: SidebandFramer::new(SidebandConfig::disabled()),
            endpoint: None,
            shutdown,
            child: None,
        }
    }

    /// Ask the listener to quit, then reap it.
    pub async fn quit(mut self) {
        let _ = self.send_command("q").await;
        if let Some(mut child) = self.child.take() {
            match time::timeout(Duration::from_millis(100), child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Listener exited."),
                _ => {
                    warn!("Listener did not exit on quit; killing.");
                    let _ = child.kill().await;
                }
            }
        }
        self.shutdown.cancel();
    }

    /// Send one newline-terminated command line to the listener.
    async fn send_command(&mut self, line: &str) -> Result<(), TransportError> {
        if self.shared.eof.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        trace!(command = %line, "To listener.");
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Take the framable prefix of the accumulator through the framer.
    fn drain_framed(&mut self) -> Bytes {
        let mut acc = self.shared.acc.lock();
        let clean_end = self
            .framer
            .open_tail_start(acc.as_slice())
            .unwrap_or_else(|| acc.len());
        let raw = acc.take(clean_end);
        drop(acc);
        self.framer.frame(&raw).freeze()
    }
}

impl Drop for BridgedTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Pump task: append listener stdout to the shared accumulator and wake
/// any poller. Single producer by construction.
async fn pump(
    mut reader: impl AsyncRead + Send + Unpin,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Listener stdout closed.");
                    shared.eof.store(true, Ordering::Release);
                    shared.bytes_arrived.notify_one();
                    break;
                }
                Ok(n) => {
                    shared.acc.lock().push(&buf[..n]);
                    shared.bytes_arrived.notify_one();
                }
                Err(e) => {
                    warn!(error = %e, "Listener stdout read failed.");
                    shared.eof.store(true, Ordering::Release);
                    shared.bytes_arrived.notify_one();
                    break;
                }
            },
        }
    }
}

/// Forward listener stderr to the log.
async fn log_stderr(stderr: impl AsyncRead + Send + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(listener = %line, "Listener stderr.");
    }
}

#[async_trait]
impl TransportPort for BridgedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bridged
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            inline_sideband: false,
            stream_capture: true,
        }
    }

    /// Drive the `i` command. The listener does not terminate the listing
    /// explicitly, so stop at the first non-2-character line or after 10
    /// lines, whichever comes first.
    async fn enumerate(&mut self) -> Result<Vec<PortDescriptor>, TransportError> {
        // Push any stale chatter to the log first so it is not mistaken
        // for a listing entry.
        let stale = self.read_for(POLL_SLICE).await?;
        if !stale.is_empty() {
            debug!(text = %String::from_utf8_lossy(&stale), "Drained stale listener output.");
        }

        self.send_command("i").await?;

        let mut ports = Vec::new();
        for _ in 0..MAX_LISTING_LINES {
            match self.read_line(LINE_TIMEOUT).await {
                Ok(line) if line.len() == 2 => ports.push(PortDescriptor {
                    identifier: line,
                    description: "listener endpoint".into(),
                    location: String::new(),
                }),
                Ok(line) if line.len() > 2 => {
                    trace!(line = %line, "End of endpoint listing.");
                    break;
                }
                Ok(line) => {
                    debug!(line = %line, "Skipping malformed listing entry.");
                }
                Err(TransportError::LineTimeout) => {
                    warn!("Timed out waiting for endpoint listing.");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        ports.sort();
        Ok(ports)
    }

    async fn open(
        &mut self,
        endpoint: &str,
        _baud: u32,
        sideband: SidebandConfig,
    ) -> Result<(), TransportError> {
        if let Some(open) = &self.endpoint {
            return Err(TransportError::AlreadyOpen(open.clone()));
        }

        self.send_command(&format!("n {endpoint}")).await?;
        // The listener does not acknowledge the open; a failed endpoint
        // shows up as silence on the first exchange.
        self.shared.acc.lock().clear();
        self.framer = SidebandFramer::new(sideband);
        self.endpoint = Some(endpoint.to_string());
        info!(endpoint = %endpoint, "Listener endpoint opened.");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            if self.send_command("c").await.is_err() {
                warn!(endpoint = %endpoint, "Listener gone while closing endpoint.");
            }
            info!(endpoint = %endpoint, "Listener endpoint closed.");
        }
    }

    fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.endpoint.is_none() {
            return Err(TransportError::NotOpen);
        }
        if self.shared.eof.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.stdin.write_all(b">").await?;
        self.stdin.write_all(data).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Bytes, TransportError> {
        if self.shared.eof.load(Ordering::Acquire) && self.shared.acc.lock().is_empty() {
            return Err(TransportError::Closed);
        }
        Ok(self.drain_framed())
    }

    async fn read_for(&mut self, budget: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + budget;
        loop {
            let framable = {
                let acc = self.shared.acc.lock();
                self.framer
                    .open_tail_start(acc.as_slice())
                    .unwrap_or_else(|| acc.len())
            };
            if framable > 0 {
                break;
            }
            if self.shared.eof.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let slice = remaining.min(POLL_SLICE);
            let _ = time::timeout(slice, self.shared.bytes_arrived.notified()).await;
        }
        Ok(self.drain_framed())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let rounds = (timeout.as_millis() / POLL_SLICE.as_millis()).max(1) as usize;
        for _ in 0..rounds {
            if let Some(line) = self.shared.acc.lock().take_line() {
                let framed = self.framer.frame(&line);
                return Ok(String::from_utf8_lossy(&framed).into_owned());
            }
            if self.shared.eof.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let _ = time::timeout(POLL_SLICE, self.shared.bytes_arrived.notified()).await;
        }
        warn!("Timeout waiting for a line from the listener.");
        Err(TransportError::LineTimeout)
    }

    fn collect_sideband(&mut self) -> Vec<Bytes> {
        self.framer.collect()
    }

    async fn capture_start(
        &mut self,
        stream: StreamId,
        path: &Path,
    ) -> Result<(), TransportError> {
        if self.endpoint.is_none() {
            return Err(TransportError::NotOpen);
        }
        self.send_command(&format!("p {stream} {}", path.display()))
            .await?;
        info!(%stream, path = %path.display(), "Stream capture started.");
        Ok(())
    }

    async fn capture_stop(&mut self, stream: StreamId) -> Result<(), TransportError> {
        if self.endpoint.is_none() {
            return Err(TransportError::NotOpen);
        }
        self.send_command(&format!("p {stream}")).await?;
        info!(%stream, "Stream capture stopped.");
        Ok(())
    }

    async fn stream_echo(
        &mut self,
        stream: StreamId,
        enable: bool,
    ) -> Result<(), TransportError> {
        if self.endpoint.is_none() {
            return Err(TransportError::NotOpen);
        }
        let state = if enable { "on" } else { "off" };
        self.send_command(&format!("d {stream} {state}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// Split a duplex into a transport plus the fake listener's half.
    fn harness() -> (BridgedTransport, DuplexStream) {
        let (ours, theirs) = duplex(4096);
        let (read, write) = tokio::io::split(ours);
        (BridgedTransport::from_io(read, write), theirs)
    }

    async fn read_exactly(io: &mut DuplexStream, expect: &[u8]) {
        let mut buf = vec![0u8; expect.len()];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expect);
    }

    #[tokio::test]
    async fn enumerate_stops_at_non_two_character_line() {
        let (mut transport, mut listener) = harness();

        let responder = tokio::spawn(async move {
            read_exactly(&mut listener, b"i\n").await;
            listener.write_all(b"bb\naa\nccc\n").await.unwrap();
            listener
        });

        let ports = transport.enumerate().await.unwrap();
        let ids: Vec<&str> = ports.iter().map(|p| p.identifier.as_str()).collect();
        assert_eq!(ids, ["aa", "bb"]); // two entries, sorted
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn enumerate_skips_short_entries() {
        let (mut transport, mut listener) = harness();

        let responder = tokio::spawn(async move {
            read_exactly(&mut listener, b"i\n").await;
            listener.write_all(b"aa\n\nx\nbb\nend\n").await.unwrap();
            listener
        });

        let ports = transport.enumerate().await.unwrap();
        let ids: Vec<&str> = ports.iter().map(|p| p.identifier.as_str()).collect();
        assert_eq!(ids, ["aa", "bb"]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn open_write_close_speak_the_line_protocol() {
        let (mut transport, mut listener) = harness();

        assert!(!transport.is_open());
        transport
            .open("0", 0, SidebandConfig::disabled())
            .await
            .unwrap();
        assert!(transport.is_open());
        read_exactly(&mut listener, b"n 0\n").await;

        transport.write(b"gp").await.unwrap();
        read_exactly(&mut listener, b">gp\n").await;

        transport.close().await;
        assert!(!transport.is_open());
        read_exactly(&mut listener, b"c\n").await;
    }

    #[tokio::test]
    async fn open_while_open_is_rejected() {
        let (mut transport, _listener) = harness();
        transport
            .open("0", 0, SidebandConfig::disabled())
            .await
            .unwrap();
        let err = transport
            .open("1", 0, SidebandConfig::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AlreadyOpen(id) if id == "0"));
    }

    #[tokio::test]
    async fn write_while_closed_is_an_error() {
        let (mut transport, _listener) = harness();
        let err = transport.write(b"gp").await.unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn read_line_times_out_without_data() {
        let (mut transport, _listener) = harness();
        let err = transport.read_line(LINE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, TransportError::LineTimeout));
    }

    #[tokio::test]
    async fn read_line_returns_buffered_lines_in_order() {
        let (mut transport, mut listener) = harness();
        listener.write_all(b"one\ntwo\n").await.unwrap();

        assert_eq!(transport.read_line(LINE_TIMEOUT).await.unwrap(), "one");
        assert_eq!(transport.read_line(LINE_TIMEOUT).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn reads_fail_fast_after_listener_exit() {
        let (mut transport, listener) = harness();
        drop(listener);

        // The pump notices EOF; polling must not run the full timeout.
        let err = transport.read_line(LINE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn capture_commands_require_an_open_endpoint() {
        let (mut transport, mut listener) = harness();
        let err = transport
            .capture_start(StreamId(1), Path::new("hist.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));

        transport
            .open("0", 0, SidebandConfig::disabled())
            .await
            .unwrap();
        read_exactly(&mut listener, b"n 0\n").await;

        transport
            .capture_start(StreamId(1), Path::new("hist.bin"))
            .await
            .unwrap();
        read_exactly(&mut listener, b"p 1 hist.bin\n").await;

        transport.capture_stop(StreamId(1)).await.unwrap();
        read_exactly(&mut listener, b"p 1\n").await;

        transport.stream_echo(StreamId(2), true).await.unwrap();
        read_exactly(&mut listener, b"d 2 on\n").await;
    }
}
