//! Direct serial transport.
//!
//! Point-to-point link to the controller with synchronous device
//! semantics: reads block against the driver, bounded by a fixed device
//! timeout. Inline sideband framing happens on the read path, with the
//! line policy that a line is never delivered while a sideband payload is
//! still open at its tail; the next line is read and appended first.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{self, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use crate::accumulator::ByteAccumulator;
use crate::error::TransportError;
use crate::sideband::{SidebandConfig, SidebandFramer};
use crate::tracing::prelude::*;
use crate::transport::{Capabilities, PortDescriptor, TransportKind, TransportPort};

/// Device-level read timeout: how long a single blocking read waits for
/// the driver before giving up.
pub const DEVICE_READ_TIMEOUT: Duration = Duration::from_secs(5);

struct Link {
    reader: ReadHalf<SerialStream>,
    writer: WriteHalf<SerialStream>,
}

/// Serial implementation of [`TransportPort`].
pub struct SerialTransport {
    link: Option<Link>,
    endpoint: String,
    acc: ByteAccumulator,
    framer: SidebandFramer,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            link: None,
            endpoint: String::new(),
            acc: ByteAccumulator::new(),
            framer: SidebandFramer::new(SidebandConfig::disabled()),
        }
    }

    /// Adopt an already-open serial stream: a PTY pair in tests, or a
    /// stream opened elsewhere with custom settings.
    pub fn attach(
        stream: SerialStream,
        endpoint: impl Into<String>,
        sideband: SidebandConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            link: Some(Link { reader, writer }),
            endpoint: endpoint.into(),
            acc: ByteAccumulator::new(),
            framer: SidebandFramer::new(sideband),
        }
    }

    /// List serial ports present on this host, sorted by port name.
    pub fn available_ports() -> Result<Vec<PortDescriptor>, TransportError> {
        let mut ports: Vec<PortDescriptor> = tokio_serial::available_ports()?
            .into_iter()
            .map(|info| {
                let (description, location) = match info.port_type {
                    SerialPortType::UsbPort(usb) => (
                        usb.product.unwrap_or_else(|| "USB serial device".into()),
                        format!(
                            "USB {:04x}:{:04x}{}",
                            usb.vid,
                            usb.pid,
                            usb.serial_number
                                .map(|s| format!(" sn {s}"))
                                .unwrap_or_default()
                        ),
                    ),
                    SerialPortType::PciPort => ("PCI serial port".into(), "PCI".into()),
                    SerialPortType::BluetoothPort => {
                        ("Bluetooth serial port".into(), "Bluetooth".into())
                    }
                    SerialPortType::Unknown => ("Serial port".into(), String::new()),
                };
                PortDescriptor {
                    identifier: info.port_name,
                    description,
                    location,
                }
            })
            .collect();
        ports.sort();
        Ok(ports)
    }

    /// One driver read into the accumulator, waiting at most `wait`.
    /// Returns the number of bytes appended; 0 means the wait elapsed.
    async fn fill(&mut self, wait: Duration) -> Result<usize, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        let mut buf = [0u8; 4096];
        match time::timeout(wait, link.reader.read(&mut buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(0)) => {
                warn!(endpoint = %self.endpoint, "Serial stream hit EOF.");
                Err(TransportError::Closed)
            }
            Ok(Ok(n)) => {
                self.acc.push(&buf[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Take the framable prefix of the accumulator and run it through the
    /// sideband framer. An unfinished marker+payload tail stays buffered.
    fn drain_framed(&mut self) -> Bytes {
        let clean_end = self
            .framer
            .open_tail_start(self.acc.as_slice())
            .unwrap_or_else(|| self.acc.len());
        let raw = self.acc.take(clean_end);
        self.framer.frame(&raw).freeze()
    }

    /// Next raw line from the accumulator, reading from the driver as
    /// needed, bounded by `deadline`.
    async fn next_raw_line(&mut self, deadline: Instant) -> Result<Bytes, TransportError> {
        loop {
            if let Some(line) = self.acc.take_line() {
                return Ok(line);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::LineTimeout);
            }
            let wait = remaining.min(DEVICE_READ_TIMEOUT);
            if self.fill(wait).await? == 0 && deadline <= Instant::now() {
                return Err(TransportError::LineTimeout);
            }
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportPort for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            inline_sideband: true,
            stream_capture: false,
        }
    }

    async fn enumerate(&mut self) -> Result<Vec<PortDescriptor>, TransportError> {
        Self::available_ports()
    }

    async fn open(
        &mut self,
        endpoint: &str,
        baud: u32,
        sideband: SidebandConfig,
    ) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Err(TransportError::AlreadyOpen(self.endpoint.clone()));
        }

        let stream = tokio_serial::new(endpoint, baud).open_native_async()?;
        let (reader, writer) = tokio::io::split(stream);
        self.link = Some(Link { reader, writer });
        self.endpoint = endpoint.to_string();
        self.acc.clear();
        self.framer = SidebandFramer::new(sideband);
        info!(endpoint = %endpoint, baud, "Serial port opened.");
        Ok(())
    }

    async fn close(&mut self) {
        if self.link.take().is_some() {
            info!(endpoint = %self.endpoint, "Serial port closed.");
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        link.writer.write_all(data).await?;
        link.writer.flush().await?;
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Bytes, TransportError> {
        // Minimal poll: give the driver one short slice to hand over
        // whatever it already has queued.
        self.fill(Duration::from_millis(1)).await?;
        Ok(self.drain_framed())
    }

    async fn read_for(&mut self, budget: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + budget;
        loop {
            // Bytes before an unfinished marker+payload tail are the only
            // ones drain_framed will hand out; keep reading until some
            // exist or the budget runs out.
            let framable = self
                .framer
                .open_tail_start(self.acc.as_slice())
                .unwrap_or_else(|| self.acc.len());
            if framable > 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.fill(remaining).await?;
        }
        Ok(self.drain_framed())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut line = BytesMut::from(self.next_raw_line(deadline).await?.as_ref());

        // Never deliver a line while a sideband payload is open at its
        // tail; the newline we split on was part of the payload, so put it
        // back and append the next line.
        while self.framer.ends_mid_payload(&line) {
            let next = self.next_raw_line(deadline).await?;
            line.extend_from_slice(b"\n");
            line.extend_from_slice(&next);
        }

        let framed = self.framer.frame(&line);
        Ok(String::from_utf8_lossy(&framed).into_owned())
    }

    fn collect_sideband(&mut self) -> Vec<Bytes> {
        self.framer.collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pty_pair(sideband: SidebandConfig) -> (SerialTransport, SerialStream) {
        let (ours, theirs) = SerialStream::pair().expect("pty pair");
        (SerialTransport::attach(ours, "pty", sideband), theirs)
    }

    #[tokio::test]
    #[cfg_attr(feature = "skip-pty-tests", ignore)]
    async fn read_line_strips_the_newline() {
        let (mut transport, mut device) = pty_pair(SidebandConfig::disabled());
        device.write_all(b"ok 1\nnext").await.unwrap();

        let line = transport.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "ok 1");
    }

    #[tokio::test]
    #[cfg_attr(feature = "skip-pty-tests", ignore)]
    async fn read_line_times_out_without_a_newline() {
        let (mut transport, mut device) = pty_pair(SidebandConfig::disabled());
        device.write_all(b"no newline").await.unwrap();

        let err = transport
            .read_line(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::LineTimeout));
    }

    #[tokio::test]
    #[cfg_attr(feature = "skip-pty-tests", ignore)]
    async fn open_sideband_tail_joins_the_next_line() {
        // The newline that split the first raw line sits inside the
        // payload; the delivered line must be whole and clean.
        let (mut transport, mut device) = pty_pair(SidebandConfig::new(&b"$"[..], 4));
        device.write_all(b"AB$W\nXYZ!cd\n").await.unwrap();

        let line = transport.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "ABZ!cd");
        assert_eq!(
            transport.collect_sideband(),
            vec![Bytes::from_static(b"W\nXY")]
        );
    }

    #[tokio::test]
    #[cfg_attr(feature = "skip-pty-tests", ignore)]
    async fn read_for_frames_and_defers_the_open_tail() {
        let (mut transport, mut device) = pty_pair(SidebandConfig::new(&b"$"[..], 4));
        device.write_all(b"ab$WX").await.unwrap();

        let text = transport
            .read_for(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(text.as_ref(), b"ab");
        assert!(transport.collect_sideband().is_empty());

        device.write_all(b"YZcd").await.unwrap();
        let text = transport
            .read_for(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(text.as_ref(), b"cd");
        assert_eq!(
            transport.collect_sideband(),
            vec![Bytes::from_static(b"WXYZ")]
        );
    }

    #[tokio::test]
    async fn write_while_closed_is_an_error() {
        let mut transport = SerialTransport::new();
        assert!(!transport.is_open());
        let err = transport.write(b"gp").await.unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[tokio::test]
    async fn close_when_not_open_is_a_no_op() {
        let mut transport = SerialTransport::new();
        transport.close().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    #[cfg_attr(feature = "skip-pty-tests", ignore)]
    async fn open_while_open_is_rejected() {
        let (mut transport, _device) = pty_pair(SidebandConfig::disabled());
        let err = transport
            .open("/dev/null", 115200, SidebandConfig::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AlreadyOpen(_)));
    }
}
