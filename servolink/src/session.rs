//! Device session: an owned transport plus the machine table.
//!
//! One session owns one transport handle and the live parameter/command
//! tables built from configuration. Callers (the control panel, scripts)
//! drive everything through it by parameter name; nothing here is global,
//! so tests construct independent sessions freely.
//!
//! The session is single-owner and cooperative: a UI drives it from a
//! periodic tick (drain the console at a short interval, refresh
//! auto-polled parameters at a slower one). No operation spawns its own
//! request machinery.

use bytes::Bytes;
use std::time::Duration;

use crate::actions::{DeviceCommand, PostAction};
use crate::config::{Config, MachineConfig};
use crate::error::Error;
use crate::machine::{Param, ParameterProtocol, Value};
use crate::tracing::prelude::*;
use crate::transport::{BridgedTransport, SerialTransport, StreamId, TransportKind, TransportPort};

/// An open connection to one machine.
pub struct Session {
    port: Box<dyn TransportPort>,
    protocol: ParameterProtocol,
    params: Vec<Param>,
    commands: Vec<DeviceCommand>,
    machine_name: String,
}

impl Session {
    /// Construct the configured transport, open it, and build the machine
    /// table.
    pub async fn connect(config: &Config) -> crate::error::Result<Self> {
        let mut port: Box<dyn TransportPort> = match config.link.kind {
            TransportKind::Serial => Box::new(SerialTransport::new()),
            TransportKind::Bridged => {
                let program = config.link.listener_program.as_deref().ok_or_else(|| {
                    Error::Config("bridged link needs listener_program".into())
                })?;
                Box::new(BridgedTransport::spawn(program).await.map_err(Error::from)?)
            }
        };

        port.open(
            &config.link.endpoint,
            config.link.baud,
            config.link.sideband.to_config(),
        )
        .await
        .map_err(Error::from)?;

        Self::from_parts(port, &config.machine)
    }

    /// Build a session around an already-connected transport.
    pub fn from_parts(
        port: Box<dyn TransportPort>,
        machine: &MachineConfig,
    ) -> crate::error::Result<Self> {
        let params = machine
            .build_params()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            port,
            protocol: ParameterProtocol::new(
                &machine.get_cmd,
                &machine.set_cmd,
                machine.debug_marker,
            ),
            params,
            commands: machine.build_commands(),
            machine_name: machine.name.clone(),
        })
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn is_open(&self) -> bool {
        self.port.is_open()
    }

    /// Direct transport access for collaborators with their own wire
    /// needs (plotting readback, stream capture control).
    pub fn port(&mut self) -> &mut dyn TransportPort {
        self.port.as_mut()
    }

    fn find(&self, name: &str) -> crate::error::Result<usize> {
        self.params
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Config(format!("no parameter named {name:?}")))
    }

    /// Query the device for one parameter by name.
    pub async fn get(&mut self, name: &str, quiet: bool) -> crate::error::Result<Value> {
        let i = self.find(name)?;
        let value = self
            .protocol
            .get(self.port.as_mut(), &mut self.params[i], quiet)
            .await?;
        Ok(value)
    }

    /// Validate, store, and write one parameter by name.
    pub async fn set(&mut self, name: &str, raw: &str) -> crate::error::Result<()> {
        let i = self.find(name)?;
        self.protocol
            .set(self.port.as_mut(), &mut self.params[i], raw)
            .await?;
        Ok(())
    }

    /// Restore one parameter to its default and write it.
    pub async fn restore(&mut self, name: &str) -> crate::error::Result<()> {
        let i = self.find(name)?;
        self.protocol
            .restore(self.port.as_mut(), &mut self.params[i])
            .await?;
        Ok(())
    }

    /// Re-read every parameter, quietly. Individual failures are logged
    /// and skipped; returns how many parameters refreshed successfully.
    pub async fn refresh_all(&mut self) -> usize {
        let mut refreshed = 0;
        for i in 0..self.params.len() {
            match self
                .protocol
                .get(self.port.as_mut(), &mut self.params[i], true)
                .await
            {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    debug!(param = %self.params[i].name, error = %e, "Refresh failed.");
                }
            }
        }
        refreshed
    }

    /// Send a named console command, then perform its post action.
    pub async fn run_command(&mut self, name: &str) -> crate::error::Result<()> {
        let command = self
            .commands
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| Error::Config(format!("no command named {name:?}")))?;

        info!(command = %command.name, wire = %command.cmd, "Running device command.");
        self.port
            .write(command.cmd.as_bytes())
            .await
            .map_err(Error::from)?;

        match &command.action {
            PostAction::None => {}
            PostAction::RefreshParams => {
                self.refresh_all().await;
            }
            PostAction::CaptureStart { stream, file } => {
                self.port
                    .capture_start(StreamId(*stream), file)
                    .await
                    .map_err(Error::from)?;
            }
            PostAction::CaptureStop { stream } => {
                self.port
                    .capture_stop(StreamId(*stream))
                    .await
                    .map_err(Error::from)?;
            }
            PostAction::StreamEcho { stream, enable } => {
                self.port
                    .stream_echo(StreamId(*stream), *enable)
                    .await
                    .map_err(Error::from)?;
            }
        }
        Ok(())
    }

    /// Route any pending console output to the log. Called from the UI's
    /// short periodic tick.
    pub async fn drain_console(&mut self) -> crate::error::Result<()> {
        let text = self.port.read_available().await.map_err(Error::from)?;
        if !text.is_empty() {
            info!(machine = %self.machine_name, console = %String::from_utf8_lossy(&text));
        }
        Ok(())
    }

    /// Wait up to `budget` for console output, then route it to the log.
    pub async fn drain_console_for(&mut self, budget: Duration) -> crate::error::Result<()> {
        let text = self.port.read_for(budget).await.map_err(Error::from)?;
        if !text.is_empty() {
            info!(machine = %self.machine_name, console = %String::from_utf8_lossy(&text));
        }
        Ok(())
    }

    /// Drain extracted sideband payloads for streaming consumers.
    pub fn collect_sideband(&mut self) -> Vec<Bytes> {
        self.port.collect_sideband()
    }

    /// Close the transport. In-flight reads elsewhere fail fast with a
    /// closed-channel error; the session can be reopened by reconnecting.
    pub async fn close(&mut self) {
        self.port.close().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("machine", &self.machine_name)
            .field("kind", &self.port.kind())
            .field("open", &self.port.is_open())
            .field("params", &self.params.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::sideband::SidebandConfig;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn machine() -> MachineConfig {
        crate::config::Config::parse(
            r##"
            [link]
            kind = "bridged"
            endpoint = "0"
            listener_program = "unused"

            [machine]
            name = "uStepper"
            debug_marker = "#"
            get_cmd = "g"
            set_cmd = "s"

            [[machine.parameters]]
            name = "Kp"
            cmd = "kp"
            type = "float"
            default = "1.5"

            [[machine.commands]]
            name = "Zero"
            cmd = "z"
            "##,
        )
        .unwrap()
        .machine
    }

    /// Session over a bridged transport whose listener is a duplex fake.
    async fn harness() -> (Session, DuplexStream) {
        let (ours, mut theirs) = duplex(4096);
        let (read, write) = tokio::io::split(ours);
        let mut port = BridgedTransport::from_io(read, write);
        port.open("0", 0, SidebandConfig::disabled()).await.unwrap();

        let mut buf = [0u8; 8];
        theirs.read_exact(&mut buf[..4]).await.unwrap();
        assert_eq!(&buf[..4], b"n 0\n");

        let session = Session::from_parts(Box::new(port), &machine()).unwrap();
        (session, theirs)
    }

    #[tokio::test]
    async fn get_round_trips_through_the_listener() {
        let (mut session, mut listener) = harness().await;

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            listener.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b">gkp\n");
            listener.write_all(b"#ignore me\n2.75\n").await.unwrap();
            listener
        });

        let value = session.get("kp", false).await.unwrap();
        assert_eq!(value, Value::Float(2.75));
        assert_eq!(session.params()[0].value, Value::Float(2.75));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn set_then_restore_write_to_the_listener() {
        let (mut session, mut listener) = harness().await;

        session.set("Kp", "4.5").await.unwrap();
        let mut buf = [0u8; 9];
        listener.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b">skp 4.5\n");

        session.restore("Kp").await.unwrap();
        listener.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b">skp 1.5\n");
        assert_eq!(session.params()[0].value, Value::Float(1.5));
    }

    #[tokio::test]
    async fn unknown_parameter_is_a_config_error() {
        let (mut session, _listener) = harness().await;
        let err = session.get("nope", false).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn run_command_writes_the_raw_command() {
        let (mut session, mut listener) = harness().await;

        session.run_command("zero").await.unwrap();
        let mut buf = [0u8; 3];
        listener.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b">z\n");
    }

    #[tokio::test]
    async fn close_makes_reads_fail_fast() {
        let (mut session, listener) = harness().await;
        drop(listener);
        session.close().await;
        assert!(!session.is_open());

        let err = session.get("kp", false).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Get(crate::error::GetError::Transport(
                TransportError::NotOpen | TransportError::Closed
            ))
        ));
    }
}
