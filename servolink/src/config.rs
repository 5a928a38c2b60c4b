//! Configuration for the device link and the machine table.
//!
//! Everything a session needs arrives in one TOML document: which
//! transport to use (a runtime choice, not a compile-time one), how to
//! reach the device, the sideband framing settings, and the machine's
//! parameter and command tables. A second, values-only settings file can
//! be overlaid on a loaded table to restore saved parameter values.

use serde::{Deserialize, Serialize};
use std::path::Path;

use anyhow::Context;

use crate::actions::{DeviceCommand, PostAction};
use crate::machine::{parse_value, DataType, Param};
use crate::sideband::SidebandConfig;
use crate::tracing::prelude::*;
use crate::transport::TransportKind;

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub link: LinkConfig,
    pub machine: MachineConfig,
}

/// How to reach the device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    /// Which transport carries the session.
    pub kind: TransportKind,
    /// Serial port name, or listener endpoint id.
    pub endpoint: String,
    /// Serial baud rate; ignored by the bridged transport.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Inline sideband framing settings.
    #[serde(default)]
    pub sideband: SidebandSettings,
    /// Listener executable; required when `kind` is bridged.
    pub listener_program: Option<String>,
}

fn default_baud() -> u32 {
    115200
}

/// Serde-friendly form of [`SidebandConfig`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SidebandSettings {
    /// Escape marker; empty disables extraction.
    #[serde(default)]
    pub marker: String,
    #[serde(default)]
    pub payload_len: usize,
}

impl SidebandSettings {
    pub fn to_config(&self) -> SidebandConfig {
        if self.marker.is_empty() {
            SidebandConfig::disabled()
        } else {
            SidebandConfig::new(self.marker.clone().into_bytes(), self.payload_len)
        }
    }
}

/// The machine table: protocol prefixes plus parameter/command inventory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    pub name: String,
    /// Reply lines starting with this character are diagnostic noise.
    pub debug_marker: Option<char>,
    /// Prefix for parameter GET commands.
    pub get_cmd: String,
    /// Prefix for parameter SET commands.
    pub set_cmd: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

/// One parameter row of the machine table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub cmd: String,
    #[serde(rename = "type")]
    pub datatype: DataType,
    /// Default value, in the parameter's text representation.
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub tab: String,
}

impl ParamSpec {
    pub fn build(&self) -> anyhow::Result<Param> {
        let mut param = Param::new(&self.name, &self.cmd, self.datatype, &self.default)
            .with_context(|| format!("bad default for parameter {:?}", self.name))?;
        param.read_only = self.readonly;
        param.tab = self.tab.clone();
        Ok(param)
    }
}

/// One command row of the machine table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub action: PostAction,
}

impl CommandSpec {
    pub fn build(&self) -> DeviceCommand {
        DeviceCommand::new(&self.name, &self.cmd, self.action.clone())
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parse a TOML configuration document.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

impl MachineConfig {
    /// Build the live parameter table.
    pub fn build_params(&self) -> anyhow::Result<Vec<Param>> {
        self.parameters.iter().map(ParamSpec::build).collect()
    }

    /// Build the command inventory.
    pub fn build_commands(&self) -> Vec<DeviceCommand> {
        self.commands.iter().map(CommandSpec::build).collect()
    }
}

/// Overlay saved values on a built parameter table.
///
/// The settings file is a flat TOML table of `name = value` pairs. Each
/// matching parameter (name compared case-insensitively) gets both its
/// value and its default replaced, so a later restore returns to the
/// saved value rather than the factory one. Unknown names and values
/// that fail the parameter's datatype are logged and skipped.
pub fn apply_settings(params: &mut [Param], text: &str) -> anyhow::Result<()> {
    let table: toml::Table = toml::from_str(text)?;

    for (name, value) in table {
        let Some(param) = params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&name))
        else {
            warn!(name = %name, "Settings entry does not match any parameter.");
            continue;
        };

        let raw = match value {
            toml::Value::String(s) => s,
            other => other.to_string(),
        };
        match parse_value(param.datatype, &raw) {
            Ok(value) => {
                param.value = value.clone();
                param.default_value = value;
            }
            Err(e) => warn!(name = %name, error = %e, "Ignoring unusable saved value."),
        }
    }
    Ok(())
}

/// Overlay saved values from a settings file.
pub fn apply_settings_file(params: &mut [Param], path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings {}", path.display()))?;
    apply_settings(params, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Value;

    const EXAMPLE: &str = r##"
        [link]
        kind = "serial"
        endpoint = "/dev/ttyACM0"
        baud = 57600

        [link.sideband]
        marker = "$"
        payload_len = 24

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
        tab = "Control"

        [[machine.parameters]]
        name = "Steps"
        cmd = "n"
        type = "uint"
        default = "200"
        readonly = true

        [[machine.commands]]
        name = "Plot history"
        cmd = "gd"
        action = { kind = "capture_start", stream = 1, file = "history.bin" }

        [[machine.commands]]
        name = "Zero position"
        cmd = "z"
    "##;

    #[test]
    fn parses_a_full_document() {
        let config = Config::parse(EXAMPLE).unwrap();
        assert_eq!(config.link.kind, TransportKind::Serial);
        assert_eq!(config.link.baud, 57600);
        assert_eq!(config.link.sideband.payload_len, 24);
        assert!(config.link.sideband.to_config().is_enabled());
        assert_eq!(config.machine.debug_marker, Some('#'));

        let params = config.machine.build_params().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].value, Value::Float(1.5));
        assert!(params[1].read_only);
        assert_eq!(params[1].value, Value::UInt(200));

        let commands = config.machine.build_commands();
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[0].action,
            PostAction::CaptureStart { stream: 1, .. }
        ));
        assert_eq!(commands[1].action, PostAction::None);
    }

    #[test]
    fn bad_parameter_default_is_an_error() {
        let config = Config::parse(EXAMPLE).unwrap();
        let mut machine = config.machine;
        machine.parameters[0].default = "fast".into();
        assert!(machine.build_params().is_err());
    }

    #[test]
    fn settings_overlay_updates_value_and_default() {
        let config = Config::parse(EXAMPLE).unwrap();
        let mut params = config.machine.build_params().unwrap();

        apply_settings(&mut params, "kp = 2.25\nunknown = 1\nsteps = \"400\"\n").unwrap();
        assert_eq!(params[0].value, Value::Float(2.25));
        assert_eq!(params[0].default_value, Value::Float(2.25));
        assert_eq!(params[1].value, Value::UInt(400));

        // A restore now returns to the saved value.
        params[0].set_valid_value("9.0").unwrap();
        params[0].restore_default();
        assert_eq!(params[0].value, Value::Float(2.25));
    }

    #[test]
    fn settings_overlay_keeps_unparseable_values_out() {
        let config = Config::parse(EXAMPLE).unwrap();
        let mut params = config.machine.build_params().unwrap();

        apply_settings(&mut params, "steps = \"many\"\n").unwrap();
        assert_eq!(params[1].value, Value::UInt(200));
    }

    #[test]
    fn disabled_sideband_roundtrip() {
        let settings = SidebandSettings::default();
        assert!(!settings.to_config().is_enabled());
    }
}
