//! Device commands and post-command actions.
//!
//! Machine tables pair each console command with an optional follow-up the
//! host performs after sending it. Follow-ups form a closed registry of
//! named, data-only actions; a configuration file can select one but
//! never supply code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Follow-up performed by the session after a command is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostAction {
    /// No follow-up.
    #[default]
    None,
    /// Re-read every parameter (quietly) after the command completes.
    RefreshParams,
    /// Start recording a tagged data stream to a file.
    CaptureStart { stream: u8, file: PathBuf },
    /// Stop recording a tagged data stream.
    CaptureStop { stream: u8 },
    /// Toggle console echo of a tagged data stream.
    StreamEcho { stream: u8, enable: bool },
}

/// A named console command from the machine table.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommand {
    pub name: String,
    /// Raw command text written to the device.
    pub cmd: String,
    pub action: PostAction,
}

impl DeviceCommand {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>, action: PostAction) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            action,
        }
    }
}
