//! Device parameters and the get/set/restore protocol.
//!
//! The controller exposes named parameters over a plain ASCII command
//! protocol: `GET = get_prefix + cmd` asks for a value, `SET = set_prefix +
//! cmd + " " + value` stores one. Replies are newline-delimited; lines
//! starting with the machine's debug marker are diagnostic chatter to be
//! skipped, not parsed. The protocol layer gives callers typed,
//! timeout-bounded results over either transport and never auto-retries
//! beyond its fixed read bound.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{GetError, ParseValueError, SetError};
use crate::tracing::prelude::*;
use crate::transport::TransportPort;

/// How many reply lines a GET will scan for a value before giving up.
/// Firmware often dribbles debug output between real replies.
const RESPONSE_LINES: usize = 5;

/// Default per-line response timeout, matching the serial device timeout.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameter datatype, as declared in the machine table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    UInt,
    Float,
    /// Free-form text; a GET keeps the entire reply line.
    #[serde(rename = "string")]
    Text,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::UInt => "uint",
            DataType::Float => "float",
            DataType::Text => "string",
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// Parse `raw` according to `datatype`.
///
/// UInt parses as a signed integer and takes the absolute value, so a
/// stray sign is accepted and the magnitude is stored.
pub fn parse_value(datatype: DataType, raw: &str) -> Result<Value, ParseValueError> {
    let err = || ParseValueError {
        raw: raw.to_string(),
        datatype: datatype.name(),
    };
    let trimmed = raw.trim();
    match datatype {
        DataType::Int => trimmed.parse::<i64>().map(Value::Int).map_err(|_| err()),
        DataType::UInt => trimmed
            .parse::<i64>()
            .map(|v| Value::UInt(v.unsigned_abs()))
            .map_err(|_| err()),
        DataType::Float => trimmed.parse::<f64>().map(Value::Float).map_err(|_| err()),
        DataType::Text => Ok(Value::Text(raw.to_string())),
    }
}

/// A named device parameter.
///
/// Created from the machine table at load time and kept for the whole
/// session; `value` is updated by the protocol and by UI edits.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    /// Device command code appended to the get/set prefixes.
    pub cmd: String,
    pub datatype: DataType,
    pub value: Value,
    pub default_value: Value,
    pub read_only: bool,
    /// Which UI tab the parameter is grouped under.
    pub tab: String,
}

impl Param {
    pub fn new(
        name: impl Into<String>,
        cmd: impl Into<String>,
        datatype: DataType,
        default_raw: &str,
    ) -> Result<Self, ParseValueError> {
        let default_value = parse_value(datatype, default_raw)?;
        Ok(Self {
            name: name.into(),
            cmd: cmd.into(),
            datatype,
            value: default_value.clone(),
            default_value,
            read_only: false,
            tab: String::new(),
        })
    }

    /// Validate `raw` against this parameter's datatype and store it.
    ///
    /// On a parse failure the stored value is left unchanged and the error
    /// is returned; the parameter is never silently cleared.
    pub fn set_valid_value(&mut self, raw: &str) -> Result<(), ParseValueError> {
        self.value = parse_value(self.datatype, raw)?;
        Ok(())
    }

    /// Reset the stored value to the default.
    pub fn restore_default(&mut self) {
        self.value = self.default_value.clone();
    }
}

/// Request/response parameter protocol over a [`TransportPort`].
pub struct ParameterProtocol {
    get_prefix: String,
    set_prefix: String,
    /// Reply lines starting with this character are diagnostic noise.
    debug_marker: Option<char>,
    response_timeout: Duration,
    splitter: Regex,
}

impl ParameterProtocol {
    pub fn new(
        get_prefix: impl Into<String>,
        set_prefix: impl Into<String>,
        debug_marker: Option<char>,
    ) -> Self {
        Self {
            get_prefix: get_prefix.into(),
            set_prefix: set_prefix.into(),
            debug_marker,
            response_timeout: RESPONSE_TIMEOUT,
            splitter: Regex::new(r"[ \t\r\n,]+").unwrap(),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Query the device for `param`'s value and store it on success.
    ///
    /// Reads up to five reply lines, skipping debug-marked ones. An empty
    /// reply means the device has nothing to say and is not retried within
    /// this call. `quiet` suppresses the per-exchange logging (used by
    /// periodic auto-polling).
    pub async fn get(
        &self,
        port: &mut dyn TransportPort,
        param: &mut Param,
        quiet: bool,
    ) -> Result<Value, GetError> {
        let command = format!("{}{}", self.get_prefix, param.cmd);
        if !quiet {
            debug!(param = %param.name, command = %command, "Parameter get.");
        }
        port.write(command.as_bytes()).await?;

        for _ in 0..RESPONSE_LINES {
            let line = port.read_line(self.response_timeout).await?;
            if line.is_empty() {
                if !quiet {
                    debug!(param = %param.name, "Empty reply; no response.");
                }
                return Err(GetError::NoResponse);
            }
            if let Some(marker) = self.debug_marker {
                if line.starts_with(marker) {
                    debug!(line = %line, "Skipping debug output.");
                    continue;
                }
            }

            let value = match param.datatype {
                // Text parameters keep the entire reply line.
                DataType::Text => Value::Text(line.clone()),
                datatype => {
                    let token = self
                        .splitter
                        .split(&line)
                        .find(|t| !t.is_empty())
                        .unwrap_or("");
                    parse_value(datatype, token).map_err(|_| {
                        if !quiet {
                            warn!(
                                param = %param.name,
                                token = %token,
                                line = %line,
                                "Could not parse device reply."
                            );
                        }
                        GetError::Malformed {
                            token: token.to_string(),
                            line: line.clone(),
                        }
                    })?
                }
            };

            param.value = value.clone();
            return Ok(value);
        }

        warn!(param = %param.name, "Only debug output in {RESPONSE_LINES} reply lines.");
        Err(GetError::NoResponse)
    }

    /// Validate and store `raw` locally, then write it to the device.
    ///
    /// No read-back is performed; confirmation is the caller's business,
    /// typically a subsequent `get`.
    pub async fn set(
        &self,
        port: &mut dyn TransportPort,
        param: &mut Param,
        raw: &str,
    ) -> Result<(), SetError> {
        param.set_valid_value(raw)?;
        self.write_value(port, param).await
    }

    /// Reset `param` to its default and write the default to the device.
    pub async fn restore(
        &self,
        port: &mut dyn TransportPort,
        param: &mut Param,
    ) -> Result<(), SetError> {
        param.restore_default();
        self.write_value(port, param).await
    }

    async fn write_value(
        &self,
        port: &mut dyn TransportPort,
        param: &mut Param,
    ) -> Result<(), SetError> {
        let command = format!("{}{} {}", self.set_prefix, param.cmd, param.value);
        debug!(param = %param.name, command = %command, "Parameter set.");
        port.write(command.as_bytes()).await?;
        Ok(())
    }
}
