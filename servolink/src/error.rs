//! Common error types for servolink.
//!
//! Transport failures, protocol failures, and value-parse failures are kept
//! as separate enums so that each layer's callers see only the outcomes that
//! layer can actually produce. A crate-level [`Error`] wraps them for code
//! that spans layers (sessions, config-driven bootstrap).

use thiserror::Error;

/// Errors raised by a transport port.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Operation requires an open channel.
    #[error("transport is not open")]
    NotOpen,

    /// Open was called on an already-open channel. The existing channel is
    /// left untouched; close it first.
    #[error("transport is already open on {0}")]
    AlreadyOpen(String),

    /// No complete line arrived within the read timeout budget.
    #[error("timed out waiting for a line from the device")]
    LineTimeout,

    /// The underlying channel went away while a read was in flight
    /// (listener exited, serial stream hit EOF, or the port was closed).
    #[error("transport closed while waiting for data")]
    Closed,

    /// The operation is not supported by this transport kind.
    #[error("operation not supported by the {0} transport")]
    Unsupported(&'static str),

    /// The listener process misbehaved (failed to spawn, refused a
    /// command, or produced no usable handles).
    #[error("listener process error: {0}")]
    Listener(String),

    /// Serial port errors from the driver.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O errors from tokio or std.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A value that could not be parsed for a parameter's datatype.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("could not parse {raw:?} as {datatype}")]
pub struct ParseValueError {
    /// The text that failed to parse.
    pub raw: String,
    /// Name of the expected datatype.
    pub datatype: &'static str,
}

/// Errors from a parameter GET exchange.
#[derive(Error, Debug)]
pub enum GetError {
    /// The device produced no parseable, non-debug reply. This covers both
    /// an empty first read and exhausting the bounded line reads on
    /// diagnostic noise.
    #[error("no response from device")]
    NoResponse,

    /// A reply line arrived but its first token did not parse as the
    /// parameter's datatype.
    #[error("malformed response: token {token:?} in line {line:?}")]
    Malformed {
        /// The token that failed to parse.
        token: String,
        /// The whole reply line, for diagnostics.
        line: String,
    },

    /// Transport failure underneath the exchange.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from a parameter SET or RESTORE exchange.
#[derive(Error, Debug)]
pub enum SetError {
    /// The new value failed datatype validation; the stored value is
    /// unchanged.
    #[error(transparent)]
    Parse(#[from] ParseValueError),

    /// Transport failure writing the command.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Crate-level error for callers that span layers.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Get(#[from] GetError),

    #[error(transparent)]
    Set(#[from] SetError),

    #[error(transparent)]
    Parse(#[from] ParseValueError),

    /// Configuration errors (unknown parameter names, bad tables).
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
