//! Device link and parameter protocol for embedded motor controllers.
//!
//! servolink connects an operator console to motor-control firmware over
//! one of two interchangeable transports: a direct serial port, or a
//! bridge to an external listener process that tunnels a USB packet
//! interface into a line protocol. On top of the raw link it provides:
//!
//! - sideband framing: binary telemetry payloads multiplexed inline with
//!   the firmware's console text are spliced out and queued separately
//!   ([`sideband`]);
//! - a typed get/set/restore parameter protocol with bounded retry and
//!   timeout semantics ([`machine`]);
//! - configuration-driven sessions owning one transport and one machine
//!   table ([`session`], [`config`]).
//!
//! The transport is a runtime choice, so both kinds can be exercised in
//! one binary and one test suite. Loss of the underlying link is
//! reported through typed errors, never masked.

pub mod accumulator;
pub mod actions;
pub mod config;
pub mod error;
pub mod machine;
pub mod session;
pub mod sideband;
pub mod tracing;
pub mod transport;

pub use actions::{DeviceCommand, PostAction};
pub use config::{Config, LinkConfig, MachineConfig};
pub use error::{Error, GetError, ParseValueError, Result, SetError, TransportError};
pub use machine::{DataType, Param, ParameterProtocol, Value};
pub use session::Session;
pub use sideband::{SidebandConfig, SidebandFramer};
pub use transport::{
    BridgedTransport, Capabilities, PortDescriptor, SerialTransport, StreamId, TransportKind,
    TransportPort,
};
