//! Head Tracker Link - framing and request/response over serial
//!
//! This crate turns a raw serial byte stream into reliable transactions
//! with a head tracker board:
//! - [`frame`]: sync/length/checksum framing and an incremental decoder
//! - [`messages`]: request and response payloads
//! - [`BoardLink`]: the single-in-flight request engine and stream events
//! - [`transport`]: the port abstraction backed by `tokio-serial`

pub mod frame;
pub mod link;
pub mod messages;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod transport;

pub use frame::{ChecksumKind, Frame, FrameDecoder, FrameError, Opcode};
pub use link::{
    broadcast_stream, BoardLink, CalibrationKind, LinkConfig, LinkEvent, ProtocolError,
};
pub use messages::{DeviceEvent, ResetTrigger, StreamEvent};
pub use transport::{PortInfo, PortProvider, SerialIo, SerialPortProvider, TransportError};
