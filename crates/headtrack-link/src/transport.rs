//! Serial transport
//!
//! The link only needs an async byte stream. [`PortProvider`] is the seam
//! between the session code and the operating system's serial ports, so
//! tests can hand out in-memory pipes instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::debug;

/// Byte stream a [`crate::BoardLink`] can run over
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> SerialIo for T {}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Port {0} not found")]
    NotFound(String),
    #[error("Port {0} is busy or access was denied")]
    Busy(String),
    #[error("Cannot open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("Cannot enumerate serial ports: {0}")]
    Enumerate(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A serial port as reported by the operating system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    #[serde(default)]
    pub vid: Option<u16>,
    #[serde(default)]
    pub pid: Option<u16>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl PortInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

/// Opens and enumerates ports
pub trait PortProvider: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialIo>, TransportError>;

    fn available_ports(&self) -> Result<Vec<PortInfo>, TransportError>;
}

/// Real serial ports via `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortProvider;

impl PortProvider for SerialPortProvider {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialIo>, TransportError> {
        debug!(port = %port, baud, "Opening serial port");
        let stream = tokio_serial::new(port, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .flow_control(tokio_serial::FlowControl::None)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| map_open_error(port, e))?;
        Ok(Box::new(stream))
    }

    fn available_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| TransportError::Enumerate(e.to_string()))?;

        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    name: p.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                },
                _ => PortInfo::named(p.port_name),
            })
            .collect())
    }
}

fn map_open_error(port: &str, err: tokio_serial::Error) -> TransportError {
    use std::io::ErrorKind as Io;
    use tokio_serial::ErrorKind;

    match err.kind {
        ErrorKind::NoDevice | ErrorKind::Io(Io::NotFound) => TransportError::NotFound(port.to_string()),
        ErrorKind::Io(Io::PermissionDenied) | ErrorKind::Io(Io::WouldBlock) => {
            TransportError::Busy(port.to_string())
        }
        _ if err.description.to_ascii_lowercase().contains("busy") => {
            TransportError::Busy(port.to_string())
        }
        _ => TransportError::Open {
            port: port.to_string(),
            reason: err.description,
        },
    }
}
