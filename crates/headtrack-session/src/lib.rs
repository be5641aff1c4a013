//! Head Tracker Session - port discovery and connection management
//!
//! - [`ports`]: list serial ports and recognise head tracker boards by USB ID
//! - [`ConnectionManager`]: the connect/handshake/liveness state machine
//!   that owns a board's link and parameter store

pub mod manager;
pub mod ports;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use manager::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEventKind, ConnectionManager,
    ConnectionState, LivenessConfig,
};
pub use ports::{board_hint, list_ports, new_ports, probe_ports, DiscoveredPort};
