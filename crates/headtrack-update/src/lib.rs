//! Head Tracker Update - firmware acquisition and flashing
//!
//! - [`fetch`]: remote catalog per release channel, cached, with verified downloads
//! - [`bootloader`]: baud-rate touch and bootloader port discovery
//! - [`programmer`]: the external flashing tool and its progress output
//! - [`FirmwareUpdateController`]: the cancellable update state machine

pub mod bootloader;
pub mod controller;
pub mod fetch;
pub mod programmer;

pub use bootloader::{BootloaderConfig, BootloaderPort};
pub use controller::{
    FirmwareSource, FirmwareUpdateController, UpdateConfig, UpdateError, UpdateEvent,
    UpdateEventKind, UpdateFailure, UpdateRequest, UpdateState,
};
pub use fetch::{FetchError, FirmwareFetcher};
pub use programmer::{ProgrammerConfig, ProgrammerOutput};
