//! Head Tracker Core - board identity, parameters, and firmware images
//!
//! This crate provides the I/O-free types shared by the rest of the
//! workspace:
//! - Board identity and capability flags negotiated at HELLO
//! - The per-board parameter schema, value codec, and [`ParameterStore`]
//! - TOML settings snapshots
//! - Firmware image sniffing and release catalog types

pub mod board;
pub mod codec;
pub mod data;
pub mod firmware;
pub mod param;
pub mod schema;
pub mod snapshot;
pub mod store;

pub use board::{BoardIdentity, BoardType, Capabilities};
pub use data::{DataItem, Sample};
pub use firmware::{
    compare_versions, detect_format, Channel, FirmwareCatalog, FirmwareImage, FirmwareRelease,
    FirmwareStatus, FormatError, ImageFormat, ImageSource,
};
pub use param::{ParamDef, ParamId, ParamKind, ParamValue, ParameterError};
pub use schema::Schema;
pub use snapshot::{ImportReport, SnapshotError};
pub use store::{ParameterStore, PendingChanges, WireFrame};
