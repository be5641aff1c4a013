//! Board identity established during the HELLO handshake

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Oldest protocol revision this client can talk to
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Newest protocol revision this client understands
pub const MAX_PROTOCOL_VERSION: u8 = 2;

/// First protocol revision that frames with CRC-16 instead of a byte sum
pub const CRC_PROTOCOL_VERSION: u8 = 2;

/// Payload limit assumed before the board has told us its own
///
/// Must hold the largest HELLO response: 7 fixed bytes and a firmware
/// version string of up to 255 bytes.
pub const DEFAULT_MAX_PAYLOAD: u16 = 512;

/// Hardware variant the firmware reports in its HELLO response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardType {
    /// Arduino Nano 33 BLE (Sense)
    Nano33Ble,
    /// Seeed XIAO nRF52840 Sense
    XiaoSense,
    /// Espressif ESP32-C3 modules
    Esp32C3,
    /// DTQSYS head tracker board
    DtqSys,
}

impl BoardType {
    /// Every board the client has a parameter schema for
    pub const ALL: [BoardType; 4] = [
        BoardType::Nano33Ble,
        BoardType::XiaoSense,
        BoardType::Esp32C3,
        BoardType::DtqSys,
    ];

    /// Decode the board byte from a HELLO response
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Nano33Ble),
            2 => Some(Self::XiaoSense),
            3 => Some(Self::Esp32C3),
            4 => Some(Self::DtqSys),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Nano33Ble => 1,
            Self::XiaoSense => 2,
            Self::Esp32C3 => 3,
            Self::DtqSys => 4,
        }
    }

    /// Name used by the firmware build system and in release file names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nano33Ble => "NANO33BLE",
            Self::XiaoSense => "XIAOSENSE",
            Self::Esp32C3 => "ESP32C3",
            Self::DtqSys => "DTQSYS",
        }
    }

    /// Match a board name case-insensitively, ignoring `_` and `-`
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_uppercase();
        Self::ALL.into_iter().find(|b| b.as_str() == wanted)
    }

    /// USB vendor IDs the board enumerates with in normal and bootloader mode
    pub fn usb_vendor_ids(self) -> &'static [u16] {
        match self {
            Self::Nano33Ble => &[0x2341],
            Self::XiaoSense => &[0x2886],
            Self::Esp32C3 => &[0x303a],
            Self::DtqSys => &[0x1915],
        }
    }

    /// Features fitted to this hardware variant
    pub fn features(self) -> Capabilities {
        match self {
            Self::Nano33Ble => {
                Capabilities::MAGNETOMETER
                    | Capabilities::PROXIMITY
                    | Capabilities::BLUETOOTH
                    | Capabilities::PPM_IN
                    | Capabilities::PPM_OUT
            }
            Self::XiaoSense => Capabilities::BLUETOOTH | Capabilities::PPM_IN | Capabilities::PPM_OUT,
            Self::Esp32C3 => Capabilities::BLUETOOTH | Capabilities::PPM_IN | Capabilities::PPM_OUT,
            Self::DtqSys => {
                Capabilities::MAGNETOMETER | Capabilities::BLUETOOTH | Capabilities::PPM_OUT
            }
        }
    }
}

impl std::fmt::Display for BoardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Capability flags carried in the HELLO response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Capabilities: u16 {
        const MAGNETOMETER = 1 << 0;
        const PROXIMITY = 1 << 1;
        const BLUETOOTH = 1 << 2;
        const PPM_IN = 1 << 3;
        const PPM_OUT = 1 << 4;
        /// Board can push unsolicited live-data frames
        const STREAM = 1 << 5;
    }
}

/// Who we are talking to, fixed for the lifetime of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardIdentity {
    pub board: BoardType,
    pub protocol_version: u8,
    pub capabilities: Capabilities,
    /// Largest frame payload the board accepts
    pub max_payload: u16,
    /// Firmware version tag, e.g. "v2.2.1"
    pub firmware_version: String,
}

impl BoardIdentity {
    /// Whether frames after the handshake carry a CRC-16 trailer
    pub fn uses_crc(&self) -> bool {
        self.protocol_version >= CRC_PROTOCOL_VERSION
    }

    pub fn is_supported_version(version: u8) -> bool {
        (MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version)
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }
}
