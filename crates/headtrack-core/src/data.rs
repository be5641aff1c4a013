//! Live data items the board can stream

use serde::{Deserialize, Serialize};

/// One value the board can include in STREAM_DATA frames
///
/// The discriminant is both the item byte in STREAM_DATA and the bit
/// position in a STREAM_CONFIG mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataItem {
    Tilt = 0,
    Roll = 1,
    Pan = 2,
    TiltOut = 3,
    RollOut = 4,
    PanOut = 5,
    AccX = 6,
    AccY = 7,
    AccZ = 8,
    GyroX = 9,
    GyroY = 10,
    GyroZ = 11,
    MagX = 12,
    MagY = 13,
    MagZ = 14,
    /// Proximity sensor reading
    Proximity = 15,
    /// Milliseconds the main loop took on its last pass
    LoopTime = 16,
}

impl DataItem {
    pub const ALL: [DataItem; 17] = [
        DataItem::Tilt,
        DataItem::Roll,
        DataItem::Pan,
        DataItem::TiltOut,
        DataItem::RollOut,
        DataItem::PanOut,
        DataItem::AccX,
        DataItem::AccY,
        DataItem::AccZ,
        DataItem::GyroX,
        DataItem::GyroY,
        DataItem::GyroZ,
        DataItem::MagX,
        DataItem::MagY,
        DataItem::MagZ,
        DataItem::Proximity,
        DataItem::LoopTime,
    ];

    /// Items the calibration routine needs while it runs
    pub const CALIBRATION: [DataItem; 6] = [
        DataItem::MagX,
        DataItem::MagY,
        DataItem::MagZ,
        DataItem::AccX,
        DataItem::AccY,
        DataItem::AccZ,
    ];

    pub fn from_wire(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn bit(self) -> u32 {
        1 << (self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tilt => "tilt",
            Self::Roll => "roll",
            Self::Pan => "pan",
            Self::TiltOut => "tiltout",
            Self::RollOut => "rollout",
            Self::PanOut => "panout",
            Self::AccX => "accx",
            Self::AccY => "accy",
            Self::AccZ => "accz",
            Self::GyroX => "gyrox",
            Self::GyroY => "gyroy",
            Self::GyroZ => "gyroz",
            Self::MagX => "magx",
            Self::MagY => "magy",
            Self::MagZ => "magz",
            Self::Proximity => "proximity",
            Self::LoopTime => "looptime",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.name().eq_ignore_ascii_case(name))
    }

    /// Build a STREAM_CONFIG mask from a set of items
    pub fn mask<I: IntoIterator<Item = DataItem>>(items: I) -> u32 {
        items.into_iter().fold(0, |acc, i| acc | i.bit())
    }

    /// Items whose bit is set in `mask`
    pub fn from_mask(mask: u32) -> Vec<DataItem> {
        Self::ALL.into_iter().filter(|i| mask & i.bit() != 0).collect()
    }
}

impl std::fmt::Display for DataItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single streamed reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub item: DataItem,
    pub value: f32,
}
