//! Parameter schema per board type
//!
//! The table below is the full set of settings any firmware exposes. A
//! board's schema is the subset whose `requires` features the board has.

use crate::board::{BoardType, Capabilities};
use crate::param::{Bounds, ParamDef, ParamId, ParamKind};

/// Servo pulse limits in microseconds
const PWM_MIN: i16 = 988;
const PWM_MAX: i16 = 2012;

const fn float(id: u16, name: &'static str, min: f32, max: f32) -> ParamDef {
    ParamDef {
        id: ParamId(id),
        name,
        kind: ParamKind::Float,
        bounds: Bounds::Float { min, max },
        volatile: false,
        requires: Capabilities::empty(),
    }
}

const fn int(id: u16, name: &'static str, min: i16, max: i16) -> ParamDef {
    ParamDef {
        id: ParamId(id),
        name,
        kind: ParamKind::Int,
        bounds: Bounds::Int { min, max },
        volatile: false,
        requires: Capabilities::empty(),
    }
}

const fn flag(id: u16, name: &'static str) -> ParamDef {
    ParamDef {
        id: ParamId(id),
        name,
        kind: ParamKind::Bool,
        bounds: Bounds::Unbounded,
        volatile: false,
        requires: Capabilities::empty(),
    }
}

const fn bytes(id: u16, name: &'static str, max_len: u8) -> ParamDef {
    ParamDef {
        id: ParamId(id),
        name,
        kind: ParamKind::Bytes,
        bounds: Bounds::MaxLen(max_len),
        volatile: false,
        requires: Capabilities::empty(),
    }
}

const fn needs(mut def: ParamDef, feature: Capabilities) -> ParamDef {
    def.requires = feature;
    def
}

const fn volatile(mut def: ParamDef) -> ParamDef {
    def.volatile = true;
    def
}

pub const ACC_CALIBRATION: ParamId = ParamId(60);
pub const MAG_CALIBRATION: ParamId = ParamId(51);
pub const DISABLE_MAG: ParamId = ParamId(50);

/// Every parameter known to the client, ascending by id
pub static PARAMETERS: &[ParamDef] = &[
    float(1, "PanGain", 0.1, 5.0),
    float(2, "TiltGain", 0.1, 5.0),
    float(3, "RollGain", 0.1, 5.0),
    int(4, "PanMin", PWM_MIN, PWM_MAX),
    int(5, "PanMax", PWM_MIN, PWM_MAX),
    int(6, "PanCenter", PWM_MIN, PWM_MAX),
    int(7, "TiltMin", PWM_MIN, PWM_MAX),
    int(8, "TiltMax", PWM_MIN, PWM_MAX),
    int(9, "TiltCenter", PWM_MIN, PWM_MAX),
    int(10, "RollMin", PWM_MIN, PWM_MAX),
    int(11, "RollMax", PWM_MIN, PWM_MAX),
    int(12, "RollCenter", PWM_MIN, PWM_MAX),
    int(13, "PanChannel", -1, 16),
    int(14, "TiltChannel", -1, 16),
    int(15, "RollChannel", -1, 16),
    ParamDef {
        id: ParamId(16),
        name: "ServoReverse",
        kind: ParamKind::Bitmask,
        bounds: Bounds::Mask(0b111),
        volatile: false,
        requires: Capabilities::empty(),
    },
    int(17, "LowPassTiltRoll", 1, 100),
    int(18, "LowPassPan", 1, 100),
    flag(19, "ResetOnTilt"),
    needs(int(20, "PpmOutPin", -1, 31), Capabilities::PPM_OUT),
    needs(int(21, "PpmChannels", 4, 16), Capabilities::PPM_OUT),
    needs(int(22, "PpmFrameLength", 12500, 32000), Capabilities::PPM_OUT),
    needs(int(30, "PpmInPin", -1, 31), Capabilities::PPM_IN),
    needs(flag(31, "PpmInInvert"), Capabilities::PPM_IN),
    needs(int(40, "BtMode", 0, 4), Capabilities::BLUETOOTH),
    needs(bytes(41, "BtPairAddress", 17), Capabilities::BLUETOOTH),
    needs(flag(50, "DisableMag"), Capabilities::MAGNETOMETER),
    // 3 hard-iron offsets followed by the 3x3 soft-iron matrix, f32 LE
    needs(bytes(51, "MagCalibration", 48), Capabilities::MAGNETOMETER),
    needs(flag(52, "ResetOnWave"), Capabilities::PROXIMITY),
    bytes(60, "AccCalibration", 12),
    bytes(61, "GyroCalibration", 12),
    volatile(int(70, "StreamPeriodMs", 10, 1000)),
];

/// The parameters valid for one board type
#[derive(Debug, Clone)]
pub struct Schema {
    board: BoardType,
    defs: Vec<&'static ParamDef>,
}

impl Schema {
    /// Build the schema for `board` from its fitted features
    pub fn for_board(board: BoardType) -> Self {
        let features = board.features();
        let defs = PARAMETERS
            .iter()
            .filter(|d| features.contains(d.requires))
            .collect();
        Self { board, defs }
    }

    pub fn board(&self) -> BoardType {
        self.board
    }

    pub fn get(&self, id: ParamId) -> Option<&'static ParamDef> {
        self.defs
            .binary_search_by_key(&id, |d| d.id)
            .ok()
            .map(|i| self.defs[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&'static ParamDef> {
        self.defs
            .iter()
            .copied()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Parameter definitions in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &'static ParamDef> + '_ {
        self.defs.iter().copied()
    }

    pub fn ids(&self) -> Vec<ParamId> {
        self.defs.iter().map(|d| d.id).collect()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
