//! Typed parameter definitions and values
//!
//! A parameter is identified on the wire by its numeric [`ParamId`]; the
//! `name` is only used for snapshot files and the command line.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::board::Capabilities;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("Value {value} out of range for {name}")]
    OutOfRange { name: String, value: String },
    #[error("{name} expects a {expected} value, got {found}")]
    KindMismatch {
        name: String,
        expected: ParamKind,
        found: ParamKind,
    },
    #[error("Cannot decode parameter {id}: {reason}")]
    DecodeError { id: ParamId, reason: String },
    #[error("Parameter {0} has not been read from the board yet")]
    NotLoaded(String),
    #[error("Cannot parse '{text}' as {kind}")]
    InvalidText { text: String, kind: ParamKind },
}

/// Numeric parameter identifier used in frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub u16);

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
    Bool,
    Bitmask,
    Bytes,
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Bitmask => "bitmask",
            Self::Bytes => "bytes",
        };
        f.write_str(s)
    }
}

/// A parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i16),
    Float(f32),
    Bool(bool),
    Bitmask(u32),
    Bytes(Vec<u8>),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Int(_) => ParamKind::Int,
            Self::Float(_) => ParamKind::Float,
            Self::Bool(_) => ParamKind::Bool,
            Self::Bitmask(_) => ParamKind::Bitmask,
            Self::Bytes(_) => ParamKind::Bytes,
        }
    }

    /// Parse user-entered text for a parameter of the given kind
    ///
    /// Bitmasks accept `0x`/`0b` prefixes, bools accept `on`/`off` and
    /// `1`/`0`, and byte strings are hex.
    pub fn parse(kind: ParamKind, text: &str) -> Result<Self, ParameterError> {
        let t = text.trim();
        let invalid = || ParameterError::InvalidText {
            text: text.to_string(),
            kind,
        };
        match kind {
            ParamKind::Int => t.parse().map(Self::Int).map_err(|_| invalid()),
            ParamKind::Float => t
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Self::Float)
                .ok_or_else(invalid),
            ParamKind::Bool => match t.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" | "yes" => Ok(Self::Bool(true)),
                "false" | "off" | "0" | "no" => Ok(Self::Bool(false)),
                _ => Err(invalid()),
            },
            ParamKind::Bitmask => {
                let parsed = if let Some(h) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                    u32::from_str_radix(h, 16)
                } else if let Some(b) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
                    u32::from_str_radix(b, 2)
                } else {
                    t.parse()
                };
                parsed.map(Self::Bitmask).map_err(|_| invalid())
            }
            ParamKind::Bytes => hex::decode(t).map(Self::Bytes).map_err(|_| invalid()),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Bitmask(v) => write!(f, "0x{:08x}", v),
            Self::Bytes(v) => f.write_str(&hex::encode(v)),
        }
    }
}

/// Permitted values for a parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bounds {
    Unbounded,
    Int { min: i16, max: i16 },
    Float { min: f32, max: f32 },
    /// Only these bits may be set
    Mask(u32),
    /// Maximum byte string length
    MaxLen(u8),
}

/// Static description of one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub id: ParamId,
    pub name: &'static str,
    pub kind: ParamKind,
    pub bounds: Bounds,
    /// Applied to RAM only; never needs a flash save
    pub volatile: bool,
    /// Board features required for the parameter to exist
    pub requires: Capabilities,
}

impl ParamDef {
    /// Check that `value` has this parameter's kind and lies within its bounds
    pub fn validate(&self, value: &ParamValue) -> Result<(), ParameterError> {
        if value.kind() != self.kind {
            return Err(ParameterError::KindMismatch {
                name: self.name.to_string(),
                expected: self.kind,
                found: value.kind(),
            });
        }

        let in_range = match (self.bounds, value) {
            (_, ParamValue::Bytes(v)) if v.len() > crate::codec::MAX_VALUE_LEN => false,
            (Bounds::Unbounded, _) => true,
            (Bounds::Int { min, max }, ParamValue::Int(v)) => (min..=max).contains(v),
            (Bounds::Float { min, max }, ParamValue::Float(v)) => {
                v.is_finite() && *v >= min && *v <= max
            }
            (Bounds::Mask(mask), ParamValue::Bitmask(v)) => v & !mask == 0,
            (Bounds::MaxLen(len), ParamValue::Bytes(v)) => v.len() <= len as usize,
            // Bounds of a different shape than the kind never constrain it
            _ => true,
        };

        if in_range {
            Ok(())
        } else {
            Err(ParameterError::OutOfRange {
                name: self.name.to_string(),
                value: value.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gain() -> ParamDef {
        ParamDef {
            id: ParamId(2),
            name: "TiltGain",
            kind: ParamKind::Float,
            bounds: Bounds::Float { min: 0.1, max: 5.0 },
            volatile: false,
            requires: Capabilities::empty(),
        }
    }

    #[test]
    fn test_validate_float_bounds() {
        let def = gain();
        assert!(def.validate(&ParamValue::Float(2.5)).is_ok());
        assert!(def.validate(&ParamValue::Float(0.1)).is_ok());
        assert!(def.validate(&ParamValue::Float(5.0)).is_ok());
        assert!(matches!(
            def.validate(&ParamValue::Float(5.01)),
            Err(ParameterError::OutOfRange { .. })
        ));
        assert!(matches!(
            def.validate(&ParamValue::Float(f32::NAN)),
            Err(ParameterError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_kind_mismatch() {
        let err = gain().validate(&ParamValue::Int(1)).unwrap_err();
        assert_eq!(
            err,
            ParameterError::KindMismatch {
                name: "TiltGain".to_string(),
                expected: ParamKind::Float,
                found: ParamKind::Int,
            }
        );
    }

    #[test]
    fn test_validate_mask_and_len() {
        let mut def = gain();
        def.kind = ParamKind::Bitmask;
        def.bounds = Bounds::Mask(0b111);
        assert!(def.validate(&ParamValue::Bitmask(0b101)).is_ok());
        assert!(def.validate(&ParamValue::Bitmask(0b1000)).is_err());

        def.kind = ParamKind::Bytes;
        def.bounds = Bounds::MaxLen(4);
        assert!(def.validate(&ParamValue::Bytes(vec![1, 2, 3, 4])).is_ok());
        assert!(def.validate(&ParamValue::Bytes(vec![0; 5])).is_err());
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(ParamValue::parse(ParamKind::Int, " -3 "), Ok(ParamValue::Int(-3)));
        assert_eq!(ParamValue::parse(ParamKind::Float, "2.5"), Ok(ParamValue::Float(2.5)));
        assert_eq!(ParamValue::parse(ParamKind::Bool, "on"), Ok(ParamValue::Bool(true)));
        assert_eq!(ParamValue::parse(ParamKind::Bitmask, "0x05"), Ok(ParamValue::Bitmask(5)));
        assert_eq!(ParamValue::parse(ParamKind::Bitmask, "0b110"), Ok(ParamValue::Bitmask(6)));
        assert_eq!(
            ParamValue::parse(ParamKind::Bytes, "deadbeef"),
            Ok(ParamValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]))
        );
        assert!(ParamValue::parse(ParamKind::Float, "inf").is_err());
        assert!(ParamValue::parse(ParamKind::Int, "40000").is_err());
    }
}
