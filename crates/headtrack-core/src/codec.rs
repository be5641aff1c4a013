//! Wire encoding of parameter values
//!
//! Every value is `size:u8` followed by `size` body bytes. Fixed-width
//! kinds are little-endian: bool 1 byte, int 2 bytes, bitmask 4 bytes,
//! float 4 bytes IEEE-754. For byte strings the size is the string length.

use crate::param::{ParamDef, ParamKind, ParamValue, ParameterError};

/// Longest body a size prefix can describe
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

/// Body width of a fixed-width kind, `None` for byte strings
pub fn fixed_width(kind: ParamKind) -> Option<usize> {
    match kind {
        ParamKind::Bool => Some(1),
        ParamKind::Int => Some(2),
        ParamKind::Bitmask | ParamKind::Float => Some(4),
        ParamKind::Bytes => None,
    }
}

/// Encode a value with its size prefix
///
/// Byte strings longer than [`MAX_VALUE_LEN`] are rejected.
pub fn encode_value(value: &ParamValue) -> Result<Vec<u8>, ParameterError> {
    let body: Vec<u8> = match value {
        ParamValue::Bool(v) => vec![u8::from(*v)],
        ParamValue::Int(v) => v.to_le_bytes().to_vec(),
        ParamValue::Bitmask(v) => v.to_le_bytes().to_vec(),
        ParamValue::Float(v) => v.to_le_bytes().to_vec(),
        ParamValue::Bytes(v) if v.len() > MAX_VALUE_LEN => {
            return Err(ParameterError::OutOfRange {
                name: "byte string".to_string(),
                value: format!("of {} bytes", v.len()),
            })
        }
        ParamValue::Bytes(v) => v.clone(),
    };
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(body.len() as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a size-prefixed value for `def`
///
/// The slice must contain exactly one encoded value.
pub fn decode_value(def: &ParamDef, bytes: &[u8]) -> Result<ParamValue, ParameterError> {
    let fail = |reason: String| ParameterError::DecodeError { id: def.id, reason };

    let (&size, body) = bytes
        .split_first()
        .ok_or_else(|| fail("empty value".to_string()))?;
    if body.len() != size as usize {
        return Err(fail(format!(
            "size prefix says {} bytes, {} present",
            size,
            body.len()
        )));
    }
    if let Some(width) = fixed_width(def.kind) {
        if body.len() != width {
            return Err(fail(format!(
                "{} needs {} bytes, got {}",
                def.kind,
                width,
                body.len()
            )));
        }
    }

    let value = match def.kind {
        ParamKind::Bool => match body[0] {
            0 => ParamValue::Bool(false),
            1 => ParamValue::Bool(true),
            other => return Err(fail(format!("invalid bool byte 0x{:02x}", other))),
        },
        ParamKind::Int => ParamValue::Int(i16::from_le_bytes([body[0], body[1]])),
        ParamKind::Bitmask => {
            ParamValue::Bitmask(u32::from_le_bytes([body[0], body[1], body[2], body[3]]))
        }
        ParamKind::Float => {
            let v = f32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            if !v.is_finite() {
                return Err(fail("non-finite float".to_string()));
            }
            ParamValue::Float(v)
        }
        ParamKind::Bytes => ParamValue::Bytes(body.to_vec()),
    };
    Ok(value)
}

/// Split the first size-prefixed value off `buf`
///
/// Returns the encoded value (prefix included) and the remainder, or `None`
/// if `buf` is too short.
pub fn split_value(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let size = *buf.first()? as usize;
    if buf.len() < size + 1 {
        return None;
    }
    Some(buf.split_at(size + 1))
}
