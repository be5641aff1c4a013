//! Request and response payloads

use chrono::{DateTime, Utc};
use headtrack_core::board::{BoardIdentity, BoardType, Capabilities};
use headtrack_core::codec::split_value;
use headtrack_core::{DataItem, ParamId, Sample, WireFrame};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::{Frame, Opcode};
use crate::link::ProtocolError;

/// NAK reason codes
pub mod nak {
    /// The board saw a bad checksum on our request
    pub const CHECKSUM: u8 = 0x01;
    pub const UNKNOWN_OPCODE: u8 = 0x02;
    pub const UNKNOWN_PARAM: u8 = 0x03;
    pub const BAD_VALUE: u8 = 0x04;
    pub const BUSY: u8 = 0x05;
}

/// What the board reported in an EVENT frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// The board re-centered its outputs
    CenterReset { trigger: ResetTrigger },
    /// Calibration data was written by the board itself
    CalibrationSaved,
    Unknown { code: u8, arg: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetTrigger {
    Button,
    Proximity,
    DoubleTap,
    Tilt,
    Host,
    Other,
}

/// Unsolicited traffic from the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    Data {
        at: DateTime<Utc>,
        samples: Vec<Sample>,
    },
    Log {
        at: DateTime<Utc>,
        line: String,
    },
    Device {
        at: DateTime<Utc>,
        event: DeviceEvent,
    },
}

fn malformed(what: &str, payload: &[u8]) -> ProtocolError {
    ProtocolError::Malformed(format!("{} ({} bytes)", what, payload.len()))
}

/// HELLO response body
pub fn encode_hello(identity: &BoardIdentity) -> Vec<u8> {
    let fw = identity.firmware_version.as_bytes();
    let fw = &fw[..fw.len().min(u8::MAX as usize)];

    let mut out = Vec::with_capacity(7 + fw.len());
    out.push(identity.board.to_wire());
    out.push(identity.protocol_version);
    out.extend_from_slice(&identity.capabilities.bits().to_le_bytes());
    out.extend_from_slice(&identity.max_payload.to_le_bytes());
    out.push(fw.len() as u8);
    out.extend_from_slice(fw);
    out
}

/// Parse a HELLO response
///
/// Unknown capability bits are dropped. The protocol version is not checked
/// here.
pub fn parse_hello(payload: &[u8]) -> Result<BoardIdentity, ProtocolError> {
    if payload.len() < 7 {
        return Err(malformed("short HELLO response", payload));
    }
    let board = BoardType::from_wire(payload[0])
        .ok_or_else(|| ProtocolError::UnsupportedBoard(format!("board type {}", payload[0])))?;
    let protocol_version = payload[1];
    let capabilities = Capabilities::from_bits_truncate(u16::from_le_bytes([payload[2], payload[3]]));
    let max_payload = u16::from_le_bytes([payload[4], payload[5]]);
    let fw_len = payload[6] as usize;
    let fw = payload
        .get(7..7 + fw_len)
        .ok_or_else(|| malformed("truncated firmware version", payload))?;

    Ok(BoardIdentity {
        board,
        protocol_version,
        capabilities,
        max_payload,
        firmware_version: String::from_utf8_lossy(fw).into_owned(),
    })
}

pub fn encode_param_id(id: ParamId) -> Vec<u8> {
    id.0.to_le_bytes().to_vec()
}

pub fn parse_param_id(payload: &[u8]) -> Result<ParamId, ProtocolError> {
    match payload {
        [lo, hi, ..] => Ok(ParamId(u16::from_le_bytes([*lo, *hi]))),
        _ => Err(malformed("missing parameter id", payload)),
    }
}

/// SET_PARAM acknowledgement: the ids written, in request order
pub fn encode_param_ids(ids: impl IntoIterator<Item = ParamId>) -> Vec<u8> {
    ids.into_iter().flat_map(|id| id.0.to_le_bytes()).collect()
}

pub fn parse_param_ids(payload: &[u8]) -> Result<Vec<ParamId>, ProtocolError> {
    if payload.len() % 2 != 0 {
        return Err(malformed("odd parameter id list", payload));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| ParamId(u16::from_le_bytes([c[0], c[1]])))
        .collect())
}

/// Parse repeated `id:u16 | value` entries
pub fn parse_entries(mut buf: &[u8]) -> Result<Vec<(ParamId, Vec<u8>)>, ProtocolError> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        let id = parse_param_id(buf)?;
        let (value, rest) =
            split_value(&buf[2..]).ok_or_else(|| malformed("truncated parameter value", buf))?;
        entries.push((id, value.to_vec()));
        buf = rest;
    }
    Ok(entries)
}

/// GET_PARAM response: a single entry
pub fn parse_get_param(payload: &[u8]) -> Result<(ParamId, Vec<u8>), ProtocolError> {
    let mut entries = parse_entries(payload)?;
    match (entries.pop(), entries.is_empty()) {
        (Some(entry), true) => Ok(entry),
        _ => Err(malformed("expected exactly one parameter", payload)),
    }
}

/// Split frames into SET_PARAM payloads that each fit `max_payload`
///
/// Entries are never split across payloads and keep their order.
pub fn encode_set_chunks(frames: &[WireFrame], max_payload: usize) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut chunks = Vec::new();
    let mut current: Vec<u8> = Vec::new();

    for frame in frames {
        let entry_len = 2 + frame.bytes.len();
        if entry_len > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: entry_len,
                max: max_payload,
            });
        }
        if current.len() + entry_len > max_payload {
            chunks.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&frame.id.0.to_le_bytes());
        current.extend_from_slice(&frame.bytes);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    debug!(entries = frames.len(), chunks = chunks.len(), "Built SET_PARAM payloads");
    Ok(chunks)
}

/// One GET_ALL page
#[derive(Debug, Clone, PartialEq)]
pub struct GetAllPage {
    pub more: bool,
    pub entries: Vec<(ParamId, Vec<u8>)>,
}

pub fn parse_get_all(payload: &[u8]) -> Result<GetAllPage, ProtocolError> {
    let (&more, rest) = payload
        .split_first()
        .ok_or_else(|| malformed("empty GET_ALL page", payload))?;
    Ok(GetAllPage {
        more: more != 0,
        entries: parse_entries(rest)?,
    })
}

pub fn encode_stream_config(items: &[DataItem]) -> Vec<u8> {
    DataItem::mask(items.iter().copied()).to_le_bytes().to_vec()
}

/// Decode repeated `item:u8 | f32` readings, skipping items we do not know
pub fn parse_stream_data(payload: &[u8]) -> Result<Vec<Sample>, ProtocolError> {
    if payload.len() % 5 != 0 {
        return Err(malformed("stream data not a multiple of 5 bytes", payload));
    }
    Ok(payload
        .chunks_exact(5)
        .filter_map(|c| {
            let item = DataItem::from_wire(c[0])?;
            let value = f32::from_le_bytes([c[1], c[2], c[3], c[4]]);
            Some(Sample { item, value })
        })
        .collect())
}

pub fn encode_stream_data(samples: &[Sample]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 5);
    for s in samples {
        out.push(s.item as u8);
        out.extend_from_slice(&s.value.to_le_bytes());
    }
    out
}

pub fn parse_event(payload: &[u8]) -> Result<DeviceEvent, ProtocolError> {
    let (code, arg) = match payload {
        [code] => (*code, 0),
        [code, arg, ..] => (*code, *arg),
        [] => return Err(malformed("empty event", payload)),
    };
    let event = match code {
        0x01 => DeviceEvent::CenterReset {
            trigger: match arg {
                0 => ResetTrigger::Button,
                1 => ResetTrigger::Proximity,
                2 => ResetTrigger::DoubleTap,
                3 => ResetTrigger::Tilt,
                4 => ResetTrigger::Host,
                _ => ResetTrigger::Other,
            },
        },
        0x02 => DeviceEvent::CalibrationSaved,
        _ => DeviceEvent::Unknown { code, arg },
    };
    Ok(event)
}

/// Turn an unsolicited frame into a stream event
///
/// Returns `None` for frames that are not unsolicited.
pub fn parse_unsolicited(frame: &Frame) -> Option<Result<StreamEvent, ProtocolError>> {
    let at = Utc::now();
    let event = match Opcode::from_code(frame.code)? {
        Opcode::StreamData => {
            parse_stream_data(&frame.payload).map(|samples| StreamEvent::Data { at, samples })
        }
        Opcode::Log => Ok(StreamEvent::Log {
            at,
            line: String::from_utf8_lossy(&frame.payload).trim_end().to_string(),
        }),
        Opcode::Event => parse_event(&frame.payload).map(|event| StreamEvent::Device { at, event }),
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use headtrack_core::codec::encode_value;
    use headtrack_core::ParamValue;

    fn identity() -> BoardIdentity {
        BoardIdentity {
            board: BoardType::Nano33Ble,
            protocol_version: 2,
            capabilities: Capabilities::MAGNETOMETER | Capabilities::STREAM,
            max_payload: 128,
            firmware_version: "v2.2.1".to_string(),
        }
    }

    #[test]
    fn test_set_ack_ids() {
        let bytes = encode_param_ids([ParamId(2), ParamId(300)]);
        assert_eq!(bytes, vec![2, 0, 0x2c, 0x01]);
        assert_eq!(parse_param_ids(&bytes).unwrap(), vec![ParamId(2), ParamId(300)]);
        assert!(parse_param_ids(&[]).unwrap().is_empty());
        assert!(matches!(parse_param_ids(&[2, 0, 1]), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_hello_layout() {
        let bytes = encode_hello(&identity());
        assert_eq!(&bytes[..7], &[1, 2, 0x21, 0x00, 128, 0, 6]);
        assert_eq!(parse_hello(&bytes).unwrap(), identity());
    }

    #[test]
    fn test_hello_rejects_unknown_board_and_truncation() {
        let mut bytes = encode_hello(&identity());
        bytes[0] = 42;
        assert!(matches!(parse_hello(&bytes), Err(ProtocolError::UnsupportedBoard(_))));
        assert!(matches!(parse_hello(&[1, 2, 0]), Err(ProtocolError::Malformed(_))));

        let mut bytes = encode_hello(&identity());
        bytes.truncate(9);
        assert!(matches!(parse_hello(&bytes), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_set_chunks_respect_max_payload() {
        let frames: Vec<WireFrame> = (1..=10)
            .map(|i| WireFrame {
                id: ParamId(i),
                bytes: encode_value(&ParamValue::Float(i as f32)).unwrap(),
            })
            .collect();
        // Each entry is 2 + 5 bytes
        let chunks = encode_set_chunks(&frames, 21).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 21));

        let rejoined: Vec<_> = chunks.iter().flat_map(|c| parse_entries(c).unwrap()).collect();
        assert_eq!(rejoined.len(), 10);
        assert_eq!(rejoined[9].0, ParamId(10));

        assert!(matches!(
            encode_set_chunks(&frames, 6),
            Err(ProtocolError::PayloadTooLarge { len: 7, max: 6 })
        ));
    }

    #[test]
    fn test_get_all_page() {
        let mut payload = vec![1];
        payload.extend_from_slice(&[2, 0]);
        payload.extend(encode_value(&ParamValue::Float(2.5)).unwrap());
        payload.extend_from_slice(&[19, 0]);
        payload.extend(encode_value(&ParamValue::Bool(true)).unwrap());

        let page = parse_get_all(&payload).unwrap();
        assert!(page.more);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[1], (ParamId(19), vec![1, 1]));

        // Value cut short
        assert!(parse_get_all(&payload[..payload.len() - 1]).is_err());
    }

    #[test]
    fn test_get_param_needs_one_entry() {
        let mut payload = encode_param_id(ParamId(6));
        payload.extend(encode_value(&ParamValue::Int(1500)).unwrap());
        assert_eq!(parse_get_param(&payload).unwrap().0, ParamId(6));
        assert!(parse_get_param(&[]).is_err());
    }

    #[test]
    fn test_stream_data_skips_unknown_items() {
        let mut payload = encode_stream_data(&[Sample {
            item: DataItem::Tilt,
            value: 12.5,
        }]);
        payload.extend_from_slice(&[200, 0, 0, 0, 0]);
        let samples = parse_stream_data(&payload).unwrap();
        assert_eq!(samples, vec![Sample { item: DataItem::Tilt, value: 12.5 }]);
        assert!(parse_stream_data(&[0, 1]).is_err());
    }

    #[test]
    fn test_unsolicited_frames() {
        let log = Frame::request(Opcode::Log, b"Gyro calibrated\r\n".to_vec());
        match parse_unsolicited(&log) {
            Some(Ok(StreamEvent::Log { line, .. })) => assert_eq!(line, "Gyro calibrated"),
            other => panic!("unexpected {:?}", other),
        }

        let event = Frame::request(Opcode::Event, vec![0x01, 2]);
        assert!(matches!(
            parse_unsolicited(&event),
            Some(Ok(StreamEvent::Device {
                event: DeviceEvent::CenterReset { trigger: ResetTrigger::DoubleTap },
                ..
            }))
        ));

        assert!(parse_unsolicited(&Frame::response(Opcode::Ping, vec![])).is_none());
    }
}
