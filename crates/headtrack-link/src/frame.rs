//! Wire framing
//!
//! ```text
//! 0xA5 | code:u8 | len:u16 LE | payload[len] | checksum
//! ```
//!
//! The checksum covers code, len and payload. It is a one byte wrapping sum
//! until the handshake negotiates CRC-16/XMODEM (two bytes LE). HELLO
//! frames always use the byte sum so a client can talk to any revision.

use crc::{Crc, CRC_16_XMODEM};
use thiserror::Error;
use tracing::trace;

pub const SYNC: u8 = 0xA5;

/// Sync byte, code and length
pub const HEADER_LEN: usize = 4;

/// Set on the code of every response frame
pub const RESPONSE_BIT: u8 = 0x80;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Hello = 0x01,
    GetParam = 0x02,
    SetParam = 0x03,
    GetAll = 0x04,
    SaveToFlash = 0x05,
    Reboot = 0x06,
    Erase = 0x07,
    Ping = 0x08,
    CalibrateGyro = 0x10,
    CalibrateAccel = 0x11,
    CalibrateMag = 0x12,
    ResetCenter = 0x13,
    StreamConfig = 0x14,
    StreamData = 0x20,
    Log = 0x21,
    Event = 0x22,
    Nak = 0x7F,
}

impl Opcode {
    pub fn from_code(code: u8) -> Option<Self> {
        let op = match code {
            0x01 => Self::Hello,
            0x02 => Self::GetParam,
            0x03 => Self::SetParam,
            0x04 => Self::GetAll,
            0x05 => Self::SaveToFlash,
            0x06 => Self::Reboot,
            0x07 => Self::Erase,
            0x08 => Self::Ping,
            0x10 => Self::CalibrateGyro,
            0x11 => Self::CalibrateAccel,
            0x12 => Self::CalibrateMag,
            0x13 => Self::ResetCenter,
            0x14 => Self::StreamConfig,
            0x20 => Self::StreamData,
            0x21 => Self::Log,
            0x22 => Self::Event,
            0x7F => Self::Nak,
            _ => return None,
        };
        Some(op)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Frames the board sends on its own, outside any request
    pub fn is_unsolicited(self) -> bool {
        matches!(self, Self::StreamData | Self::Log | Self::Event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Sum8,
    Crc16,
}

impl ChecksumKind {
    pub fn width(self) -> usize {
        match self {
            Self::Sum8 => 1,
            Self::Crc16 => 2,
        }
    }

    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            Self::Sum8 => u16::from(data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))),
            Self::Crc16 => CRC16.checksum(data),
        }
    }

    /// Kind used for a frame with `code` once `negotiated` is in effect
    pub fn for_code(code: u8, negotiated: ChecksumKind) -> ChecksumKind {
        if code & !RESPONSE_BIT == Opcode::Hello.code() {
            ChecksumKind::Sum8
        } else {
            negotiated
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opcode, with [`RESPONSE_BIT`] set on responses
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(op: Opcode, payload: Vec<u8>) -> Self {
        Self {
            code: op.code(),
            payload,
        }
    }

    pub fn response(op: Opcode, payload: Vec<u8>) -> Self {
        Self {
            code: op.code() | RESPONSE_BIT,
            payload,
        }
    }

    pub fn nak(op: Opcode, code: u8) -> Self {
        Self {
            code: Opcode::Nak.code(),
            payload: vec![op.code(), code],
        }
    }

    pub fn is_response(&self) -> bool {
        self.code & RESPONSE_BIT != 0
    }

    /// Opcode with the response bit stripped
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_code(self.code & !RESPONSE_BIT)
    }

    /// Serialize with the checksum `negotiated` selects for this frame
    pub fn encode(&self, negotiated: ChecksumKind) -> Vec<u8> {
        let kind = ChecksumKind::for_code(self.code, negotiated);
        let len = self.payload.len() as u16;

        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + kind.width());
        out.push(SYNC);
        out.push(self.code);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.payload);

        let sum = kind.compute(&out[1..]);
        match kind {
            ChecksumKind::Sum8 => out.push(sum as u8),
            ChecksumKind::Crc16 => out.extend_from_slice(&sum.to_le_bytes()),
        }
        out
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Checksum mismatch on frame 0x{code:02x}: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { code: u8, expected: u16, actual: u16 },
    #[error("Frame 0x{code:02x} declares {len} payload bytes, limit is {max}")]
    Oversize { code: u8, len: usize, max: usize },
}

/// Incremental decoder over a byte stream
///
/// Bytes before a sync byte are discarded. A frame that fails its checksum
/// or declares an impossible length costs only its sync byte, so decoding
/// resynchronizes on the next sync byte in the stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    checksum: ChecksumKind,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(checksum: ChecksumKind, max_payload: u16) -> Self {
        Self {
            buf: Vec::new(),
            checksum,
            max_payload: max_payload as usize,
        }
    }

    pub fn set_checksum(&mut self, kind: ChecksumKind) {
        self.checksum = kind;
    }

    pub fn set_max_payload(&mut self, max: u16) {
        self.max_payload = max as usize;
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next frame out of the buffer
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        let start = self.buf.iter().position(|b| *b == SYNC);
        match start {
            Some(0) => {}
            Some(n) => {
                trace!(skipped = n, "Discarding bytes before sync");
                self.buf.drain(..n);
            }
            None => {
                self.buf.clear();
                return None;
            }
        }

        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let code = self.buf[1];
        let len = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
        if len > self.max_payload {
            self.buf.drain(..1);
            return Some(Err(FrameError::Oversize {
                code,
                len,
                max: self.max_payload,
            }));
        }

        let kind = ChecksumKind::for_code(code, self.checksum);
        let total = HEADER_LEN + len + kind.width();
        if self.buf.len() < total {
            return None;
        }

        let body_end = HEADER_LEN + len;
        let expected = kind.compute(&self.buf[1..body_end]);
        let actual = match kind {
            ChecksumKind::Sum8 => u16::from(self.buf[body_end]),
            ChecksumKind::Crc16 => u16::from_le_bytes([self.buf[body_end], self.buf[body_end + 1]]),
        };
        if expected != actual {
            self.buf.drain(..1);
            return Some(Err(FrameError::ChecksumMismatch {
                code,
                expected,
                actual,
            }));
        }

        let payload = self.buf[HEADER_LEN..body_end].to_vec();
        self.buf.drain(..total);
        Some(Ok(Frame { code, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_sum8() {
        let bytes = Frame::request(Opcode::GetParam, vec![0x02, 0x00]).encode(ChecksumKind::Sum8);
        assert_eq!(bytes, vec![0xA5, 0x02, 0x02, 0x00, 0x02, 0x00, 0x06]);
    }

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(ChecksumKind::Crc16.compute(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_hello_always_uses_sum8() {
        let bytes = Frame::request(Opcode::Hello, vec![]).encode(ChecksumKind::Crc16);
        assert_eq!(bytes.len(), HEADER_LEN + 1);
        let bytes = Frame::request(Opcode::Ping, vec![]).encode(ChecksumKind::Crc16);
        assert_eq!(bytes.len(), HEADER_LEN + 2);
    }

    #[test]
    fn test_decoder_handles_split_input_and_noise() {
        let frame = Frame::response(Opcode::GetAll, vec![1, 2, 3, 4]);
        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend(frame.encode(ChecksumKind::Crc16));

        let mut decoder = FrameDecoder::new(ChecksumKind::Crc16, 256);
        let (a, b) = stream.split_at(6);
        decoder.extend(a);
        assert!(decoder.next_frame().is_none());
        decoder.extend(b);
        assert_eq!(decoder.next_frame(), Some(Ok(frame)));
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_drops_corrupt_frame_and_resyncs() {
        let good = Frame::response(Opcode::Ping, vec![]);
        let mut corrupt = Frame::response(Opcode::GetParam, vec![9, 9]).encode(ChecksumKind::Sum8);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new(ChecksumKind::Sum8, 256);
        decoder.extend(&corrupt);
        decoder.extend(&good.encode(ChecksumKind::Sum8));

        assert!(matches!(
            decoder.next_frame(),
            Some(Err(FrameError::ChecksumMismatch { code: 0x82, .. }))
        ));
        assert_eq!(decoder.next_frame(), Some(Ok(good)));
    }

    #[test]
    fn test_decoder_rejects_oversize_length() {
        let frame = Frame::response(Opcode::GetAll, vec![0; 40]).encode(ChecksumKind::Sum8);
        let mut decoder = FrameDecoder::new(ChecksumKind::Sum8, 32);
        decoder.extend(&frame);
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(FrameError::Oversize { len: 40, max: 32, .. }))
        ));
    }

    #[test]
    fn test_opcode_codes() {
        for code in 0u8..=0xFF {
            if let Some(op) = Opcode::from_code(code) {
                assert_eq!(op.code(), code);
            }
        }
        assert!(Opcode::StreamData.is_unsolicited());
        assert!(!Opcode::GetAll.is_unsolicited());
        let resp = Frame::response(Opcode::Hello, vec![]);
        assert!(resp.is_response());
        assert_eq!(resp.opcode(), Some(Opcode::Hello));
    }
}
