//! In-memory simulated board
//!
//! Speaks the same framing as real firmware over a `tokio::io::duplex`
//! pipe. Tests use the [`SimHandle`] to make the board go silent, corrupt
//! responses, delay replies, or push unsolicited frames.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use headtrack_core::board::{BoardIdentity, BoardType, DEFAULT_MAX_PAYLOAD};
use headtrack_core::codec::{decode_value, encode_value};
use headtrack_core::param::{Bounds, ParamDef, ParamKind};
use headtrack_core::{ParamId, ParamValue, Sample, Schema};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::frame::{ChecksumKind, Frame, FrameDecoder, Opcode, SYNC};
use crate::messages::{self, nak};
use crate::transport::SerialIo;

/// Value a freshly erased board reports for `def`
pub fn factory_value(def: &ParamDef) -> ParamValue {
    match (def.kind, def.bounds) {
        (ParamKind::Int, Bounds::Int { min, max }) => {
            if (min..=max).contains(&1500) {
                ParamValue::Int(1500)
            } else {
                ParamValue::Int(0i16.clamp(min, max))
            }
        }
        (ParamKind::Int, _) => ParamValue::Int(0),
        (ParamKind::Float, Bounds::Float { min, max }) => ParamValue::Float(1.0f32.clamp(min, max)),
        (ParamKind::Float, _) => ParamValue::Float(1.0),
        (ParamKind::Bool, _) => ParamValue::Bool(false),
        (ParamKind::Bitmask, _) => ParamValue::Bitmask(0),
        (ParamKind::Bytes, Bounds::MaxLen(len)) => ParamValue::Bytes(vec![1; len as usize]),
        (ParamKind::Bytes, _) => ParamValue::Bytes(Vec::new()),
    }
}

/// Board configuration before it is started
#[derive(Debug, Clone)]
pub struct SimBoard {
    pub board: BoardType,
    pub protocol_version: u8,
    pub max_payload: u16,
    pub firmware_version: String,
    values: BTreeMap<ParamId, Vec<u8>>,
}

impl SimBoard {
    pub fn new(board: BoardType, protocol_version: u8) -> Self {
        let values = Schema::for_board(board)
            .iter()
            .filter_map(|d| Some((d.id, encode_value(&factory_value(d)).ok()?)))
            .collect();
        Self {
            board,
            protocol_version,
            max_payload: DEFAULT_MAX_PAYLOAD,
            firmware_version: "v2.2.1".to_string(),
            values,
        }
    }

    /// Preload a parameter value
    pub fn with_value(mut self, id: ParamId, value: ParamValue) -> Self {
        if let Ok(bytes) = encode_value(&value) {
            self.values.insert(id, bytes);
        }
        self
    }

    pub fn param_count(&self) -> usize {
        self.values.len()
    }

    pub fn identity(&self) -> BoardIdentity {
        BoardIdentity {
            board: self.board,
            protocol_version: self.protocol_version,
            capabilities: self.board.features(),
            max_payload: self.max_payload,
            firmware_version: self.firmware_version.clone(),
        }
    }

    /// Start the board; returns the host end of the pipe
    pub fn spawn(self) -> (Box<dyn SerialIo>, SimHandle) {
        let (host, device) = tokio::io::duplex(4096);
        let (rx, tx) = tokio::io::split(device);

        let state = Arc::new(SimState {
            identity: self.identity(),
            schema: Schema::for_board(self.board),
            values: std::sync::Mutex::new(self.values),
            crc: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            corrupt: AtomicU32::new(0),
            short_acks: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            stream_mask: AtomicU32::new(0),
            counts: (0..=u8::MAX).map(|_| AtomicUsize::new(0)).collect(),
        });
        let writer = Arc::new(Mutex::new(Some(tx)));
        let task = tokio::spawn(run(rx, state.clone(), writer.clone()));

        (Box::new(host), SimHandle { state, writer, task })
    }
}

struct SimState {
    identity: BoardIdentity,
    schema: Schema,
    values: std::sync::Mutex<BTreeMap<ParamId, Vec<u8>>>,
    crc: AtomicBool,
    silent: AtomicBool,
    corrupt: AtomicU32,
    /// Acknowledge only the first entry of each SET_PARAM
    short_acks: AtomicBool,
    delay_ms: AtomicU64,
    stream_mask: AtomicU32,
    counts: Vec<AtomicUsize>,
}

impl SimState {
    fn checksum(&self) -> ChecksumKind {
        if self.crc.load(Ordering::Acquire) {
            ChecksumKind::Crc16
        } else {
            ChecksumKind::Sum8
        }
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<ParamId, Vec<u8>>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond(&self, op: Opcode, payload: &[u8]) -> Frame {
        match op {
            Opcode::Hello => Frame::response(op, messages::encode_hello(&self.identity)),
            Opcode::Ping
            | Opcode::SaveToFlash
            | Opcode::Reboot
            | Opcode::ResetCenter
            | Opcode::CalibrateGyro
            | Opcode::CalibrateAccel
            | Opcode::CalibrateMag => Frame::response(op, Vec::new()),
            Opcode::Erase => {
                let mut values = self.values();
                for def in self.schema.iter() {
                    if let Ok(bytes) = encode_value(&factory_value(def)) {
                        values.insert(def.id, bytes);
                    }
                }
                Frame::response(op, Vec::new())
            }
            Opcode::StreamConfig => match <[u8; 4]>::try_from(payload) {
                Ok(mask) => {
                    self.stream_mask.store(u32::from_le_bytes(mask), Ordering::Release);
                    Frame::response(op, Vec::new())
                }
                Err(_) => Frame::nak(op, nak::BAD_VALUE),
            },
            Opcode::GetParam => {
                let Ok(id) = messages::parse_param_id(payload) else {
                    return Frame::nak(op, nak::BAD_VALUE);
                };
                match self.values().get(&id) {
                    Some(value) => {
                        let mut out = messages::encode_param_id(id);
                        out.extend_from_slice(value);
                        Frame::response(op, out)
                    }
                    None => Frame::nak(op, nak::UNKNOWN_PARAM),
                }
            }
            Opcode::SetParam => {
                let Ok(entries) = messages::parse_entries(payload) else {
                    return Frame::nak(op, nak::BAD_VALUE);
                };
                for (id, bytes) in &entries {
                    let Some(def) = self.schema.get(*id) else {
                        return Frame::nak(op, nak::UNKNOWN_PARAM);
                    };
                    if decode_value(def, bytes).is_err() {
                        return Frame::nak(op, nak::BAD_VALUE);
                    }
                }
                let mut ids: Vec<ParamId> = entries.iter().map(|(id, _)| *id).collect();
                if self.short_acks.load(Ordering::Acquire) {
                    ids.truncate(1);
                }
                self.values().extend(entries);
                Frame::response(op, messages::encode_param_ids(ids))
            }
            Opcode::GetAll => {
                let Ok(start) = messages::parse_param_id(payload) else {
                    return Frame::nak(op, nak::BAD_VALUE);
                };
                let max = self.identity.max_payload as usize;
                let values = self.values();
                let mut out = vec![0u8];
                let mut more = false;
                for (id, value) in values.range(start..) {
                    if out.len() + 2 + value.len() > max {
                        more = true;
                        break;
                    }
                    out.extend_from_slice(&id.0.to_le_bytes());
                    out.extend_from_slice(value);
                }
                out[0] = u8::from(more);
                Frame::response(op, out)
            }
            _ => Frame::nak(op, nak::UNKNOWN_OPCODE),
        }
    }
}

type SharedWriter = Arc<Mutex<Option<WriteHalf<DuplexStream>>>>;

async fn write_frame(writer: &SharedWriter, bytes: &[u8]) {
    if let Some(w) = writer.lock().await.as_mut() {
        let _ = w.write_all(bytes).await;
    }
}

/// Damage checksum bytes so they can never match or look like a sync byte
fn corrupt(bytes: &mut [u8], kind: ChecksumKind) {
    let start = bytes.len() - kind.width();
    for b in &mut bytes[start..] {
        *b = if !*b == SYNC { *b ^ 0x0F } else { !*b };
    }
}

async fn run(mut rx: ReadHalf<DuplexStream>, state: Arc<SimState>, writer: SharedWriter) {
    let mut decoder = FrameDecoder::new(ChecksumKind::Sum8, state.identity.max_payload.max(DEFAULT_MAX_PAYLOAD));
    let mut buf = [0u8; 512];

    loop {
        let n = match rx.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        decoder.set_checksum(state.checksum());
        decoder.extend(&buf[..n]);

        while let Some(item) = decoder.next_frame() {
            let Ok(frame) = item else { continue };
            let Some(op) = frame.opcode() else { continue };
            state.counts[op.code() as usize].fetch_add(1, Ordering::AcqRel);
            trace!(opcode = ?op, "Simulated board received request");

            if state.silent.load(Ordering::Acquire) {
                continue;
            }

            let reply = state.respond(op, &frame.payload);
            let delay = state.delay_ms.load(Ordering::Acquire);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let kind = state.checksum();
            let mut bytes = reply.encode(kind);
            let damage = state
                .corrupt
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if damage {
                corrupt(&mut bytes, ChecksumKind::for_code(reply.code, kind));
            }
            write_frame(&writer, &bytes).await;

            if op == Opcode::Hello && state.identity.uses_crc() {
                state.crc.store(true, Ordering::Release);
                decoder.set_checksum(ChecksumKind::Crc16);
            }
        }
    }
}

/// Control surface for a running simulated board
pub struct SimHandle {
    state: Arc<SimState>,
    writer: SharedWriter,
    task: JoinHandle<()>,
}

impl SimHandle {
    /// Stop answering; requests are still counted
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::Release);
    }

    /// Send the next `n` responses with a bad checksum
    pub fn corrupt_next(&self, n: u32) {
        self.state.corrupt.store(n, Ordering::Release);
    }

    /// Apply every SET_PARAM entry but acknowledge only the first
    pub fn set_short_acks(&self, short: bool) {
        self.state.short_acks.store(short, Ordering::Release);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::Release);
    }

    /// How many requests with `op` the board has received
    pub fn requests(&self, op: Opcode) -> usize {
        self.state.counts[op.code() as usize].load(Ordering::Acquire)
    }

    /// Encoded value the board currently holds
    pub fn value(&self, id: ParamId) -> Option<Vec<u8>> {
        self.state.values().get(&id).cloned()
    }

    pub fn stream_mask(&self) -> u32 {
        self.state.stream_mask.load(Ordering::Acquire)
    }

    pub async fn send_frame(&self, frame: Frame) {
        let bytes = frame.encode(self.state.checksum());
        write_frame(&self.writer, &bytes).await;
    }

    pub async fn send_samples(&self, samples: &[Sample]) {
        self.send_frame(Frame::request(
            Opcode::StreamData,
            messages::encode_stream_data(samples),
        ))
        .await;
    }

    pub async fn send_log(&self, line: &str) {
        self.send_frame(Frame::request(Opcode::Log, line.as_bytes().to_vec()))
            .await;
    }

    /// Close the pipe as if the cable was pulled
    pub async fn shutdown(self) {
        self.writer.lock().await.take();
        self.task.abort();
        let _ = self.task.await;
    }
}
