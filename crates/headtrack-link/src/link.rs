//! BoardLink - reliable request/response over a serial byte stream
//!
//! A background reader task decodes frames and routes them: responses and
//! NAKs complete the single pending request, unsolicited frames go to the
//! stream channel. The link is not pipelined; a second concurrent request
//! is rejected with [`ProtocolError::Busy`].

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::Stream;
use headtrack_core::board::{BoardIdentity, DEFAULT_MAX_PAYLOAD};
use headtrack_core::{DataItem, ParamId, ParameterError, WireFrame};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::frame::{ChecksumKind, Frame, FrameDecoder, Opcode, RESPONSE_BIT};
use crate::messages::{self, nak, StreamEvent};
use crate::transport::SerialIo;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Request timed out")]
    Timeout,
    #[error("Board rejected the request (code 0x{code:02x})")]
    Nak { code: u8 },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Another request is already in flight")]
    Busy,
    #[error("No board answered the handshake")]
    NoBoard,
    #[error("Unsupported board: {0}")]
    UnsupportedBoard(String),
    #[error("Payload of {len} bytes exceeds the board limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Link lost")]
    LinkLost,
    #[error("Link closed")]
    Closed,
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link health notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Too many consecutive requests went unanswered
    LinkLost,
    /// The byte stream ended or failed
    Closed,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub handshake_retries: u32,
    /// Automatic resends of a request that timed out
    pub request_retries: u32,
    pub max_consecutive_timeouts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(800),
            handshake_timeout: Duration::from_millis(2000),
            handshake_retries: 3,
            request_retries: 1,
            max_consecutive_timeouts: 3,
        }
    }
}

/// Which calibration routine to start on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationKind {
    Gyro,
    Accel,
    Mag,
}

impl CalibrationKind {
    fn opcode(self) -> Opcode {
        match self {
            Self::Gyro => Opcode::CalibrateGyro,
            Self::Accel => Opcode::CalibrateAccel,
            Self::Mag => Opcode::CalibrateMag,
        }
    }
}

enum Reply {
    Ok(Vec<u8>),
    Nak(u8),
}

struct Pending {
    opcode: u8,
    tx: oneshot::Sender<Reply>,
}

const CHECKSUM_SUM8: u8 = 0;
const CHECKSUM_CRC16: u8 = 1;

/// State shared with the reader task
struct Shared {
    pending: Mutex<Option<Pending>>,
    checksum: AtomicU8,
    max_payload: AtomicU16,
    started: Instant,
    last_rx_ms: AtomicU64,
    consecutive_timeouts: AtomicU32,
    lost: AtomicBool,
    closed: AtomicBool,
    stream_tx: broadcast::Sender<StreamEvent>,
    link_tx: broadcast::Sender<LinkEvent>,
}

impl Shared {
    fn checksum(&self) -> ChecksumKind {
        match self.checksum.load(Ordering::Acquire) {
            CHECKSUM_CRC16 => ChecksumKind::Crc16,
            _ => ChecksumKind::Sum8,
        }
    }

    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_rx_ms.store(ms, Ordering::Release);
    }

    async fn dispatch(&self, frame: Frame) {
        self.touch();

        if let Some(event) = messages::parse_unsolicited(&frame) {
            match event {
                Ok(event) => {
                    // No subscribers is fine
                    let _ = self.stream_tx.send(event);
                }
                Err(e) => warn!(code = frame.code, error = %e, "Dropping bad unsolicited frame"),
            }
            return;
        }

        let (opcode, reply) = if frame.code == Opcode::Nak.code() {
            match frame.payload.as_slice() {
                [op, code, ..] => (*op, Reply::Nak(*code)),
                _ => {
                    warn!(len = frame.payload.len(), "Dropping short NAK");
                    return;
                }
            }
        } else if frame.is_response() {
            (frame.code & !RESPONSE_BIT, Reply::Ok(frame.payload))
        } else {
            warn!(code = frame.code, "Dropping unexpected frame from board");
            return;
        };

        let mut pending = self.pending.lock().await;
        match pending.take() {
            Some(p) if p.opcode == opcode => {
                trace!(opcode, "Response matched pending request");
                let _ = p.tx.send(reply);
            }
            other => {
                debug!(opcode, "Response with no matching request");
                *pending = other;
            }
        }
    }
}

/// Request/response engine for one open transport
pub struct BoardLink {
    writer: Mutex<WriteHalf<Box<dyn SerialIo>>>,
    in_flight: Mutex<()>,
    shared: Arc<Shared>,
    identity: RwLock<Option<BoardIdentity>>,
    config: LinkConfig,
    reader: JoinHandle<()>,
}

impl BoardLink {
    /// Start a link with its own stream channel
    pub fn new(io: Box<dyn SerialIo>, config: LinkConfig) -> Self {
        let (stream_tx, _) = broadcast::channel(100);
        Self::with_stream_sender(io, config, stream_tx)
    }

    /// Start a link that publishes unsolicited frames on `stream_tx`
    ///
    /// Passing the same sender to successive links lets subscribers keep a
    /// single receiver across reconnects.
    pub fn with_stream_sender(
        io: Box<dyn SerialIo>,
        config: LinkConfig,
        stream_tx: broadcast::Sender<StreamEvent>,
    ) -> Self {
        let (link_tx, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            checksum: AtomicU8::new(CHECKSUM_SUM8),
            max_payload: AtomicU16::new(DEFAULT_MAX_PAYLOAD),
            started: Instant::now(),
            last_rx_ms: AtomicU64::new(0),
            consecutive_timeouts: AtomicU32::new(0),
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stream_tx,
            link_tx,
        });

        let (rx, tx) = tokio::io::split(io);
        let reader = tokio::spawn(read_loop(rx, shared.clone()));

        Self {
            writer: Mutex::new(tx),
            in_flight: Mutex::new(()),
            shared,
            identity: RwLock::new(None),
            config,
            reader,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Identity from the last successful handshake
    pub async fn identity(&self) -> Option<BoardIdentity> {
        self.identity.read().await.clone()
    }

    pub fn subscribe_stream(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.stream_tx.subscribe()
    }

    /// Unsolicited frames as a stream; lagging consumers skip ahead
    pub fn stream_events(&self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        broadcast_stream(self.subscribe_stream())
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.link_tx.subscribe()
    }

    /// Time since the last valid frame arrived
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.shared.last_rx_ms.load(Ordering::Acquire));
        self.shared.started.elapsed().saturating_sub(last)
    }

    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    pub fn max_payload(&self) -> usize {
        self.shared.max_payload.load(Ordering::Acquire) as usize
    }

    /// Exchange HELLO and switch to the negotiated framing
    pub async fn handshake(&self) -> Result<BoardIdentity, ProtocolError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ProtocolError::Busy)?;

        for attempt in 1..=self.config.handshake_retries.max(1) {
            match self
                .exchange(Opcode::Hello, &[], self.config.handshake_timeout)
                .await
            {
                Ok(payload) => {
                    let identity = messages::parse_hello(&payload)?;
                    if !BoardIdentity::is_supported_version(identity.protocol_version) {
                        return Err(ProtocolError::UnsupportedBoard(format!(
                            "{} speaks protocol version {}",
                            identity.board, identity.protocol_version
                        )));
                    }

                    let kind = if identity.uses_crc() {
                        CHECKSUM_CRC16
                    } else {
                        CHECKSUM_SUM8
                    };
                    self.shared.checksum.store(kind, Ordering::Release);
                    self.shared
                        .max_payload
                        .store(identity.max_payload.max(16), Ordering::Release);
                    self.shared.consecutive_timeouts.store(0, Ordering::Release);

                    info!(
                        board = %identity.board,
                        version = identity.protocol_version,
                        firmware = %identity.firmware_version,
                        crc = identity.uses_crc(),
                        "Handshake complete"
                    );
                    *self.identity.write().await = Some(identity.clone());
                    return Ok(identity);
                }
                Err(ProtocolError::Timeout) => {
                    debug!(attempt, "No HELLO response");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProtocolError::NoBoard)
    }

    /// Send a request and wait for its response payload
    ///
    /// A timeout, or a NAK reporting a checksum error, is retried
    /// automatically before the error is returned.
    pub async fn request(&self, op: Opcode, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ProtocolError::Busy)?;
        self.transact(op, payload, self.config.request_retries, self.config.request_timeout)
            .await
    }

    /// Send a request once with no automatic retry
    pub async fn request_once(&self, op: Opcode, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ProtocolError::Busy)?;
        self.transact(op, payload, 0, self.config.request_timeout).await
    }

    async fn transact(
        &self,
        op: Opcode,
        payload: &[u8],
        retries: u32,
        wait: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        if self.is_lost() {
            return Err(ProtocolError::LinkLost);
        }
        let max = self.max_payload();
        if payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let mut attempt = 0;
        loop {
            match self.exchange(op, payload, wait).await {
                Ok(reply) => {
                    self.shared.consecutive_timeouts.store(0, Ordering::Release);
                    return Ok(reply);
                }
                Err(ProtocolError::Timeout) => {
                    if self.note_timeout(op) {
                        return Err(ProtocolError::LinkLost);
                    }
                    if attempt >= retries {
                        return Err(ProtocolError::Timeout);
                    }
                }
                Err(ProtocolError::Nak { code }) => {
                    self.shared.consecutive_timeouts.store(0, Ordering::Release);
                    if code != nak::CHECKSUM || attempt >= retries {
                        return Err(ProtocolError::Nak { code });
                    }
                }
                Err(e) => return Err(e),
            }
            attempt += 1;
            debug!(opcode = ?op, attempt, "Retrying request");
        }
    }

    /// Count a timeout; returns true once the link has been declared lost
    fn note_timeout(&self, op: Opcode) -> bool {
        let count = self.shared.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(opcode = ?op, consecutive = count, "Request timed out");

        if count >= self.config.max_consecutive_timeouts {
            if !self.shared.lost.swap(true, Ordering::AcqRel) {
                warn!(consecutive = count, "Link lost");
                let _ = self.shared.link_tx.send(LinkEvent::LinkLost);
            }
            return true;
        }
        false
    }

    async fn exchange(&self, op: Opcode, payload: &[u8], wait: Duration) -> Result<Vec<u8>, ProtocolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock().await = Some(Pending {
            opcode: op.code(),
            tx,
        });

        let bytes = Frame::request(op, payload.to_vec()).encode(self.shared.checksum());
        trace!(opcode = ?op, len = bytes.len(), "Sending frame");
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(Reply::Ok(payload))) => Ok(payload),
            Ok(Ok(Reply::Nak(code))) => {
                debug!(opcode = ?op, code, "Request NAKed");
                Err(ProtocolError::Nak { code })
            }
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.shared.pending.lock().await.take();
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Liveness probe; a single PING with no retry
    pub async fn probe(&self) -> Result<(), ProtocolError> {
        self.probe_within(self.config.request_timeout).await
    }

    pub async fn probe_within(&self, wait: Duration) -> Result<(), ProtocolError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ProtocolError::Busy)?;
        self.transact(Opcode::Ping, &[], 0, wait).await.map(|_| ())
    }

    /// Read one parameter's encoded value
    pub async fn get_param(&self, id: ParamId) -> Result<Vec<u8>, ProtocolError> {
        let reply = self
            .request(Opcode::GetParam, &messages::encode_param_id(id))
            .await?;
        let (got, value) = messages::parse_get_param(&reply)?;
        if got != id {
            return Err(ProtocolError::Malformed(format!(
                "asked for parameter {}, got {}",
                id, got
            )));
        }
        Ok(value)
    }

    /// Write parameters, split across as many SET_PARAM frames as needed
    ///
    /// Returns only after every frame has been acknowledged.
    pub async fn set_params(&self, frames: &[WireFrame]) -> Result<(), ProtocolError> {
        let chunks = messages::encode_set_chunks(frames, self.max_payload())?;
        for chunk in &chunks {
            let reply = self.request(Opcode::SetParam, chunk).await?;
            let sent: Vec<ParamId> = messages::parse_entries(chunk)?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            let acked = messages::parse_param_ids(&reply)?;
            if acked != sent {
                return Err(ProtocolError::Malformed(format!(
                    "wrote parameters {:?}, board acknowledged {:?}",
                    sent, acked
                )));
            }
        }
        debug!(params = frames.len(), frames = chunks.len(), "Parameters written");
        Ok(())
    }

    /// Read every parameter, following GET_ALL pages until the board is done
    pub async fn get_all(&self) -> Result<Vec<(ParamId, Vec<u8>)>, ProtocolError> {
        let mut entries = Vec::new();
        let mut start = ParamId(0);
        let mut pages = 0u32;

        loop {
            let reply = self
                .request(Opcode::GetAll, &messages::encode_param_id(start))
                .await?;
            let page = messages::parse_get_all(&reply)?;
            pages += 1;

            let last = page.entries.last().map(|(id, _)| *id);
            entries.extend(page.entries);
            if !page.more {
                break;
            }
            match last {
                Some(id) if id.0 < u16::MAX => start = ParamId(id.0 + 1),
                _ => {
                    return Err(ProtocolError::Malformed(
                        "GET_ALL page promised more but carried no progress".to_string(),
                    ))
                }
            }
        }

        debug!(params = entries.len(), pages, "Read all parameters");
        Ok(entries)
    }

    pub async fn save_to_flash(&self) -> Result<(), ProtocolError> {
        self.request(Opcode::SaveToFlash, &[]).await.map(|_| ())
    }

    pub async fn reboot(&self) -> Result<(), ProtocolError> {
        self.request(Opcode::Reboot, &[]).await.map(|_| ())
    }

    /// Reset every setting on the board to its default
    pub async fn erase(&self) -> Result<(), ProtocolError> {
        self.request(Opcode::Erase, &[]).await.map(|_| ())
    }

    pub async fn reset_center(&self) -> Result<(), ProtocolError> {
        self.request(Opcode::ResetCenter, &[]).await.map(|_| ())
    }

    pub async fn calibrate(&self, kind: CalibrationKind) -> Result<(), ProtocolError> {
        self.request(kind.opcode(), &[]).await.map(|_| ())
    }

    /// Choose which live data items the board streams; empty stops streaming
    pub async fn configure_stream(&self, items: &[DataItem]) -> Result<(), ProtocolError> {
        self.request(Opcode::StreamConfig, &messages::encode_stream_config(items))
            .await
            .map(|_| ())
    }
}

impl Drop for BoardLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut rx: ReadHalf<Box<dyn SerialIo>>, shared: Arc<Shared>) {
    let mut decoder = FrameDecoder::new(shared.checksum(), DEFAULT_MAX_PAYLOAD);
    let mut buf = [0u8; 512];

    loop {
        let n = match rx.read(&mut buf).await {
            Ok(0) => {
                debug!("Transport closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Transport read failed");
                break;
            }
        };
        trace!(len = n, "Received bytes");

        decoder.set_checksum(shared.checksum());
        decoder.set_max_payload(shared.max_payload.load(Ordering::Acquire));
        decoder.extend(&buf[..n]);

        while let Some(item) = decoder.next_frame() {
            match item {
                Ok(frame) => shared.dispatch(frame).await,
                Err(e) => warn!(error = %e, "Dropping frame"),
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
    // Wake any waiter with a closed channel
    shared.pending.lock().await.take();
    let _ = shared.link_tx.send(LinkEvent::Closed);
}

/// Adapt a broadcast receiver into a stream that skips lagged items
pub fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> impl Stream<Item = T> + Send + 'static {
    futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;
    use futures_util::StreamExt;
    use headtrack_core::board::BoardType;
    use headtrack_core::codec::encode_value;
    use headtrack_core::{ParamValue, Sample};

    fn fast() -> LinkConfig {
        LinkConfig {
            request_timeout: Duration::from_millis(60),
            handshake_timeout: Duration::from_millis(60),
            handshake_retries: 2,
            request_retries: 1,
            max_consecutive_timeouts: 3,
        }
    }

    async fn connected(board: SimBoard) -> (BoardLink, crate::sim::SimHandle) {
        let (io, sim) = board.spawn();
        let link = BoardLink::new(io, fast());
        link.handshake().await.unwrap();
        (link, sim)
    }

    #[tokio::test]
    async fn test_handshake_negotiates_crc() {
        let (io, sim) = SimBoard::new(BoardType::Nano33Ble, 2).spawn();
        let link = BoardLink::new(io, fast());
        let identity = link.handshake().await.unwrap();

        assert_eq!(identity.board, BoardType::Nano33Ble);
        assert_eq!(identity.protocol_version, 2);
        assert_eq!(link.shared.checksum(), ChecksumKind::Crc16);
        assert_eq!(link.identity().await, Some(identity));

        // CRC framing works end to end after the switch
        link.probe().await.unwrap();
        assert_eq!(sim.requests(Opcode::Ping), 1);
    }

    #[tokio::test]
    async fn test_handshake_protocol_v1_keeps_sum8() {
        let (link, _sim) = connected(SimBoard::new(BoardType::XiaoSense, 1)).await;
        assert_eq!(link.shared.checksum(), ChecksumKind::Sum8);
        link.probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_accepts_longest_firmware_version() {
        let mut board = SimBoard::new(BoardType::Nano33Ble, 2);
        board.firmware_version = format!("v2.2.1-{}", "x".repeat(248));
        assert_eq!(board.firmware_version.len(), 255);
        let (io, _sim) = board.spawn();
        let link = BoardLink::new(io, fast());

        let identity = link.handshake().await.unwrap();
        assert_eq!(identity.firmware_version.len(), 255);
        assert!(messages::encode_hello(&identity).len() <= DEFAULT_MAX_PAYLOAD as usize);
    }

    #[tokio::test]
    async fn test_handshake_no_board() {
        let (io, sim) = SimBoard::new(BoardType::Nano33Ble, 2).spawn();
        sim.set_silent(true);
        let link = BoardLink::new(io, fast());
        assert!(matches!(link.handshake().await, Err(ProtocolError::NoBoard)));
        assert_eq!(sim.requests(Opcode::Hello), 2);
    }

    #[tokio::test]
    async fn test_handshake_unsupported_version() {
        let (io, _sim) = SimBoard::new(BoardType::Nano33Ble, 9).spawn();
        let link = BoardLink::new(io, fast());
        assert!(matches!(
            link.handshake().await,
            Err(ProtocolError::UnsupportedBoard(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_response_never_satisfies_request() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        sim.corrupt_next(2);

        let result = link.request(Opcode::Ping, &[]).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
        // Original attempt plus one automatic retry, both answered corruptly
        assert_eq!(sim.requests(Opcode::Ping), 2);

        // The next clean response goes through
        link.probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_timeout_is_retried() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        sim.corrupt_next(1);
        link.request(Opcode::Ping, &[]).await.unwrap();
        assert_eq!(sim.requests(Opcode::Ping), 2);
    }

    #[tokio::test]
    async fn test_concurrent_request_is_busy() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        sim.set_delay(Duration::from_millis(40));
        let link = Arc::new(link);

        let first = {
            let link = link.clone();
            tokio::spawn(async move { link.request(Opcode::Ping, &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            link.request(Opcode::SaveToFlash, &[]).await,
            Err(ProtocolError::Busy)
        ));
        first.await.unwrap().unwrap();
        assert_eq!(sim.requests(Opcode::SaveToFlash), 0);
    }

    #[tokio::test]
    async fn test_stream_frame_mid_request() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        sim.set_delay(Duration::from_millis(30));
        let mut events = link.stream_events().boxed();

        let request = link.get_param(ParamId(2));
        let inject = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sim.send_samples(&[Sample {
                item: DataItem::Pan,
                value: 45.0,
            }])
            .await;
        };
        let (value, ()) = tokio::join!(request, inject);

        assert_eq!(value.unwrap(), encode_value(&ParamValue::Float(1.0)).unwrap());
        match events.next().await {
            Some(StreamEvent::Data { samples, .. }) => {
                assert_eq!(samples, vec![Sample { item: DataItem::Pan, value: 45.0 }]);
            }
            other => panic!("unexpected stream item {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_three_timeouts_emit_one_link_lost() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        let mut events = link.link_events();
        sim.set_silent(true);

        // Two timeouts from the request and its retry, a third from the probe
        assert!(matches!(link.request(Opcode::Ping, &[]).await, Err(ProtocolError::Timeout)));
        assert!(matches!(link.probe().await, Err(ProtocolError::LinkLost)));
        assert!(link.is_lost());

        assert_eq!(events.recv().await.unwrap(), LinkEvent::LinkLost);
        assert!(matches!(link.probe().await, Err(ProtocolError::LinkLost)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_response_resets_timeout_count() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        sim.corrupt_next(2);
        assert!(link.request(Opcode::Ping, &[]).await.is_err());
        link.probe().await.unwrap();
        sim.corrupt_next(2);
        assert!(matches!(link.request(Opcode::Ping, &[]).await, Err(ProtocolError::Timeout)));
        assert!(!link.is_lost());
    }

    #[tokio::test]
    async fn test_get_all_pages_and_set_params_chunks() {
        let mut board = SimBoard::new(BoardType::Nano33Ble, 2);
        board.max_payload = 64;
        let expected = board.param_count();
        let (link, sim) = connected(board).await;

        let all = link.get_all().await.unwrap();
        assert_eq!(all.len(), expected);
        assert!(sim.requests(Opcode::GetAll) > 1);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

        // Three gains at 7 bytes each and nine servo limits at 5 bytes each
        let frames: Vec<WireFrame> = (1u16..=12)
            .map(|id| {
                let value = if id <= 3 {
                    ParamValue::Float(3.0)
                } else {
                    ParamValue::Int(1400)
                };
                WireFrame {
                    id: ParamId(id),
                    bytes: encode_value(&value).unwrap(),
                }
            })
            .collect();
        link.set_params(&frames).await.unwrap();
        assert_eq!(sim.requests(Opcode::SetParam), 2);
        assert_eq!(sim.value(ParamId(5)), Some(encode_value(&ParamValue::Int(1400)).unwrap()));
    }

    #[tokio::test]
    async fn test_set_params_checks_acknowledged_ids() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        let frames = vec![
            WireFrame {
                id: ParamId(1),
                bytes: encode_value(&ParamValue::Float(3.0)).unwrap(),
            },
            WireFrame {
                id: ParamId(5),
                bytes: encode_value(&ParamValue::Int(1400)).unwrap(),
            },
        ];
        link.set_params(&frames).await.unwrap();

        sim.set_short_acks(true);
        assert!(matches!(
            link.set_params(&frames).await,
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(sim.requests(Opcode::SetParam), 2);
    }

    #[tokio::test]
    async fn test_nak_surfaces() {
        let (link, _sim) = connected(SimBoard::new(BoardType::XiaoSense, 2)).await;
        assert!(matches!(
            link.get_param(ParamId(51)).await,
            Err(ProtocolError::Nak { code: nak::UNKNOWN_PARAM })
        ));
    }

    #[tokio::test]
    async fn test_closed_transport() {
        let (link, sim) = connected(SimBoard::new(BoardType::Nano33Ble, 2)).await;
        let mut events = link.link_events();
        sim.shutdown().await;
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Closed);
        assert!(matches!(link.probe().await, Err(ProtocolError::Closed)));
    }
}
