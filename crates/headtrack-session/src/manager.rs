//! ConnectionManager - one board session at a time
//!
//! The manager owns the open transport (through its [`BoardLink`]) and the
//! session's [`ParameterStore`]. Every state transition and every request
//! goes through one control lock, so a disconnect can never race an
//! in-flight request. Callers see copies of parameter values and a stream
//! of timestamped [`ConnectionEvent`]s.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use headtrack_core::{
    BoardIdentity, DataItem, ImportReport, ParamDef, ParamId, ParamValue, ParameterError,
    ParameterStore, PendingChanges, SnapshotError,
};
use headtrack_link::{
    broadcast_stream, BoardLink, CalibrationKind, LinkConfig, LinkEvent, PortProvider,
    ProtocolError, StreamEvent, TransportError,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Port {0} is busy or access was denied")]
    PortBusy(String),
    #[error("Port {0} not found")]
    PortNotFound(String),
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("No board answered on {0}")]
    NoResponse(String),
    #[error("Unsupported board: {0}")]
    UnsupportedBoard(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Another operation is in progress")]
    Busy,
    #[error("Board has changes that are not saved to flash")]
    UnsavedChanges(PendingChanges),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Busy(port) => Self::PortBusy(port),
            TransportError::NotFound(port) => Self::PortNotFound(port),
            other => Self::Transport(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub at: DateTime<Utc>,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEventKind {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected {
        port: String,
        identity: BoardIdentity,
    },
    ConnectFailed {
        port: String,
        reason: String,
    },
    ParametersLoaded {
        count: usize,
        needs_calibration: bool,
    },
    DirtyChanged(PendingChanges),
    /// The board stopped answering or the port went away
    LinkLost {
        port: String,
    },
    /// Session closed on request
    Disconnected {
        port: String,
    },
}

/// When to probe a quiet link
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Silence after which a probe is sent
    pub idle: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(1500),
            probe_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub baud: u32,
    pub link: LinkConfig,
    pub liveness: LivenessConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            link: LinkConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

struct Session {
    port: String,
    link: Arc<BoardLink>,
    identity: BoardIdentity,
    store: ParameterStore,
    watchdog: Option<JoinHandle<()>>,
}

struct Inner {
    state: ConnectionState,
    session: Option<Session>,
}

struct Shared {
    control: Mutex<()>,
    inner: RwLock<Inner>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.event_tx.send(ConnectionEvent {
            at: Utc::now(),
            kind,
        });
    }

    async fn set_state(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut self.inner.write().await.state, to);
        if from != to {
            info!(from = %from, to = %to, "Connection state changed");
            self.emit(ConnectionEventKind::StateChanged { from, to });
        }
    }

    /// Tear down the session owning `link` after a fault
    ///
    /// Only the first caller for a given link does anything, so a link
    /// reported lost by several paths yields a single event.
    async fn lose_link(&self, link: &Arc<BoardLink>, reason: &str) {
        let _control = self.control.lock().await;

        let session = {
            let mut inner = self.inner.write().await;
            let ours = inner
                .session
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(&s.link, link));
            if !ours {
                return;
            }
            inner.session.take()
        };
        let Some(session) = session else { return };

        warn!(port = %session.port, reason, "Link lost");
        // The watchdog is the caller; let it finish on its own
        drop(session.watchdog);
        self.set_state(ConnectionState::Disconnected).await;
        self.emit(ConnectionEventKind::LinkLost { port: session.port });
    }
}

/// Connects to a board, keeps the session alive, and mediates all access
pub struct ConnectionManager {
    provider: Arc<dyn PortProvider>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    stream_tx: broadcast::Sender<StreamEvent>,
}

impl ConnectionManager {
    pub fn new(provider: Arc<dyn PortProvider>, config: ConnectionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (stream_tx, _) = broadcast::channel(100);
        Self {
            provider,
            config,
            shared: Arc::new(Shared {
                control: Mutex::new(()),
                inner: RwLock::new(Inner {
                    state: ConnectionState::Disconnected,
                    session: None,
                }),
                event_tx,
            }),
            stream_tx,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn provider(&self) -> Arc<dyn PortProvider> {
        self.provider.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Unsolicited board frames; one subscription survives reconnects
    pub fn subscribe_stream(&self) -> broadcast::Receiver<StreamEvent> {
        self.stream_tx.subscribe()
    }

    pub fn stream_events(&self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        broadcast_stream(self.subscribe_stream())
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.read().await.state
    }

    /// Port of the current session
    pub async fn port(&self) -> Option<String> {
        self.shared
            .inner
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.port.clone())
    }

    pub async fn identity(&self) -> Option<BoardIdentity> {
        self.shared
            .inner
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.identity.clone())
    }

    /// Open `port`, handshake, and pull every parameter
    pub async fn connect(&self, port: &str) -> Result<BoardIdentity, ConnectionError> {
        let _control = self.shared.control.lock().await;
        if self.shared.inner.read().await.state != ConnectionState::Disconnected {
            return Err(ConnectionError::AlreadyConnected);
        }

        info!(port = %port, baud = self.config.baud, "Connecting");
        self.shared.set_state(ConnectionState::Connecting).await;

        let (link, identity) = match self.open_link(port).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(port = %port, error = %e, "Connect failed");
                self.shared.set_state(ConnectionState::Disconnected).await;
                self.shared.emit(ConnectionEventKind::ConnectFailed {
                    port: port.to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        {
            let mut inner = self.shared.inner.write().await;
            inner.session = Some(Session {
                port: port.to_string(),
                link: link.clone(),
                identity: identity.clone(),
                store: ParameterStore::new(&identity),
                watchdog: None,
            });
        }
        self.shared.set_state(ConnectionState::Connected).await;
        self.shared.emit(ConnectionEventKind::Connected {
            port: port.to_string(),
            identity: identity.clone(),
        });

        if let Err(e) = self.pull_locked(&link).await {
            warn!(port = %port, error = %e, "Initial parameter pull failed");
            self.close_session().await;
            self.shared.emit(ConnectionEventKind::ConnectFailed {
                port: port.to_string(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        let watchdog = tokio::spawn(watchdog(
            Arc::downgrade(&self.shared),
            Arc::downgrade(&link),
            link.link_events(),
            self.config.liveness.clone(),
        ));
        if let Some(session) = self.shared.inner.write().await.session.as_mut() {
            session.watchdog = Some(watchdog);
        }

        Ok(identity)
    }

    async fn open_link(&self, port: &str) -> Result<(Arc<BoardLink>, BoardIdentity), ConnectionError> {
        let io = self.provider.open(port, self.config.baud)?;

        self.shared.set_state(ConnectionState::Handshaking).await;
        let link = Arc::new(BoardLink::with_stream_sender(
            io,
            self.config.link.clone(),
            self.stream_tx.clone(),
        ));

        let identity = link.handshake().await.map_err(|e| match e {
            ProtocolError::NoBoard => ConnectionError::NoResponse(port.to_string()),
            ProtocolError::UnsupportedBoard(reason) => ConnectionError::UnsupportedBoard(reason),
            other => ConnectionError::Protocol(other),
        })?;
        Ok((link, identity))
    }

    /// Close the session
    ///
    /// Fails with [`ConnectionError::UnsavedChanges`] when the board holds
    /// edits that would be lost, unless `force` is set. Closing when no
    /// session is open does nothing.
    pub async fn disconnect(&self, force: bool) -> Result<(), ConnectionError> {
        let _control = self.shared.control.lock().await;

        let pending = match self.shared.inner.read().await.session.as_ref() {
            Some(s) => s.store.pending_changes(),
            None => return Ok(()),
        };
        if pending.any() && !force {
            return Err(ConnectionError::UnsavedChanges(pending));
        }
        if pending.any() {
            warn!(?pending, "Discarding unsaved changes");
        }

        self.close_session().await;
        Ok(())
    }

    /// Caller holds the control lock
    async fn close_session(&self) {
        self.shared.set_state(ConnectionState::Disconnecting).await;
        let session = self.shared.inner.write().await.session.take();
        if let Some(session) = session {
            if let Some(watchdog) = session.watchdog {
                watchdog.abort();
            }
            info!(port = %session.port, "Disconnected");
            self.shared.set_state(ConnectionState::Disconnected).await;
            self.shared.emit(ConnectionEventKind::Disconnected { port: session.port });
        } else {
            self.shared.set_state(ConnectionState::Disconnected).await;
        }
    }

    /// Take the control lock for a board operation
    ///
    /// The liveness watchdog holds the lock for at most one ping timeout, so
    /// waiting twice that lets its ping finish. Anything holding it longer
    /// is another caller and we report `Busy`.
    async fn begin(&self) -> Result<MutexGuard<'_, ()>, ConnectionError> {
        let wait = self.config.liveness.probe_timeout * 2;
        tokio::time::timeout(wait, self.shared.control.lock())
            .await
            .map_err(|_| ConnectionError::Busy)
    }

    async fn link(&self) -> Result<Arc<BoardLink>, ConnectionError> {
        let inner = self.shared.inner.read().await;
        match (&inner.state, &inner.session) {
            (ConnectionState::Connected, Some(s)) => Ok(s.link.clone()),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    async fn read_session<T>(&self, f: impl FnOnce(&Session) -> T) -> Result<T, ConnectionError> {
        let inner = self.shared.inner.read().await;
        inner
            .session
            .as_ref()
            .map(f)
            .ok_or(ConnectionError::NotConnected)
    }

    async fn write_store<T>(
        &self,
        f: impl FnOnce(&mut ParameterStore) -> T,
    ) -> Result<T, ConnectionError> {
        let mut inner = self.shared.inner.write().await;
        inner
            .session
            .as_mut()
            .map(|s| f(&mut s.store))
            .ok_or(ConnectionError::NotConnected)
    }

    pub async fn get(&self, id: ParamId) -> Result<ParamValue, ConnectionError> {
        Ok(self.read_session(|s| s.store.get(id)).await??)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<(&'static ParamDef, ParamValue), ConnectionError> {
        let found = self
            .read_session(|s| {
                let def = s.store.def_by_name(name)?;
                s.store.get(def.id).map(|v| (def, v))
            })
            .await?;
        Ok(found?)
    }

    /// Copy of every loaded parameter in id order
    pub async fn parameters(&self) -> Result<Vec<(&'static ParamDef, ParamValue)>, ConnectionError> {
        self.read_session(|s| s.store.values()).await
    }

    pub async fn pending_changes(&self) -> Result<PendingChanges, ConnectionError> {
        self.read_session(|s| s.store.pending_changes()).await
    }

    pub async fn needs_calibration(&self) -> Result<bool, ConnectionError> {
        self.read_session(|s| s.store.needs_calibration(s.identity.capabilities))
            .await
    }

    /// Edit a parameter locally; [`push`](Self::push) sends it
    pub async fn set(&self, id: ParamId, value: ParamValue) -> Result<(), ConnectionError> {
        let pending = self
            .write_store(|store| store.set(id, value).map(|_| store.pending_changes()))
            .await??;
        self.shared.emit(ConnectionEventKind::DirtyChanged(pending));
        Ok(())
    }

    /// Edit a parameter by name from its text form
    pub async fn set_by_name(&self, name: &str, text: &str) -> Result<ParamId, ConnectionError> {
        let result = self
            .write_store(|store| {
                let def = store.def_by_name(name)?;
                let value = ParamValue::parse(def.kind, text)?;
                store.set(def.id, value)?;
                Ok::<_, ParameterError>((def.id, store.pending_changes()))
            })
            .await??;
        self.shared.emit(ConnectionEventKind::DirtyChanged(result.1));
        Ok(result.0)
    }

    /// Send every dirty parameter to the board's RAM
    ///
    /// Returns how many parameters were written.
    pub async fn push(&self) -> Result<usize, ConnectionError> {
        let _control = self.begin().await?;
        let link = self.link().await?;
        self.push_locked(&link).await
    }

    async fn push_locked(&self, link: &BoardLink) -> Result<usize, ConnectionError> {
        let frames = self.read_session(|s| s.store.to_wire_frames()).await??;
        if frames.is_empty() {
            return Ok(0);
        }

        link.set_params(&frames).await?;
        let pending = self
            .write_store(|store| {
                store.mark_sent(&frames);
                store.pending_changes()
            })
            .await?;
        info!(count = frames.len(), "Pushed parameters");
        self.shared.emit(ConnectionEventKind::DirtyChanged(pending));
        Ok(frames.len())
    }

    /// Re-read every parameter from the board
    pub async fn pull(&self) -> Result<usize, ConnectionError> {
        let _control = self.begin().await?;
        let link = self.link().await?;
        self.pull_locked(&link).await
    }

    async fn pull_locked(&self, link: &BoardLink) -> Result<usize, ConnectionError> {
        let entries = link.get_all().await?;
        let (unknown, needs_calibration) = {
            let mut inner = self.shared.inner.write().await;
            let session = inner.session.as_mut().ok_or(ConnectionError::NotConnected)?;
            let unknown = session.store.apply_pull(&entries)?;
            (
                unknown,
                session.store.needs_calibration(session.identity.capabilities),
            )
        };

        let count = entries.len() - unknown.len();
        info!(count, skipped = unknown.len(), needs_calibration, "Parameters loaded");
        self.shared.emit(ConnectionEventKind::ParametersLoaded {
            count,
            needs_calibration,
        });
        Ok(count)
    }

    /// Push pending edits, then make the board persist its settings
    pub async fn save_to_flash(&self) -> Result<(), ConnectionError> {
        let _control = self.begin().await?;
        let link = self.link().await?;
        self.push_locked(&link).await?;
        link.save_to_flash().await?;

        let pending = self
            .write_store(|store| {
                store.mark_saved_to_flash();
                store.pending_changes()
            })
            .await?;
        info!("Settings saved to flash");
        self.shared.emit(ConnectionEventKind::DirtyChanged(pending));
        Ok(())
    }

    /// Restart the board and close the session
    pub async fn reboot(&self) -> Result<(), ConnectionError> {
        let _control = self.begin().await?;
        let link = self.link().await?;
        link.reboot().await?;
        info!("Board rebooting");
        self.close_session().await;
        Ok(())
    }

    /// Restore factory settings on the board and reload them
    pub async fn erase(&self) -> Result<(), ConnectionError> {
        let _control = self.begin().await?;
        let link = self.link().await?;
        link.erase().await?;
        info!("Board settings erased");
        self.pull_locked(&link).await.map(|_| ())
    }

    pub async fn reset_center(&self) -> Result<(), ConnectionError> {
        let _control = self.begin().await?;
        Ok(self.link().await?.reset_center().await?)
    }

    pub async fn calibrate(&self, kind: CalibrationKind) -> Result<(), ConnectionError> {
        let _control = self.begin().await?;
        let link = self.link().await?;
        link.calibrate(kind).await?;
        info!(?kind, "Calibration started");
        Ok(())
    }

    /// Choose the live data items the board streams
    pub async fn set_stream_items(&self, items: &[DataItem]) -> Result<(), ConnectionError> {
        let _control = self.begin().await?;
        let link = self.link().await?;
        link.configure_stream(items).await?;
        debug!(count = items.len(), "Stream items configured");
        Ok(())
    }

    pub async fn export_snapshot(&self) -> Result<String, ConnectionError> {
        Ok(self.read_session(|s| s.store.export_snapshot()).await??)
    }

    /// Apply a settings file as local edits
    pub async fn import_snapshot(&self, text: &str) -> Result<ImportReport, ConnectionError> {
        let (report, pending) = self
            .write_store(|store| {
                store
                    .import_snapshot(text)
                    .map(|report| (report, store.pending_changes()))
            })
            .await??;
        self.shared.emit(ConnectionEventKind::DirtyChanged(pending));
        Ok(report)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_write() {
            if let Some(watchdog) = inner.session.as_mut().and_then(|s| s.watchdog.take()) {
                watchdog.abort();
            }
        }
    }
}

/// Watch one link for faults and probe it when it goes quiet
async fn watchdog(
    shared: Weak<Shared>,
    link: Weak<BoardLink>,
    mut events: broadcast::Receiver<LinkEvent>,
    liveness: LivenessConfig,
) {
    let mut tick = tokio::time::interval(liveness.probe_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::LinkLost) => break "unresponsive",
                Ok(LinkEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break "closed",
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            _ = tick.tick() => {
                let (Some(shared), Some(link)) = (shared.upgrade(), link.upgrade()) else {
                    return;
                };
                if link.is_lost() {
                    break "unresponsive";
                }
                if link.idle_for() < liveness.idle {
                    continue;
                }
                // A caller holding the control lock is already talking to the board
                let Ok(_control) = shared.control.try_lock() else {
                    continue;
                };
                match link.probe_within(liveness.probe_timeout).await {
                    Ok(()) => debug!("Liveness probe answered"),
                    Err(ProtocolError::LinkLost) => break "unresponsive",
                    Err(ProtocolError::Closed) => break "closed",
                    Err(ProtocolError::Busy) => {}
                    Err(e) => debug!(error = %e, "Liveness probe failed"),
                }
            }
        }
    };

    if let (Some(shared), Some(link)) = (shared.upgrade(), link.upgrade()) {
        shared.lose_link(&link, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use futures_util::StreamExt;
    use headtrack_core::{BoardType, DataItem, Sample, Schema};
    use headtrack_link::sim::SimBoard;
    use headtrack_link::Opcode;

    const PORT: &str = "/dev/ttyACM0";
    const TILT_GAIN: ParamId = ParamId(2);

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            baud: 115_200,
            link: LinkConfig {
                request_timeout: Duration::from_millis(60),
                handshake_timeout: Duration::from_millis(60),
                handshake_retries: 2,
                request_retries: 1,
                max_consecutive_timeouts: 3,
            },
            liveness: LivenessConfig {
                idle: Duration::from_millis(20),
                probe_interval: Duration::from_millis(20),
                probe_timeout: Duration::from_millis(40),
            },
        }
    }

    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig {
            liveness: LivenessConfig {
                idle: Duration::from_secs(60),
                ..fast_config().liveness
            },
            ..fast_config()
        }
    }

    fn setup(board: SimBoard, config: ConnectionConfig) -> (Arc<FakeProvider>, ConnectionManager) {
        let provider = Arc::new(FakeProvider::new());
        provider.add_board(PORT, board);
        let manager = ConnectionManager::new(provider.clone(), config);
        (provider, manager)
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_connect_loads_board_schema() {
        let (_provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());

        let identity = manager.connect(PORT).await.unwrap();
        assert_eq!(identity.board, BoardType::Nano33Ble);
        assert_eq!(identity.protocol_version, 2);
        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert_eq!(manager.port().await.as_deref(), Some(PORT));

        let params = manager.parameters().await.unwrap();
        let schema = Schema::for_board(BoardType::Nano33Ble);
        assert_eq!(params.len(), schema.len());
        assert!(params.iter().map(|(d, _)| d.id).eq(schema.ids()));
        assert!(!manager.pending_changes().await.unwrap().any());
        assert!(!manager.needs_calibration().await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_event_order() {
        let (_provider, manager) = setup(SimBoard::new(BoardType::XiaoSense, 1), quiet_config());
        let mut rx = manager.subscribe();

        manager.connect(PORT).await.unwrap();
        let kinds = drain(&mut rx);

        let states: Vec<_> = kinds
            .iter()
            .filter_map(|k| match k {
                ConnectionEventKind::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Handshaking,
                ConnectionState::Connected,
            ]
        );
        assert!(matches!(kinds.last(), Some(ConnectionEventKind::ParametersLoaded { .. })));
    }

    #[tokio::test]
    async fn test_edit_push_and_save() {
        let (provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        manager.connect(PORT).await.unwrap();
        let handle = provider.take_handle(PORT).unwrap();

        manager.set(TILT_GAIN, ParamValue::Float(2.5)).await.unwrap();
        let pending = manager.pending_changes().await.unwrap();
        assert!(pending.unsent);

        assert_eq!(manager.push().await.unwrap(), 1);
        let mut expected = vec![4u8];
        expected.extend_from_slice(&2.5f32.to_le_bytes());
        assert_eq!(handle.value(TILT_GAIN), Some(expected));

        let pending = manager.pending_changes().await.unwrap();
        assert!(!pending.unsent);
        assert!(pending.unsaved_to_flash);

        manager.save_to_flash().await.unwrap();
        assert_eq!(handle.requests(Opcode::SaveToFlash), 1);
        assert!(!manager.pending_changes().await.unwrap().any());
        assert_eq!(manager.get(TILT_GAIN).await.unwrap(), ParamValue::Float(2.5));
    }

    #[tokio::test]
    async fn test_set_out_of_range_keeps_value() {
        let (_provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        manager.connect(PORT).await.unwrap();

        let err = manager.set(TILT_GAIN, ParamValue::Float(9.0)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Parameter(ParameterError::OutOfRange { .. })));
        assert_eq!(manager.get(TILT_GAIN).await.unwrap(), ParamValue::Float(1.0));

        let id = manager.set_by_name("PanCenter", "1510").await.unwrap();
        assert_eq!(id, ParamId(6));
        let (_, value) = manager.get_by_name("PanCenter").await.unwrap();
        assert_eq!(value, ParamValue::Int(1510));
    }

    #[tokio::test]
    async fn test_connect_errors_are_specific() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_board("/dev/ttyACM1", SimBoard::new(BoardType::Nano33Ble, 2));
        provider.set_busy("/dev/ttyACM1", true);
        provider.add_port(headtrack_link::PortInfo::named("/dev/ttyS0"));
        provider.add_board("/dev/ttyACM2", SimBoard::new(BoardType::Nano33Ble, 9));
        let manager = ConnectionManager::new(provider.clone(), quiet_config());

        let err = manager.connect("/dev/ttyACM1").await.unwrap_err();
        assert!(matches!(err, ConnectionError::PortBusy(_)));
        let err = manager.connect("/dev/ttyACM9").await.unwrap_err();
        assert!(matches!(err, ConnectionError::PortNotFound(_)));
        let err = manager.connect("/dev/ttyS0").await.unwrap_err();
        assert!(matches!(err, ConnectionError::NoResponse(_)));
        let err = manager.connect("/dev/ttyACM2").await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnsupportedBoard(_)));

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(matches!(manager.push().await, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let (_provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        manager.connect(PORT).await.unwrap();
        assert!(matches!(
            manager.connect(PORT).await,
            Err(ConnectionError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_with_unsaved_changes() {
        let (_provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        let mut rx = manager.subscribe();
        manager.connect(PORT).await.unwrap();
        manager.set(TILT_GAIN, ParamValue::Float(2.0)).await.unwrap();

        let err = manager.disconnect(false).await.unwrap_err();
        match err {
            ConnectionError::UnsavedChanges(pending) => assert!(pending.unsent),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.state().await, ConnectionState::Connected);

        manager.disconnect(true).await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(matches!(manager.parameters().await, Err(ConnectionError::NotConnected)));

        let kinds = drain(&mut rx);
        assert!(kinds.contains(&ConnectionEventKind::Disconnected {
            port: PORT.to_string()
        }));
        assert!(!kinds
            .iter()
            .any(|k| matches!(k, ConnectionEventKind::LinkLost { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_starts_clean() {
        let (_provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        manager.connect(PORT).await.unwrap();
        manager.set(TILT_GAIN, ParamValue::Float(3.0)).await.unwrap();
        manager.disconnect(true).await.unwrap();

        manager.connect(PORT).await.unwrap();
        assert!(!manager.pending_changes().await.unwrap().any());
        assert_eq!(manager.get(TILT_GAIN).await.unwrap(), ParamValue::Float(1.0));
    }

    #[tokio::test]
    async fn test_silent_board_reports_one_link_lost() {
        let (provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), fast_config());
        let mut rx = manager.subscribe();
        manager.connect(PORT).await.unwrap();
        let handle = provider.take_handle(PORT).unwrap();

        handle.set_silent(true);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        let kinds = drain(&mut rx);
        let lost = kinds
            .iter()
            .filter(|k| matches!(k, ConnectionEventKind::LinkLost { .. }))
            .count();
        assert_eq!(lost, 1);
        assert!(handle.requests(Opcode::Ping) >= 3);
        assert!(!kinds
            .iter()
            .any(|k| matches!(k, ConnectionEventKind::Disconnected { .. })));
    }

    #[tokio::test]
    async fn test_answering_board_stays_connected() {
        let (provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), fast_config());
        manager.connect(PORT).await.unwrap();
        let handle = provider.take_handle(PORT).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert!(handle.requests(Opcode::Ping) >= 1);
    }

    #[tokio::test]
    async fn test_operations_wait_out_liveness_checks() {
        let config = ConnectionConfig {
            link: LinkConfig {
                request_timeout: Duration::from_millis(300),
                ..fast_config().link
            },
            liveness: LivenessConfig {
                idle: Duration::from_millis(20),
                probe_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
            },
            ..fast_config()
        };
        let (provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), config);
        manager.connect(PORT).await.unwrap();
        let handle = provider.take_handle(PORT).unwrap();
        handle.set_delay(Duration::from_millis(60));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(45)).await;
            manager.save_to_flash().await.unwrap();
        }
        assert_eq!(handle.requests(Opcode::SaveToFlash), 10);
        assert!(handle.requests(Opcode::Ping) >= 1);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_unplugged_board_is_link_lost() {
        let (provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        let mut rx = manager.subscribe();
        manager.connect(PORT).await.unwrap();

        provider.take_handle(PORT).unwrap().shutdown().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(drain(&mut rx).contains(&ConnectionEventKind::LinkLost {
            port: PORT.to_string()
        }));
    }

    #[tokio::test]
    async fn test_stream_survives_reconnect() {
        let (provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        let mut stream = Box::pin(manager.stream_events());

        manager.connect(PORT).await.unwrap();
        manager.set_stream_items(&[DataItem::Tilt]).await.unwrap();
        let handle = provider.take_handle(PORT).unwrap();
        assert_eq!(handle.stream_mask(), DataItem::Tilt.bit());
        handle.send_samples(&[Sample { item: DataItem::Tilt, value: 4.0 }]).await;

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StreamEvent::Data { ref samples, .. } if samples[0].value == 4.0));

        manager.disconnect(false).await.unwrap();
        manager.connect(PORT).await.unwrap();
        let handle = provider.take_handle(PORT).unwrap();
        handle.send_log("hello again").await;

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StreamEvent::Log { ref line, .. } if line == "hello again"));
    }

    #[tokio::test]
    async fn test_erase_reloads_defaults() {
        let board = SimBoard::new(BoardType::Nano33Ble, 2).with_value(TILT_GAIN, ParamValue::Float(3.5));
        let (_provider, manager) = setup(board, quiet_config());
        manager.connect(PORT).await.unwrap();
        assert_eq!(manager.get(TILT_GAIN).await.unwrap(), ParamValue::Float(3.5));

        manager.erase().await.unwrap();
        assert_eq!(manager.get(TILT_GAIN).await.unwrap(), ParamValue::Float(1.0));
    }

    #[tokio::test]
    async fn test_reboot_closes_session() {
        let (provider, manager) = setup(SimBoard::new(BoardType::XiaoSense, 2), quiet_config());
        manager.connect(PORT).await.unwrap();
        let handle = provider.take_handle(PORT).unwrap();

        manager.reboot().await.unwrap();
        assert_eq!(handle.requests(Opcode::Reboot), 1);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_manager() {
        let (_provider, manager) = setup(SimBoard::new(BoardType::Nano33Ble, 2), quiet_config());
        manager.connect(PORT).await.unwrap();
        manager.set(TILT_GAIN, ParamValue::Float(2.5)).await.unwrap();
        let text = manager.export_snapshot().await.unwrap();
        manager.disconnect(true).await.unwrap();

        manager.connect(PORT).await.unwrap();
        let report = manager.import_snapshot(&text).await.unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(manager.get(TILT_GAIN).await.unwrap(), ParamValue::Float(2.5));
        assert!(manager.pending_changes().await.unwrap().unsent);
    }
}
