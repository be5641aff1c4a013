//! Firmware update controller
//!
//! An update runs as a background task:
//! 1. Acquire the image from disk or the remote catalog
//! 2. Sniff its format and target board
//! 3. Close any open session and touch the port to enter the bootloader
//! 4. Wait for the bootloader port
//! 5. Run the external programmer
//! 6. Optionally wait for the board to come back
//!
//! Every step reports through a broadcast channel of timestamped events
//! and any of them can be cancelled.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use headtrack_core::{BoardType, Channel, FirmwareImage, FormatError, ImageFormat, ImageSource};
use headtrack_link::PortProvider;
use headtrack_session::{ConnectionError, ConnectionManager, ConnectionState};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootloader::{self, BootloaderConfig};
use crate::fetch::{self, FetchError, FirmwareFetcher};
use crate::programmer::{self, ProgrammerConfig, ProgrammerOutput};

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    UnknownFormat(#[from] FormatError),
    #[error("Image is built for {image}, but the board is {board}")]
    WrongBoard { image: BoardType, board: BoardType },
    #[error("Board type is unknown; connect first or name the board")]
    UnknownBoard,
    #[error("No firmware catalog is configured")]
    NoCatalog,
    #[error("No programmer is configured for {0}")]
    NoProgrammer(String),
    #[error("Could not enter the bootloader: {0}")]
    BootloaderEntryFailed(String),
    #[error("Programmer failed (exit code {code:?}): {message}")]
    ProgrammerError { code: Option<i32>, message: String },
    #[error("Verification failed: {0}")]
    VerifyFailed(String),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("An update is already in progress")]
    InProgress,
    #[error("Cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an update ended in `Failed`
///
/// A cloneable copy of [`UpdateError`] that can travel in state events.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateFailure {
    #[error("Fetch failed: {message}")]
    Fetch { message: String },
    #[error("{message}")]
    UnknownFormat { message: String },
    #[error("Image is built for {image}, but the board is {board}")]
    WrongBoard { image: BoardType, board: BoardType },
    #[error("Board type is unknown; connect first or name the board")]
    UnknownBoard,
    #[error("No firmware catalog is configured")]
    NoCatalog,
    #[error("No programmer is configured for {board}")]
    NoProgrammer { board: String },
    #[error("Could not enter the bootloader: {message}")]
    BootloaderEntryFailed { message: String },
    #[error("Programmer failed (exit code {code:?}): {message}")]
    Programmer { code: Option<i32>, message: String },
    #[error("Verification failed: {message}")]
    VerifyFailed { message: String },
    #[error("Connection error: {message}")]
    Connection { message: String },
    #[error("IO error: {message}")]
    Io { message: String },
    #[error("{message}")]
    Other { message: String },
}

impl From<UpdateError> for UpdateFailure {
    fn from(e: UpdateError) -> Self {
        match e {
            UpdateError::Fetch(e) => Self::Fetch { message: e.to_string() },
            UpdateError::UnknownFormat(e) => Self::UnknownFormat { message: e.to_string() },
            UpdateError::WrongBoard { image, board } => Self::WrongBoard { image, board },
            UpdateError::UnknownBoard => Self::UnknownBoard,
            UpdateError::NoCatalog => Self::NoCatalog,
            UpdateError::NoProgrammer(board) => Self::NoProgrammer { board },
            UpdateError::BootloaderEntryFailed(message) => Self::BootloaderEntryFailed { message },
            UpdateError::ProgrammerError { code, message } => Self::Programmer { code, message },
            UpdateError::VerifyFailed(message) => Self::VerifyFailed { message },
            UpdateError::Connection(e) => Self::Connection { message: e.to_string() },
            UpdateError::Io(e) => Self::Io { message: e.to_string() },
            e @ (UpdateError::InProgress | UpdateError::Cancelled) => Self::Other {
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Acquiring,
    DetectingFormat,
    EnteringBootloader,
    AwaitingBootloaderPort,
    Flashing { progress: u8 },
    Verifying,
    Done,
    Cancelled,
    Failed(UpdateFailure),
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed(_))
    }

    /// Whether an update is running
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != Self::Idle
    }
}

#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub at: DateTime<Utc>,
    pub kind: UpdateEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEventKind {
    State(UpdateState),
    /// The image was loaded and classified
    Image {
        format: ImageFormat,
        target: Option<BoardType>,
        size: usize,
        sha256: String,
    },
    /// Port the programmer will use
    BootloaderPort(String),
    ProgrammerStarted { pid: Option<u32> },
    /// A line of programmer output
    Log(String),
}

/// Where the firmware comes from
#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareSource {
    Local(PathBuf),
    /// Latest catalog release for the board
    Remote { channel: Channel },
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub source: FirmwareSource,
    /// Port the board runs its normal firmware on
    pub port: String,
    /// Board to flash; taken from the open session when not given
    pub board: Option<BoardType>,
}

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub bootloader: BootloaderConfig,
    /// Overrides the per-board default programmer
    pub programmer: Option<ProgrammerConfig>,
    /// Wait for the board's port to return after flashing
    pub verify: bool,
    pub verify_timeout: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            bootloader: BootloaderConfig::default(),
            programmer: None,
            verify: false,
            verify_timeout: Duration::from_secs(10),
        }
    }
}

impl UpdateConfig {
    /// Programmer to run for `board`: the override if set, else the board's vendor tool
    pub fn programmer_for(&self, board: Option<BoardType>) -> Option<ProgrammerConfig> {
        self.programmer
            .clone()
            .or_else(|| board.and_then(ProgrammerConfig::for_board))
    }
}

/// State the running task shares with the controller
#[derive(Clone)]
struct Runner {
    provider: Arc<dyn PortProvider>,
    connection: Option<Arc<ConnectionManager>>,
    fetcher: Option<Arc<FirmwareFetcher>>,
    config: UpdateConfig,
    state: Arc<Mutex<UpdateState>>,
    event_tx: broadcast::Sender<UpdateEvent>,
}

/// Drives one firmware update at a time
pub struct FirmwareUpdateController {
    runner: Runner,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<UpdateState>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl FirmwareUpdateController {
    pub fn new(provider: Arc<dyn PortProvider>, config: UpdateConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            runner: Runner {
                provider,
                connection: None,
                fetcher: None,
                config,
                state: Arc::new(Mutex::new(UpdateState::Idle)),
                event_tx,
            },
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    /// Session to close before entering the bootloader
    pub fn with_connection(mut self, connection: Arc<ConnectionManager>) -> Self {
        self.runner.connection = Some(connection);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<FirmwareFetcher>) -> Self {
        self.runner.fetcher = Some(fetcher);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.runner.event_tx.subscribe()
    }

    pub fn state(&self) -> UpdateState {
        lock(&self.runner.state).clone()
    }

    /// Start an update in the background
    pub fn start(&self, request: UpdateRequest) -> Result<(), UpdateError> {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) || self.state().is_active() {
            return Err(UpdateError::InProgress);
        }
        *lock(&self.runner.state) = UpdateState::Idle;

        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();

        let runner = self.runner.clone();
        *task = Some(tokio::spawn(async move { runner.execute(request, token).await }));
        Ok(())
    }

    /// Ask the running update to stop
    pub fn cancel(&self) {
        info!("Cancelling firmware update");
        lock(&self.cancel).cancel();
    }

    /// Wait for the current update to finish and return its final state
    pub async fn wait(&self) -> UpdateState {
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Update task failed");
            }
        }
        self.state()
    }

    /// Start an update and wait for it
    pub async fn run(&self, request: UpdateRequest) -> Result<UpdateState, UpdateError> {
        self.start(request)?;
        Ok(self.wait().await)
    }
}

impl Drop for FirmwareUpdateController {
    fn drop(&mut self) {
        // The task sees the token, kills the programmer, and exits
        self.cancel
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, UpdateError>>,
) -> Result<T, UpdateError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UpdateError::Cancelled),
        result = fut => result,
    }
}

fn temp_image_path(format: ImageFormat) -> PathBuf {
    std::env::temp_dir().join(format!(
        "headtrack-{}-{}.{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        format.extension()
    ))
}

impl Runner {
    fn emit(&self, kind: UpdateEventKind) {
        let _ = self.event_tx.send(UpdateEvent {
            at: Utc::now(),
            kind,
        });
    }

    fn set_state(&self, state: UpdateState) {
        *lock(&self.state) = state.clone();
        self.emit(UpdateEventKind::State(state));
    }

    async fn execute(&self, request: UpdateRequest, cancel: CancellationToken) -> UpdateState {
        info!(port = %request.port, source = ?request.source, "Starting firmware update");

        let state = match self.update(&request, &cancel).await {
            Ok(()) => {
                info!(port = %request.port, "Firmware update complete");
                UpdateState::Done
            }
            Err(UpdateError::Cancelled) => {
                warn!(port = %request.port, "Firmware update cancelled");
                UpdateState::Cancelled
            }
            Err(e) => {
                error!(port = %request.port, error = %e, "Firmware update failed");
                UpdateState::Failed(e.into())
            }
        };
        self.set_state(state.clone());
        state
    }

    async fn update(&self, request: &UpdateRequest, cancel: &CancellationToken) -> Result<(), UpdateError> {
        self.set_state(UpdateState::Acquiring);
        let session_board = match &self.connection {
            Some(connection) => connection.identity().await.map(|i| i.board),
            None => None,
        };
        let board = request.board.or(session_board);
        let (source, payload) = cancellable(cancel, self.acquire(&request.source, board)).await?;

        self.set_state(UpdateState::DetectingFormat);
        let image = FirmwareImage::from_bytes(source, payload)?;
        if let (Some(board), Some(target)) = (board, image.target()) {
            if board != target {
                return Err(UpdateError::WrongBoard {
                    image: target,
                    board,
                });
            }
        }
        let board = board.or(image.target());
        info!(
            format = %image.format(),
            target = ?image.target(),
            size = image.payload().len(),
            "Firmware image loaded"
        );
        self.emit(UpdateEventKind::Image {
            format: image.format(),
            target: image.target(),
            size: image.payload().len(),
            sha256: image.sha256(),
        });

        let programmer = self
            .config
            .programmer_for(board)
            .ok_or_else(|| {
                UpdateError::NoProgrammer(board.map_or("an unknown board".to_string(), |b| b.to_string()))
            })?;
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        self.set_state(UpdateState::EnteringBootloader);
        if let Some(connection) = &self.connection {
            if connection.state().await != ConnectionState::Disconnected {
                info!("Closing the session before entering the bootloader");
                connection.disconnect(true).await?;
            }
        }
        let before = self.provider.available_ports().unwrap_or_default();
        if let Err(e) = bootloader::touch(
            self.provider.as_ref(),
            &request.port,
            self.config.bootloader.touch_baud,
        ) {
            // The board may already be in its bootloader
            warn!(port = %request.port, error = %e, "Bootloader touch failed");
        }

        self.set_state(UpdateState::AwaitingBootloaderPort);
        let port = bootloader::await_port(
            self.provider.as_ref(),
            &before,
            &request.port,
            &self.config.bootloader,
            cancel,
        )
        .await?;
        self.emit(UpdateEventKind::BootloaderPort(port.name().to_string()));

        self.set_state(UpdateState::Flashing { progress: 0 });
        let file = temp_image_path(image.format());
        tokio::fs::write(&file, image.payload()).await?;
        let result = self.flash(&programmer, port.name(), &file, board, cancel).await;
        if let Err(e) = tokio::fs::remove_file(&file).await {
            warn!(path = %file.display(), error = %e, "Failed to remove temporary image");
        }
        result?;

        if self.config.verify {
            self.set_state(UpdateState::Verifying);
            match bootloader::await_return(
                self.provider.as_ref(),
                &request.port,
                self.config.verify_timeout,
                self.config.bootloader.poll_interval,
                cancel,
            )
            .await
            {
                Ok(()) => info!(port = %request.port, "Board is back"),
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => warn!(error = %e, "Could not verify the update"),
            }
        }
        Ok(())
    }

    async fn acquire(
        &self,
        source: &FirmwareSource,
        board: Option<BoardType>,
    ) -> Result<(ImageSource, Vec<u8>), UpdateError> {
        match source {
            FirmwareSource::Local(path) => {
                let data = fetch::read_local(path).await?;
                Ok((ImageSource::LocalPath { path: path.clone() }, data))
            }
            FirmwareSource::Remote { channel } => {
                let fetcher = self.fetcher.as_ref().ok_or(UpdateError::NoCatalog)?;
                let board = board.ok_or(UpdateError::UnknownBoard)?;
                let release = fetcher.latest_release(*channel, board).await?;
                let data = fetcher.download(&release).await?;
                Ok((
                    ImageSource::Remote {
                        url: release.url,
                        version: release.version,
                    },
                    data,
                ))
            }
        }
    }

    async fn flash(
        &self,
        programmer: &ProgrammerConfig,
        port: &str,
        file: &Path,
        board: Option<BoardType>,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let args = programmer.render_args(port, file, board);
        programmer::run(programmer, &args, cancel, |output| match output {
            ProgrammerOutput::Started { pid } => {
                self.emit(UpdateEventKind::ProgrammerStarted { pid })
            }
            ProgrammerOutput::Line(line) => self.emit(UpdateEventKind::Log(line)),
            ProgrammerOutput::Progress(progress) => {
                self.set_state(UpdateState::Flashing { progress })
            }
        })
        .await
    }
}
