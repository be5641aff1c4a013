//! Subcommand implementations

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use futures_util::StreamExt;
use headtrack_core::{compare_versions, BoardType, Channel, DataItem, FirmwareStatus};
use headtrack_link::{CalibrationKind, PortProvider, SerialPortProvider, StreamEvent};
use headtrack_session::{list_ports, probe_ports, ConnectionManager};
use headtrack_update::{
    FirmwareFetcher, FirmwareSource, FirmwareUpdateController, UpdateEvent, UpdateEventKind,
    UpdateRequest, UpdateState,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::Config;

pub struct Context {
    config: Config,
    json: bool,
    provider: Arc<dyn PortProvider>,
}

impl Context {
    pub fn new(config: Config, json: bool) -> Self {
        Self::with_provider(config, json, Arc::new(SerialPortProvider))
    }

    pub fn with_provider(config: Config, json: bool, provider: Arc<dyn PortProvider>) -> Self {
        Self {
            config,
            json,
            provider,
        }
    }

    /// Configured port, or the first port that looks like a head tracker
    fn port(&self) -> Result<String> {
        if let Some(port) = &self.config.link.port {
            return Ok(port.clone());
        }
        let ports = list_ports(self.provider.as_ref()).context("Cannot list serial ports")?;
        match ports.into_iter().find(|p| p.board_hint.is_some()) {
            Some(found) => {
                info!(port = %found.info.name, board = ?found.board_hint, "Using detected port");
                Ok(found.info.name)
            }
            None => bail!("No head tracker found; pass --port"),
        }
    }

    fn manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.provider.clone(), self.config.to_connection_config())
    }

    async fn connect(&self) -> Result<ConnectionManager> {
        let port = self.port()?;
        let manager = self.manager();
        manager
            .connect(&port)
            .await
            .with_context(|| format!("Cannot connect to {}", port))?;
        Ok(manager)
    }

    fn fetcher(&self) -> Result<Option<FirmwareFetcher>> {
        match &self.config.firmware.catalog_url {
            Some(url) => Ok(Some(FirmwareFetcher::new(url.clone())?)),
            None => Ok(None),
        }
    }
}

/// Close a session that should hold no unsaved edits
async fn finish(manager: &ConnectionManager) -> Result<()> {
    manager.disconnect(false).await.context("Disconnect failed")
}

/// Close a session whose edits live in the board's RAM only
async fn finish_unsaved(manager: &ConnectionManager) -> Result<()> {
    if manager.pending_changes().await?.unsaved_to_flash {
        println!("Changes are active but not saved; run `headtrack save` to keep them");
    }
    manager.disconnect(true).await.context("Disconnect failed")
}

pub async fn ports(ctx: &Context, probe: bool) -> Result<()> {
    let ports = list_ports(ctx.provider.as_ref()).context("Cannot list serial ports")?;

    let identities = if probe {
        let names: Vec<String> = ports.iter().map(|p| p.info.name.clone()).collect();
        let config = ctx.config.to_connection_config();
        probe_ports(ctx.provider.clone(), &names, config.baud, config.link).await
    } else {
        Vec::new()
    };

    if ctx.json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                let identity = identities
                    .iter()
                    .find(|(name, _)| *name == p.info.name)
                    .map(|(_, id)| id);
                serde_json::json!({ "port": p, "identity": identity })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for p in &ports {
        let mut line = p.info.name.clone();
        if let (Some(vid), Some(pid)) = (p.info.vid, p.info.pid) {
            let _ = write!(line, "  {:04x}:{:04x}", vid, pid);
        }
        if let Some(product) = &p.info.product {
            let _ = write!(line, "  {}", product);
        }
        if let Some((_, id)) = identities.iter().find(|(name, _)| *name == p.info.name) {
            let _ = write!(line, "  [{} {}]", id.board, id.firmware_version);
        } else if let Some(board) = p.board_hint {
            let _ = write!(line, "  (likely {})", board);
        }
        println!("{}", line);
    }
    Ok(())
}

pub async fn info(ctx: &Context) -> Result<()> {
    let manager = ctx.connect().await?;
    let identity = manager
        .identity()
        .await
        .context("Session closed unexpectedly")?;
    let needs_calibration = manager.needs_calibration().await?;
    let count = manager.parameters().await?.len();

    if ctx.json {
        let out = serde_json::json!({
            "port": manager.port().await,
            "identity": identity,
            "parameters": count,
            "needs_calibration": needs_calibration,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Port:        {}", manager.port().await.unwrap_or_default());
        println!("Board:       {}", identity.board);
        println!("Firmware:    {}", identity.firmware_version);
        println!("Protocol:    {}", identity.protocol_version);
        println!("Features:    {:?}", identity.capabilities);
        println!("Parameters:  {}", count);
        if needs_calibration {
            println!("Calibration: required");
        }
    }
    finish(&manager).await
}

pub async fn get(ctx: &Context, names: &[String]) -> Result<()> {
    let manager = ctx.connect().await?;

    let params = if names.is_empty() {
        manager.parameters().await?
    } else {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            selected.push(manager.get_by_name(name).await?);
        }
        selected
    };

    if ctx.json {
        let map: serde_json::Map<String, serde_json::Value> = params
            .iter()
            .map(|(def, value)| (def.name.to_string(), value.to_string().into()))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        let width = params.iter().map(|(d, _)| d.name.len()).max().unwrap_or(0);
        for (def, value) in &params {
            println!("{:<width$}  {}", def.name, value, width = width);
        }
    }
    finish(&manager).await
}

/// Split `Name=value`
fn parse_assignment(text: &str) -> Result<(&str, &str)> {
    match text.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => bail!("Expected NAME=VALUE, got '{}'", text),
    }
}

pub async fn set(ctx: &Context, assignments: &[String], save: bool) -> Result<()> {
    let parsed = assignments
        .iter()
        .map(|a| parse_assignment(a))
        .collect::<Result<Vec<_>>>()?;

    let manager = ctx.connect().await?;
    for (name, value) in parsed {
        manager
            .set_by_name(name, value)
            .await
            .with_context(|| format!("Cannot set {}", name))?;
    }

    let sent = manager.push().await.context("Sending parameters failed")?;
    println!("Sent {} parameter(s)", sent);

    if save {
        manager.save_to_flash().await.context("Saving to flash failed")?;
        println!("Saved to flash");
        finish(&manager).await
    } else {
        finish_unsaved(&manager).await
    }
}

pub async fn save(ctx: &Context) -> Result<()> {
    let manager = ctx.connect().await?;
    manager.save_to_flash().await.context("Saving to flash failed")?;
    println!("Saved to flash");
    finish(&manager).await
}

pub async fn export(ctx: &Context, file: Option<&Path>) -> Result<()> {
    let manager = ctx.connect().await?;
    let text = manager.export_snapshot().await?;
    match file {
        Some(path) => {
            tokio::fs::write(path, &text)
                .await
                .with_context(|| format!("Cannot write {}", path.display()))?;
            println!("Exported settings to {}", path.display());
        }
        None => print!("{}", text),
    }
    finish(&manager).await
}

pub async fn import(ctx: &Context, file: &Path, save: bool) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Cannot read {}", file.display()))?;

    let manager = ctx.connect().await?;
    let report = manager.import_snapshot(&text).await?;
    for (name, reason) in &report.skipped {
        warn!(name = %name, reason = %reason, "Skipped snapshot entry");
    }
    println!(
        "Applied {} parameter(s), skipped {}",
        report.applied.len(),
        report.skipped.len()
    );

    let sent = manager.push().await.context("Sending parameters failed")?;
    println!("Sent {} parameter(s)", sent);

    if save {
        manager.save_to_flash().await.context("Saving to flash failed")?;
        println!("Saved to flash");
        finish(&manager).await
    } else {
        finish_unsaved(&manager).await
    }
}

fn format_stream_event(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Data { at, samples } => {
            let mut line = at.format("%H:%M:%S%.3f").to_string();
            for sample in samples {
                let _ = write!(line, "  {}={:.2}", sample.item, sample.value);
            }
            line
        }
        StreamEvent::Log { at, line } => format!("{}  [board] {}", at.format("%H:%M:%S%.3f"), line),
        StreamEvent::Device { at, event } => {
            format!("{}  [event] {:?}", at.format("%H:%M:%S%.3f"), event)
        }
    }
}

pub async fn monitor(ctx: &Context, items: &[DataItem], seconds: Option<u64>) -> Result<()> {
    let manager = ctx.connect().await?;
    let mut events = Box::pin(manager.stream_events());
    manager
        .set_stream_items(items)
        .await
        .context("Cannot start streaming")?;
    info!(items = ?items, "Streaming live data, Ctrl-C to stop");

    let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let until = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(until);

    loop {
        tokio::select! {
            _ = &mut until => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(event) => {
                    if ctx.json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        println!("{}", format_stream_event(&event));
                    }
                }
                None => break,
            }
        }
    }

    if let Err(e) = manager.set_stream_items(&[]).await {
        warn!(error = %e, "Cannot stop streaming");
    }
    finish_unsaved(&manager).await
}

pub async fn reboot(ctx: &Context) -> Result<()> {
    let manager = ctx.connect().await?;
    manager.reboot().await.context("Reboot failed")?;
    println!("Board is rebooting");
    Ok(())
}

pub async fn center(ctx: &Context) -> Result<()> {
    let manager = ctx.connect().await?;
    manager.reset_center().await.context("Reset center failed")?;
    println!("Center reset");
    finish(&manager).await
}

pub async fn calibrate(ctx: &Context, kind: CalibrationKind) -> Result<()> {
    let manager = ctx.connect().await?;
    manager
        .calibrate(kind)
        .await
        .with_context(|| format!("Cannot start {:?} calibration", kind))?;
    println!("{:?} calibration started", kind);
    finish(&manager).await
}

pub async fn erase(ctx: &Context, yes: bool) -> Result<()> {
    if !yes {
        bail!("Erasing removes every setting on the board; pass --yes to confirm");
    }
    let manager = ctx.connect().await?;
    manager.erase().await.context("Erase failed")?;
    println!("Settings erased");
    finish(&manager).await
}

pub async fn check(ctx: &Context, channel: Option<Channel>) -> Result<()> {
    let fetcher = ctx
        .fetcher()?
        .context("No firmware.catalog_url configured")?;
    let channel = channel.unwrap_or(ctx.config.firmware.channel);

    let manager = ctx.connect().await?;
    let identity = manager
        .identity()
        .await
        .context("Session closed unexpectedly")?;
    finish(&manager).await?;

    let release = fetcher.latest_release(channel, identity.board).await?;
    let status = compare_versions(&identity.firmware_version, &release);

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    match status {
        FirmwareStatus::UpToDate => {
            println!("{} is up to date ({})", identity.board, identity.firmware_version)
        }
        FirmwareStatus::UpdateAvailable {
            latest_version,
            changelog,
        } => {
            println!(
                "Update available for {}: {} -> {}",
                identity.board, identity.firmware_version, latest_version
            );
            if let Some(changelog) = changelog {
                println!("{}", changelog);
            }
        }
        FirmwareStatus::Unknown => println!(
            "Cannot compare {} with {}",
            identity.firmware_version, release.version
        ),
    }
    Ok(())
}

fn print_update_event(event: &UpdateEvent) {
    match &event.kind {
        UpdateEventKind::State(UpdateState::Flashing { progress }) => {
            println!("Flashing... {}%", progress)
        }
        UpdateEventKind::State(state) => println!("{:?}", state),
        UpdateEventKind::Image {
            format,
            target,
            size,
            sha256,
        } => {
            let target = target.map_or("unknown board".to_string(), |b| b.to_string());
            println!("Image: {} for {}, {} bytes, sha256 {}", format, target, size, sha256);
        }
        UpdateEventKind::BootloaderPort(port) => println!("Bootloader on {}", port),
        UpdateEventKind::ProgrammerStarted { pid } => {
            info!(pid = ?pid, "Programmer started")
        }
        UpdateEventKind::Log(line) => info!(target: "programmer", "{}", line),
    }
}

pub async fn flash(
    ctx: &Context,
    file: Option<PathBuf>,
    channel: Option<Channel>,
    board: Option<BoardType>,
) -> Result<()> {
    let port = ctx.port()?;
    let source = match file {
        Some(path) => FirmwareSource::Local(path),
        None => FirmwareSource::Remote {
            channel: channel.unwrap_or(ctx.config.firmware.channel),
        },
    };

    let mut controller =
        FirmwareUpdateController::new(ctx.provider.clone(), ctx.config.to_update_config());
    if let Some(fetcher) = ctx.fetcher()? {
        controller = controller.with_fetcher(Arc::new(fetcher));
    }

    if board.is_none() {
        // The running firmware tells us which board this is
        let manager = ctx.manager();
        match manager.connect(&port).await {
            Ok(identity) => {
                info!(board = %identity.board, firmware = %identity.firmware_version, "Board identified");
                controller = controller.with_connection(Arc::new(manager));
            }
            Err(e) => warn!(port = %port, error = %e, "Cannot identify board, relying on the image"),
        }
    }

    let mut events = controller.subscribe();
    controller.start(UpdateRequest {
        source,
        port,
        board,
    })?;

    let mut cancelled = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_update_event(&event);
                    if matches!(&event.kind, UpdateEventKind::State(s) if s.is_terminal()) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Missed update events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                controller.cancel();
            }
        }
    }

    match controller.wait().await {
        UpdateState::Done => {
            println!("Firmware update complete");
            Ok(())
        }
        UpdateState::Cancelled => bail!("Firmware update cancelled"),
        UpdateState::Failed(failure) => bail!("Firmware update failed: {}", failure),
        other => bail!("Firmware update stopped in state {:?}", other),
    }
}
