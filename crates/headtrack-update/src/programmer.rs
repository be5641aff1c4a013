//! External programmer process
//!
//! The bootloader protocols belong to the board vendors, so flashing is
//! done by their command line tools. We fill in the argument template,
//! relay every output line, and turn the tool's percentage markers into
//! progress updates.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use futures_util::{Stream, StreamExt};
use headtrack_core::BoardType;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::UpdateError;

/// Output lines kept for the failure message
const TAIL_LINES: usize = 5;

/// Line length cap; progress bars can be long
const MAX_LINE: usize = 4096;

/// Command template for a flashing tool
///
/// `{port}`, `{file}` and `{board}` in the arguments are replaced before
/// the tool is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProgrammerConfig {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Vendor tool for boards that have a well-known one
    pub fn for_board(board: BoardType) -> Option<Self> {
        match board {
            BoardType::Nano33Ble => Some(Self::new(
                "bossac",
                &["-d", "--port={port}", "-U", "-i", "-e", "-w", "{file}", "-R"],
            )),
            BoardType::XiaoSense => Some(Self::new(
                "adafruit-nrfutil",
                &["dfu", "serial", "--package", "{file}", "-p", "{port}", "-b", "115200", "--singlebank"],
            )),
            BoardType::Esp32C3 => Some(Self::new(
                "esptool.py",
                &["--chip", "esp32c3", "--port", "{port}", "write_flash", "0x0", "{file}"],
            )),
            BoardType::DtqSys => None,
        }
    }

    /// Arguments with placeholders filled in
    pub fn render_args(&self, port: &str, file: &Path, board: Option<BoardType>) -> Vec<String> {
        let file = file.to_string_lossy();
        let board = board.map(|b| b.as_str()).unwrap_or_default();
        self.args
            .iter()
            .map(|a| {
                a.replace("{port}", port)
                    .replace("{file}", &file)
                    .replace("{board}", board)
            })
            .collect()
    }
}

/// Something the programmer reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgrammerOutput {
    Started { pid: Option<u32> },
    Line(String),
    Progress(u8),
}

/// Last percentage marker in a line of tool output
///
/// Handles `45%`, `(45 %)` and `[====] 100%`; values above 100 are clamped.
pub fn parse_progress(line: &str) -> Option<u8> {
    let bytes = line.as_bytes();
    let mut found = None;

    for (i, b) in bytes.iter().enumerate() {
        if *b != b'%' {
            continue;
        }
        let mut end = i;
        while end > 0 && bytes[end - 1] == b' ' {
            end -= 1;
        }
        let mut start = end;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start == end {
            continue;
        }
        if let Ok(value) = line[start..end].parse::<u32>() {
            found = Some(value.min(100) as u8);
        }
    }
    found
}

/// Lines from one output pipe, split on `\r` or `\n`
///
/// A line longer than [`MAX_LINE`] is dropped and reading carries on with
/// the next one.
fn lines<R: AsyncRead + Unpin>(pipe: R) -> impl Stream<Item = Vec<u8>> {
    let codec = AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), Vec::new(), MAX_LINE);
    let framed = FramedRead::new(pipe, codec);
    futures_util::stream::unfold((framed, false), |(mut framed, mut errored)| async move {
        loop {
            match framed.next().await {
                Some(Ok(line)) => return Some((line.to_vec(), (framed, false))),
                Some(Err(e)) => {
                    warn!(error = %e, "Skipping unreadable programmer output");
                    errored = true;
                }
                // After a decode error the reader yields one `None` before resuming
                None if errored => errored = false,
                None => return None,
            }
        }
    })
}

/// Run the programmer to completion
///
/// stdout and stderr are both relayed line by line; `\r` counts as a line
/// break so in-place progress bars are seen. Cancellation kills the process
/// and waits for it to exit.
pub async fn run(
    config: &ProgrammerConfig,
    args: &[String],
    cancel: &CancellationToken,
    mut on_output: impl FnMut(ProgrammerOutput),
) -> Result<(), UpdateError> {
    info!(program = %config.program, args = ?args, "Starting programmer");

    let mut child = Command::new(&config.program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| UpdateError::ProgrammerError {
            code: None,
            message: format!("cannot start {}: {}", config.program, e),
        })?;
    on_output(ProgrammerOutput::Started { pid: child.id() });

    let stdout = child.stdout.take().map(lines);
    let stderr = child.stderr.take().map(lines);
    let mut output = Box::pin(futures_util::stream::select(
        futures_util::stream::iter(stdout).flatten(),
        futures_util::stream::iter(stderr).flatten(),
    ));

    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let mut last_progress = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %config.program, "Cancelling programmer");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill programmer");
                }
                return Err(UpdateError::Cancelled);
            }
            item = output.next() => match item {
                Some(bytes) => {
                    let line = String::from_utf8_lossy(&bytes).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(line = %line, "Programmer output");
                    if let Some(percent) = parse_progress(&line) {
                        if last_progress != Some(percent) {
                            last_progress = Some(percent);
                            on_output(ProgrammerOutput::Progress(percent));
                        }
                    }
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    on_output(ProgrammerOutput::Line(line));
                }
                None => break,
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(UpdateError::Cancelled);
        }
        status = child.wait() => status?,
    };

    if status.success() {
        info!(program = %config.program, "Programmer finished");
        Ok(())
    } else {
        let message = tail.back().cloned().unwrap_or_default();
        warn!(program = %config.program, code = ?status.code(), message = %message, "Programmer failed");
        Err(UpdateError::ProgrammerError {
            code: status.code(),
            message,
        })
    }
}
