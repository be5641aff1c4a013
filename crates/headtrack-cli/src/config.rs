//! Configuration loading

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use headtrack_core::Channel;
use headtrack_link::LinkConfig;
use headtrack_session::{ConnectionConfig, LivenessConfig};
use headtrack_update::{BootloaderConfig, ProgrammerConfig, UpdateConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub liveness: LivenessSection,
    #[serde(default)]
    pub firmware: FirmwareSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSection {
    /// Port to use when none is given on the command line
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: u32,
    #[serde(default = "default_max_timeouts")]
    pub max_consecutive_timeouts: u32,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_baud(),
            request_timeout_ms: default_request_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            handshake_retries: default_handshake_retries(),
            max_consecutive_timeouts: default_max_timeouts(),
        }
    }
}

fn default_baud() -> u32 {
    115_200
}

fn default_request_timeout() -> u64 {
    800
}

fn default_handshake_timeout() -> u64 {
    2000
}

fn default_handshake_retries() -> u32 {
    3
}

fn default_max_timeouts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessSection {
    /// Silence before a probe is sent
    #[serde(default = "default_idle")]
    pub idle_ms: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            idle_ms: default_idle(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

fn default_idle() -> u64 {
    1500
}

fn default_probe_interval() -> u64 {
    500
}

fn default_probe_timeout() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareSection {
    /// Base URL holding `{channel}/catalog.json`
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default = "default_bootloader_baud")]
    pub bootloader_baud: u32,
    #[serde(default = "default_port_poll_timeout")]
    pub port_poll_timeout_ms: u64,
    #[serde(default = "default_port_poll_interval")]
    pub port_poll_interval_ms: u64,
    /// Wait for the board to come back after flashing
    #[serde(default)]
    pub verify: bool,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_ms: u64,
    /// Replaces the built-in programmer for every board
    #[serde(default)]
    pub programmer: Option<ProgrammerConfig>,
}

impl Default for FirmwareSection {
    fn default() -> Self {
        Self {
            catalog_url: None,
            channel: Channel::Stable,
            bootloader_baud: default_bootloader_baud(),
            port_poll_timeout_ms: default_port_poll_timeout(),
            port_poll_interval_ms: default_port_poll_interval(),
            verify: false,
            verify_timeout_ms: default_verify_timeout(),
            programmer: None,
        }
    }
}

fn default_bootloader_baud() -> u32 {
    1200
}

fn default_port_poll_timeout() -> u64 {
    8000
}

fn default_port_poll_interval() -> u64 {
    200
}

fn default_verify_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level or `tracing` filter directive
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            baud: self.link.baud,
            link: LinkConfig {
                request_timeout: Duration::from_millis(self.link.request_timeout_ms),
                handshake_timeout: Duration::from_millis(self.link.handshake_timeout_ms),
                handshake_retries: self.link.handshake_retries,
                max_consecutive_timeouts: self.link.max_consecutive_timeouts,
                ..LinkConfig::default()
            },
            liveness: LivenessConfig {
                idle: Duration::from_millis(self.liveness.idle_ms),
                probe_interval: Duration::from_millis(self.liveness.probe_interval_ms),
                probe_timeout: Duration::from_millis(self.liveness.probe_timeout_ms),
            },
        }
    }

    pub fn to_update_config(&self) -> UpdateConfig {
        let fw = &self.firmware;
        UpdateConfig {
            bootloader: BootloaderConfig {
                touch_baud: fw.bootloader_baud,
                poll_timeout: Duration::from_millis(fw.port_poll_timeout_ms),
                poll_interval: Duration::from_millis(fw.port_poll_interval_ms),
            },
            programmer: fw.programmer.clone(),
            verify: fw.verify,
            verify_timeout: Duration::from_millis(fw.verify_timeout_ms),
        }
    }
}

/// Load configuration from file; a missing file means defaults
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Example override, left commented out so each board keeps its own tool
const PROGRAMMER_EXAMPLE: &str = r#"
# Replace the built-in flashing tool for every board.
# {port}, {file} and {board} are filled in before it runs.
#
# [firmware.programmer]
# program = "bossac"
# args = ["-d", "--port={port}", "-U", "-i", "-e", "-w", "{file}", "-R"]
"#;

/// Write a configuration file with every default spelled out
pub fn save_default_config(path: &Path) -> Result<()> {
    let mut content = toml::to_string_pretty(&Config::default())?;
    content.push_str(PROGRAMMER_EXAMPLE);
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use headtrack_core::BoardType;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("headtrack.toml")).unwrap();
        assert_eq!(config.link.baud, 115_200);
        assert_eq!(config.firmware.bootloader_baud, 1200);
        assert_eq!(config.firmware.channel, Channel::Stable);
        assert_eq!(config.logging.level, "info");
        assert!(config.firmware.programmer.is_none());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headtrack.toml");
        std::fs::write(
            &path,
            r#"
[link]
port = "/dev/ttyACM0"
request_timeout_ms = 300

[firmware]
channel = "testing"
catalog_url = "https://fw.example.org/headtracker"

[firmware.programmer]
program = "bossac"
args = ["--port={port}", "{file}"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.link.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.link.handshake_retries, 3);
        assert_eq!(config.firmware.channel, Channel::Testing);

        let conn = config.to_connection_config();
        assert_eq!(conn.link.request_timeout, Duration::from_millis(300));
        assert_eq!(conn.liveness.idle, Duration::from_millis(1500));

        let update = config.to_update_config();
        assert_eq!(update.programmer.unwrap().program, "bossac");
        assert_eq!(update.bootloader.poll_timeout, Duration::from_millis(8000));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headtrack.toml");
        std::fs::write(&path, "[link]\nbaud = \"fast\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headtrack.toml");
        save_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.link.baud, 115_200);
        assert!(config.firmware.programmer.is_none());
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("# [firmware.programmer]"));
    }

    #[test]
    fn test_default_config_keeps_board_programmers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headtrack.toml");
        save_default_config(&path).unwrap();
        let update = load_config(&path).unwrap().to_update_config();

        for board in BoardType::ALL {
            assert_eq!(
                update.programmer_for(Some(board)),
                ProgrammerConfig::for_board(board),
                "{board}"
            );
        }
        assert_eq!(
            update.programmer_for(Some(BoardType::XiaoSense)).unwrap().program,
            "adafruit-nrfutil"
        );
    }
}
