//! Head Tracker CLI - Main entry point
//!
//! Talks to a head tracker board over its serial port: lists ports, reads
//! and writes parameters, streams live data, and flashes firmware.

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use headtrack_core::{BoardType, Channel, DataItem};
use headtrack_link::CalibrationKind;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "headtrack")]
#[command(about = "Configure, monitor and update head tracker boards")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "headtrack.toml")]
    config: PathBuf,

    /// Serial port of the board; found automatically when omitted
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Log level (trace, debug, info, warn, error) or a filter directive
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Print machine-readable JSON where supported
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports, flagging likely head trackers
    Ports {
        /// Handshake with every port to identify boards
        #[arg(long)]
        probe: bool,
    },
    /// Show board identity and settings status
    Info,
    /// Print parameters
    Get {
        /// Parameter names; all parameters when empty
        names: Vec<String>,
    },
    /// Change parameters, e.g. `headtrack set TiltGain=2.5`
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
        /// Also save to the board's flash
        #[arg(long)]
        save: bool,
    },
    /// Save the board's current settings to flash
    Save,
    /// Write the board's settings to a TOML snapshot
    Export {
        /// Output file; stdout when omitted
        file: Option<PathBuf>,
    },
    /// Load settings from a TOML snapshot and send them to the board
    Import {
        file: PathBuf,
        /// Also save to the board's flash
        #[arg(long)]
        save: bool,
    },
    /// Stream live data from the board
    Monitor {
        /// Data items to stream
        #[arg(short, long, value_delimiter = ',', value_parser = parse_item,
              default_values = ["tilt", "roll", "pan"])]
        items: Vec<DataItem>,
        /// Stop after this many seconds; runs until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Reboot the board
    Reboot,
    /// Re-center the outputs
    Center,
    /// Start a sensor calibration routine
    Calibrate {
        #[arg(value_enum)]
        kind: CalibrateKind,
    },
    /// Erase all settings on the board
    Erase {
        /// Confirm the erase
        #[arg(long)]
        yes: bool,
    },
    /// Compare the board's firmware with the release catalog
    Check {
        #[arg(long)]
        channel: Option<Channel>,
    },
    /// Flash firmware from a file or the release catalog
    Flash {
        /// Firmware image (.bin or .hex); latest catalog release when omitted
        file: Option<PathBuf>,
        #[arg(long)]
        channel: Option<Channel>,
        /// Board family, when the board cannot be asked
        #[arg(long, value_parser = parse_board)]
        board: Option<BoardType>,
    },
    /// Write a configuration file with default values
    InitConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CalibrateKind {
    Gyro,
    Accel,
    Mag,
}

impl From<CalibrateKind> for CalibrationKind {
    fn from(kind: CalibrateKind) -> Self {
        match kind {
            CalibrateKind::Gyro => CalibrationKind::Gyro,
            CalibrateKind::Accel => CalibrationKind::Accel,
            CalibrateKind::Mag => CalibrationKind::Mag,
        }
    }
}

fn parse_item(s: &str) -> Result<DataItem, String> {
    DataItem::from_name(s).ok_or_else(|| format!("unknown data item '{}'", s))
}

fn parse_board(s: &str) -> Result<BoardType, String> {
    BoardType::from_name(s).ok_or_else(|| format!("unknown board '{}'", s))
}

/// Filter for `level`; RUST_LOG wins, anything unparsable means `info`
fn log_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging before anything else logs
    let builder = FmtSubscriber::builder()
        .with_env_filter(log_filter(args.log_level.as_deref()))
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter_reloading();
    let filter = builder.reload_handle();
    tracing::subscriber::set_global_default(builder.finish())?;

    info!("Head Tracker CLI v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    match args.log_level {
        Some(level) => config.logging.level = level,
        None => filter.reload(log_filter(Some(&config.logging.level)))?,
    }
    if let Some(baud) = args.baud {
        config.link.baud = baud;
    }
    if let Some(port) = args.port {
        config.link.port = Some(port);
    }

    info!(
        config = %args.config.display(),
        baud = config.link.baud,
        port = ?config.link.port,
        log_level = %config.logging.level,
        "Configuration loaded"
    );

    let ctx = commands::Context::new(config, args.json);

    match args.command {
        Command::Ports { probe } => commands::ports(&ctx, probe).await,
        Command::Info => commands::info(&ctx).await,
        Command::Get { names } => commands::get(&ctx, &names).await,
        Command::Set { assignments, save } => commands::set(&ctx, &assignments, save).await,
        Command::Save => commands::save(&ctx).await,
        Command::Export { file } => commands::export(&ctx, file.as_deref()).await,
        Command::Import { file, save } => commands::import(&ctx, &file, save).await,
        Command::Monitor { items, seconds } => commands::monitor(&ctx, &items, seconds).await,
        Command::Reboot => commands::reboot(&ctx).await,
        Command::Center => commands::center(&ctx).await,
        Command::Calibrate { kind } => commands::calibrate(&ctx, kind.into()).await,
        Command::Erase { yes } => commands::erase(&ctx, yes).await,
        Command::Check { channel } => commands::check(&ctx, channel).await,
        Command::Flash {
            file,
            channel,
            board,
        } => commands::flash(&ctx, file, channel, board).await,
        Command::InitConfig => {
            config::save_default_config(&args.config)?;
            println!("Wrote {}", args.config.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "headtrack", "--port", "/dev/ttyACM0", "set", "TiltGain=2.5", "PanCenter=1500", "--save",
        ])
        .unwrap();
        assert_eq!(args.port.as_deref(), Some("/dev/ttyACM0"));
        match args.command {
            Command::Set { assignments, save } => {
                assert_eq!(assignments, vec!["TiltGain=2.5", "PanCenter=1500"]);
                assert!(save);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_monitor_items() {
        let args = Args::try_parse_from(["headtrack", "monitor"]).unwrap();
        match args.command {
            Command::Monitor { items, seconds } => {
                assert_eq!(items, vec![DataItem::Tilt, DataItem::Roll, DataItem::Pan]);
                assert_eq!(seconds, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let args = Args::try_parse_from(["headtrack", "monitor", "-i", "accx,gyroz", "--seconds", "5"])
            .unwrap();
        match args.command {
            Command::Monitor { items, seconds } => {
                assert_eq!(items, vec![DataItem::AccX, DataItem::GyroZ]);
                assert_eq!(seconds, Some(5));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Args::try_parse_from(["headtrack", "monitor", "-i", "altitude"]).is_err());
    }

    #[test]
    fn test_log_filter() {
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return;
        }
        assert_eq!(log_filter(None).to_string(), "info");
        assert_eq!(log_filter(Some("debug")).to_string(), "debug");
        assert_eq!(
            log_filter(Some("headtrack_link=trace")).to_string(),
            "headtrack_link=trace"
        );
        assert_eq!(log_filter(Some("headtrack=loud")).to_string(), "info");
    }

    #[test]
    fn test_flash_args() {
        let args = Args::try_parse_from([
            "headtrack", "flash", "--channel", "testing", "--board", "nano33ble",
        ])
        .unwrap();
        match args.command {
            Command::Flash {
                file,
                channel,
                board,
            } => {
                assert!(file.is_none());
                assert_eq!(channel, Some(Channel::Testing));
                assert_eq!(board, Some(BoardType::Nano33Ble));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Args::try_parse_from(["headtrack", "set"]).is_err());
    }
}
