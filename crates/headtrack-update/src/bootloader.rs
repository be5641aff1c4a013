//! Bootloader entry by baud-rate touch
//!
//! Opening the board's port at a marker baud rate and closing it again
//! makes the firmware reset into its bootloader. The bootloader usually
//! enumerates as a new port, so we poll the port list until one shows up,
//! falling back to the original port when none does.

use std::time::Duration;

use headtrack_link::{PortInfo, PortProvider, TransportError};
use headtrack_session::new_ports;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::UpdateError;

#[derive(Debug, Clone)]
pub struct BootloaderConfig {
    pub touch_baud: u32,
    /// How long to wait for the bootloader port
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            touch_baud: 1200,
            poll_timeout: Duration::from_millis(8000),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Which port the bootloader was found on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootloaderPort {
    /// A port that was not present before the touch
    Appeared(String),
    /// No new port appeared; the original is still there
    Original(String),
}

impl BootloaderPort {
    pub fn name(&self) -> &str {
        match self {
            Self::Appeared(name) | Self::Original(name) => name,
        }
    }
}

/// Open `port` at the touch baud rate and close it immediately
pub fn touch(provider: &dyn PortProvider, port: &str, baud: u32) -> Result<(), TransportError> {
    let io = provider.open(port, baud)?;
    drop(io);
    info!(port = %port, baud, "Sent bootloader touch");
    Ok(())
}

fn list(provider: &dyn PortProvider) -> Vec<PortInfo> {
    provider.available_ports().unwrap_or_else(|e| {
        warn!(error = %e, "Cannot list serial ports");
        Vec::new()
    })
}

/// Poll until a port not in `before` appears
///
/// On timeout, returns the original port if it is present and fails with
/// [`UpdateError::BootloaderEntryFailed`] otherwise.
pub async fn await_port(
    provider: &dyn PortProvider,
    before: &[PortInfo],
    original: &str,
    config: &BootloaderConfig,
    cancel: &CancellationToken,
) -> Result<BootloaderPort, UpdateError> {
    let deadline = tokio::time::Instant::now() + config.poll_timeout;
    let mut polls = 0u32;

    loop {
        let now = list(provider);
        polls += 1;
        if let Some(port) = new_ports(before, &now).into_iter().next() {
            info!(port = %port.name, polls, "Bootloader port appeared");
            return Ok(BootloaderPort::Appeared(port.name));
        }

        if tokio::time::Instant::now() >= deadline {
            if now.iter().any(|p| p.name == original) {
                warn!(port = %original, "No new port appeared, using the original");
                return Ok(BootloaderPort::Original(original.to_string()));
            }
            return Err(UpdateError::BootloaderEntryFailed(format!(
                "no port appeared within {:?} and {} is gone",
                config.poll_timeout, original
            )));
        }

        debug!(polls, "Waiting for bootloader port");
        tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}

/// Poll until `port` is listed again
pub async fn await_return(
    provider: &dyn PortProvider,
    port: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), UpdateError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if list(provider).iter().any(|p| p.name == port) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(UpdateError::VerifyFailed(format!(
                "{} did not come back within {:?}",
                port, timeout
            )));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headtrack_core::BoardType;
    use headtrack_link::sim::SimBoard;
    use headtrack_session::testing::FakeProvider;

    fn fast() -> BootloaderConfig {
        BootloaderConfig {
            touch_baud: 1200,
            poll_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_touch_then_new_port() {
        let provider = FakeProvider::new();
        provider.add_board("/dev/ttyACM0", SimBoard::new(BoardType::Nano33Ble, 2));
        provider.set_bootloader_port("/dev/ttyACM0", "/dev/ttyACM1");

        let before = provider.available_ports().unwrap();
        touch(&provider, "/dev/ttyACM0", 1200).unwrap();
        assert_eq!(provider.opens(), vec![("/dev/ttyACM0".to_string(), 1200)]);

        let port = await_port(&provider, &before, "/dev/ttyACM0", &fast(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(port, BootloaderPort::Appeared("/dev/ttyACM1".to_string()));
    }

    #[tokio::test]
    async fn test_falls_back_to_original() {
        let provider = FakeProvider::new();
        provider.add_port(PortInfo::named("COM5"));
        let before = provider.available_ports().unwrap();

        let port = await_port(&provider, &before, "COM5", &fast(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(port, BootloaderPort::Original("COM5".to_string()));
        assert_eq!(port.name(), "COM5");
    }

    #[tokio::test]
    async fn test_port_never_reappears() {
        let provider = FakeProvider::new();
        provider.add_port(PortInfo::named("COM5"));
        let before = provider.available_ports().unwrap();
        provider.remove_port("COM5");

        let err = await_port(&provider, &before, "COM5", &fast(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::BootloaderEntryFailed(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_polling_promptly() {
        let provider = FakeProvider::new();
        let config = BootloaderConfig {
            poll_timeout: Duration::from_secs(30),
            ..fast()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = await_port(&provider, &[], "COM5", &config, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_touch_missing_port() {
        let provider = FakeProvider::new();
        assert!(matches!(
            touch(&provider, "/dev/ttyACM7", 1200),
            Err(TransportError::NotFound(_))
        ));
    }
}
