//! Serial port discovery

use std::sync::Arc;

use headtrack_core::{BoardIdentity, BoardType};
use headtrack_link::{BoardLink, LinkConfig, PortInfo, PortProvider, TransportError};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// A serial port plus what we can tell about it without opening it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPort {
    pub info: PortInfo,
    /// Board family suggested by the USB vendor ID
    pub board_hint: Option<BoardType>,
}

/// Board family whose USB vendor ID matches the port
pub fn board_hint(info: &PortInfo) -> Option<BoardType> {
    let vid = info.vid?;
    BoardType::ALL
        .into_iter()
        .find(|b| b.usb_vendor_ids().contains(&vid))
}

/// List ports, known head tracker boards first
pub fn list_ports(provider: &dyn PortProvider) -> Result<Vec<DiscoveredPort>, TransportError> {
    let mut ports: Vec<DiscoveredPort> = provider
        .available_ports()?
        .into_iter()
        .map(|info| DiscoveredPort {
            board_hint: board_hint(&info),
            info,
        })
        .collect();
    ports.sort_by(|a, b| {
        b.board_hint
            .is_some()
            .cmp(&a.board_hint.is_some())
            .then_with(|| a.info.name.cmp(&b.info.name))
    });
    debug!(count = ports.len(), "Listed serial ports");
    Ok(ports)
}

/// Ports present in `after` that were not in `before`
pub fn new_ports(before: &[PortInfo], after: &[PortInfo]) -> Vec<PortInfo> {
    after
        .iter()
        .filter(|p| !before.iter().any(|b| b.name == p.name))
        .cloned()
        .collect()
}

/// Handshake with every port in parallel and report the ones that answer
pub async fn probe_ports(
    provider: Arc<dyn PortProvider>,
    ports: &[String],
    baud: u32,
    config: LinkConfig,
) -> Vec<(String, BoardIdentity)> {
    let mut tasks = JoinSet::new();

    for port in ports {
        let port = port.clone();
        let provider = provider.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let io = match provider.open(&port, baud) {
                Ok(io) => io,
                Err(e) => {
                    debug!(port = %port, error = %e, "Cannot open port for probing");
                    return None;
                }
            };
            let link = BoardLink::new(io, config);
            match link.handshake().await {
                Ok(identity) => Some((port, identity)),
                Err(e) => {
                    debug!(port = %port, error = %e, "No board on port");
                    None
                }
            }
        });
    }

    let mut found = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Some((port, identity))) = result {
            info!(port = %port, board = %identity.board, "Found head tracker");
            found.push((port, identity));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use headtrack_link::sim::SimBoard;
    use std::time::Duration;

    fn usb(name: &str, vid: u16) -> PortInfo {
        PortInfo {
            vid: Some(vid),
            pid: Some(0x8036),
            ..PortInfo::named(name)
        }
    }

    #[test]
    fn test_board_hint_from_vid() {
        assert_eq!(board_hint(&usb("/dev/ttyACM0", 0x2341)), Some(BoardType::Nano33Ble));
        assert_eq!(board_hint(&usb("/dev/ttyACM1", 0x303a)), Some(BoardType::Esp32C3));
        assert_eq!(board_hint(&usb("/dev/ttyUSB0", 0x0403)), None);
        assert_eq!(board_hint(&PortInfo::named("/dev/ttyS0")), None);
    }

    #[test]
    fn test_list_ports_known_boards_first() {
        let provider = FakeProvider::new();
        provider.add_port(PortInfo::named("/dev/ttyS0"));
        provider.add_port(usb("/dev/ttyUSB0", 0x0403));
        provider.add_port(usb("/dev/ttyACM3", 0x2886));

        let ports = list_ports(&provider).unwrap();
        let names: Vec<_> = ports.iter().map(|p| p.info.name.as_str()).collect();
        assert_eq!(names, vec!["/dev/ttyACM3", "/dev/ttyS0", "/dev/ttyUSB0"]);
        assert_eq!(ports[0].board_hint, Some(BoardType::XiaoSense));
    }

    #[test]
    fn test_new_ports() {
        let before = vec![PortInfo::named("COM3"), PortInfo::named("COM4")];
        let after = vec![PortInfo::named("COM4"), PortInfo::named("COM7")];
        assert_eq!(new_ports(&before, &after), vec![PortInfo::named("COM7")]);
        assert!(new_ports(&after, &after).is_empty());
    }

    #[tokio::test]
    async fn test_probe_ports_finds_answering_boards() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_board("/dev/ttyACM0", SimBoard::new(BoardType::Nano33Ble, 2));
        provider.add_port(PortInfo::named("/dev/ttyS0"));

        let config = LinkConfig {
            handshake_timeout: Duration::from_millis(50),
            handshake_retries: 1,
            ..LinkConfig::default()
        };
        let ports = vec!["/dev/ttyACM0".to_string(), "/dev/ttyS0".to_string()];
        let found = probe_ports(provider, &ports, 115200, config).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "/dev/ttyACM0");
        assert_eq!(found[0].1.board, BoardType::Nano33Ble);
    }
}
