//! In-memory port provider for tests
//!
//! Ports are registered by name. A port with a [`SimBoard`] attached spawns
//! a fresh simulated board on every open; a bare port opens onto a pipe
//! nobody answers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use headtrack_link::sim::{SimBoard, SimHandle};
use headtrack_link::{PortInfo, PortProvider, SerialIo, TransportError};
use tokio::io::DuplexStream;

/// Baud rate that makes a simulated board drop into its bootloader
pub const TOUCH_BAUD: u32 = 1200;

#[derive(Default)]
pub struct FakeProvider {
    ports: Mutex<BTreeMap<String, PortInfo>>,
    boards: Mutex<BTreeMap<String, SimBoard>>,
    busy: Mutex<BTreeSet<String>>,
    handles: Mutex<BTreeMap<String, SimHandle>>,
    bootloader: Mutex<BTreeMap<String, String>>,
    opens: Mutex<Vec<(String, u32)>>,
    // Far ends of silent ports, kept open so reads block instead of hitting EOF
    silent: Mutex<Vec<DuplexStream>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, info: PortInfo) {
        lock(&self.ports).insert(info.name.clone(), info);
    }

    /// Register a port with a simulated board behind it
    pub fn add_board(&self, name: &str, board: SimBoard) {
        self.add_port(PortInfo::named(name));
        lock(&self.boards).insert(name.to_string(), board);
    }

    pub fn remove_port(&self, name: &str) {
        lock(&self.ports).remove(name);
    }

    /// Make opens of `name` fail as if another program held the port
    pub fn set_busy(&self, name: &str, busy: bool) {
        let mut set = lock(&self.busy);
        if busy {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Opening `from` at [`TOUCH_BAUD`] replaces it with port `to`
    pub fn set_bootloader_port(&self, from: &str, to: &str) {
        lock(&self.bootloader).insert(from.to_string(), to.to_string());
    }

    /// Control handle of the board spawned by the latest open of `name`
    pub fn take_handle(&self, name: &str) -> Option<SimHandle> {
        lock(&self.handles).remove(name)
    }

    /// Every open attempt so far, with its baud rate
    pub fn opens(&self) -> Vec<(String, u32)> {
        lock(&self.opens).clone()
    }
}

impl PortProvider for FakeProvider {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialIo>, TransportError> {
        lock(&self.opens).push((port.to_string(), baud));

        if lock(&self.busy).contains(port) {
            return Err(TransportError::Busy(port.to_string()));
        }
        if !lock(&self.ports).contains_key(port) {
            return Err(TransportError::NotFound(port.to_string()));
        }

        if baud == TOUCH_BAUD {
            if let Some(next) = lock(&self.bootloader).remove(port) {
                self.remove_port(port);
                self.add_port(PortInfo::named(next));
            }
        }

        let board = lock(&self.boards).get(port).cloned();
        match board {
            Some(board) => {
                let (io, handle) = board.spawn();
                lock(&self.handles).insert(port.to_string(), handle);
                Ok(io)
            }
            None => {
                let (host, device) = tokio::io::duplex(1024);
                lock(&self.silent).push(device);
                Ok(Box::new(host))
            }
        }
    }

    fn available_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        Ok(lock(&self.ports).values().cloned().collect())
    }
}
