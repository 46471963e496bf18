//! Device registry
//! The single ordered collection of known peripherals. All changes go through
//! [`DeviceRegistry::dispatch`]; readers get whole snapshots only.

use std::sync::Mutex;

use log::{debug, info};
use serde_json::Value;
use tokio::sync::watch;

use crate::core::bluetooth::error::{BleError, BleResult};
use crate::core::bluetooth::types::{
    DiscoveredService, Peripheral, ScannedPeripheral, ServiceTable,
};

/// The four transitions the registry understands.
#[derive(Debug, Clone)]
pub enum DeviceAction {
    Scanned(ScannedPeripheral),
    Connected {
        address: String,
        service_table: ServiceTable,
    },
    Disconnected {
        address: String,
    },
    Clear,
}

impl DeviceAction {
    /// Parses a string-tagged action as sent by a UI layer, e.g.
    /// `{"type": "DISCONNECTED_DEVICE", "payload": {"address": "..."}}`.
    pub fn from_json(json: &str) -> BleResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| BleError::UnsupportedAction(format!("malformed action: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BleError::UnsupportedAction("action without a type".to_string()))?;
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);

        let malformed = |e: serde_json::Error| BleError::UnsupportedAction(format!("{}: {}", kind, e));
        match kind {
            "SCANNED_DEVICE" => Ok(Self::Scanned(serde_json::from_value(payload).map_err(malformed)?)),
            "CONNECTED_DEVICE" => {
                #[derive(serde::Deserialize)]
                struct Connected {
                    address: String,
                    services: Vec<DiscoveredService>,
                }
                let connected: Connected = serde_json::from_value(payload).map_err(malformed)?;
                Ok(Self::Connected {
                    address: connected.address,
                    service_table: ServiceTable::from_discovery(&connected.services),
                })
            }
            "DISCONNECTED_DEVICE" => {
                #[derive(serde::Deserialize)]
                struct Disconnected {
                    address: String,
                }
                let disconnected: Disconnected = serde_json::from_value(payload).map_err(malformed)?;
                Ok(Self::Disconnected {
                    address: disconnected.address,
                })
            }
            "CLEAR" => Ok(Self::Clear),
            other => Err(BleError::UnsupportedAction(other.to_string())),
        }
    }
}

/// Applies one action. Returns whether the collection changed.
fn reduce(devices: &mut Vec<Peripheral>, action: DeviceAction) -> BleResult<bool> {
    match action {
        DeviceAction::Scanned(scanned) => {
            match devices.iter_mut().find(|d| d.address() == scanned.address) {
                Some(existing) => {
                    // a scan only refreshes the timestamp, never the connection state
                    existing.touch(scanned.seen_at);
                }
                None => {
                    info!("Adding device {} ({})", scanned.address, scanned.name);
                    devices.push(Peripheral::discovered(&scanned));
                }
            }
            Ok(true)
        }
        DeviceAction::Connected {
            address,
            service_table,
        } => {
            let existing = devices
                .iter_mut()
                .find(|d| d.address() == address)
                .ok_or_else(|| BleError::UnknownDevice(address.clone()))?;
            existing.set_connected(service_table);
            info!("Device {} connected", address);
            Ok(true)
        }
        DeviceAction::Disconnected { address } => {
            let Some(position) = devices.iter().position(|d| d.address() == address) else {
                debug!("Ignoring disconnect of unknown device {}", address);
                return Ok(false);
            };
            let mut removed = devices.remove(position);
            removed.set_disconnected();
            info!("Device {} disconnected and removed", address);
            Ok(true)
        }
        DeviceAction::Clear => {
            let before = devices.len();
            devices.retain(Peripheral::is_connected);
            info!("Cleared {} devices", before - devices.len());
            Ok(before != devices.len())
        }
    }
}

/// Known peripherals in insertion order.
pub struct DeviceRegistry {
    devices: Mutex<Vec<Peripheral>>,
    snapshot_tx: watch::Sender<Vec<Peripheral>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            devices: Mutex::new(Vec::new()),
            snapshot_tx,
        }
    }

    /// Applies an action and publishes the resulting snapshot.
    pub fn dispatch(&self, action: DeviceAction) -> BleResult<()> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = devices.clone();
        if reduce(&mut next, action)? {
            *devices = next;
            // published under the lock so subscribers see transitions in order
            self.snapshot_tx.send_replace(devices.clone());
        }
        Ok(())
    }

    pub fn dispatch_json(&self, json: &str) -> BleResult<()> {
        self.dispatch(DeviceAction::from_json(json)?)
    }

    pub fn on_scanned(&self, scanned: ScannedPeripheral) -> BleResult<()> {
        self.dispatch(DeviceAction::Scanned(scanned))
    }

    pub fn on_connected(&self, address: &str, service_table: ServiceTable) -> BleResult<()> {
        self.dispatch(DeviceAction::Connected {
            address: address.to_string(),
            service_table,
        })
    }

    pub fn on_disconnected(&self, address: &str) -> BleResult<()> {
        self.dispatch(DeviceAction::Disconnected {
            address: address.to_string(),
        })
    }

    pub fn on_clear(&self) -> BleResult<()> {
        self.dispatch(DeviceAction::Clear)
    }

    pub fn snapshot(&self) -> Vec<Peripheral> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn get(&self, address: &str) -> Option<Peripheral> {
        self.snapshot_tx
            .borrow()
            .iter()
            .find(|d| d.address() == address)
            .cloned()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.snapshot_tx
            .borrow()
            .iter()
            .any(|d| d.address() == address && d.is_connected())
    }

    pub fn len(&self) -> usize {
        self.snapshot_tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change feed; each value is a complete snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Peripheral>> {
        self.snapshot_tx.subscribe()
    }
}
