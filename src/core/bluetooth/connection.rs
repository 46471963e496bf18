//! Bluetooth connection handling
//! Connects with a bounded timeout, discovers services and builds the
//! service table. A failure after the link is up always triggers a
//! best-effort disconnect.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use crate::core::bluetooth::adapter::{AdapterError, BleAdapter};
use crate::core::bluetooth::error::{BleError, BleResult};
use crate::core::bluetooth::types::ServiceTable;

/// Marks an address as connecting for as long as it lives.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    address: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<Mutex<HashSet<String>>>, address: &str) -> BleResult<Self> {
        let inserted = in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string());
        if !inserted {
            return Err(BleError::ConnectInProgress(address.to_string()));
        }
        Ok(Self {
            in_flight: in_flight.clone(),
            address: address.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.address);
    }
}

/// Connection manager for SunFibre peripherals
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Arc<dyn BleAdapter>,
    connect_timeout_ms: u64,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ConnectionManager {
    pub fn new(adapter: Arc<dyn BleAdapter>, connect_timeout_ms: u64) -> Self {
        Self {
            adapter,
            connect_timeout_ms,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn is_connecting(&self, address: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address)
    }

    /// Connects and discovers. Only one attempt per address may be in flight.
    pub async fn connect(&self, address: &str) -> BleResult<ServiceTable> {
        let _guard = InFlightGuard::acquire(&self.in_flight, address)?;
        let timeout_ms = self.connect_timeout_ms;

        info!("Initiating connection to {}...", address);
        match tokio::time::timeout(self.connect_timeout(), self.adapter.connect(address)).await {
            Ok(Ok(())) => {}
            Err(_) | Ok(Err(AdapterError::Timeout)) => {
                warn!("Connection to {} timed out after {} ms", address, timeout_ms);
                // cancels the pending platform connection
                self.best_effort_disconnect(address).await;
                return Err(BleError::ConnectTimeout {
                    address: address.to_string(),
                    timeout_ms,
                });
            }
            Ok(Err(e)) => {
                error!("Connection to {} failed: {}", address, e);
                return Err(BleError::ConnectFailed {
                    address: address.to_string(),
                    source: e,
                });
            }
        }

        info!("Connection successful, discovering services...");
        let discovered = match self.adapter.discover_services(address).await {
            Ok(discovered) => discovered,
            Err(e) => {
                error!("Service discovery on {} failed: {}", address, e);
                self.best_effort_disconnect(address).await;
                return Err(BleError::DiscoveryFailed {
                    address: address.to_string(),
                    source: e,
                });
            }
        };

        for service in &discovered {
            info!("Available service: {}", service.uuid);
        }
        let table = ServiceTable::from_discovery(&discovered);
        if table.is_empty() {
            warn!("Device {} exposes none of the known services", address);
        } else {
            info!("Service table of {}: {}", address, table.summary());
        }
        Ok(table)
    }

    pub async fn disconnect(&self, address: &str) -> BleResult<()> {
        info!("Disconnecting from device {}", address);
        self.adapter.disconnect(address).await.map_err(|e| {
            error!("Disconnect from {} failed: {}", address, e);
            BleError::DisconnectFailed {
                address: address.to_string(),
                source: e,
            }
        })?;
        info!("Successfully disconnected from {}", address);
        Ok(())
    }

    pub(crate) async fn best_effort_disconnect(&self, address: &str) {
        if let Err(e) = self.adapter.disconnect(address).await {
            warn!("Best-effort disconnect from {} failed: {}", address, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_guard_rejects_second_attempt_until_dropped() {
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let first = InFlightGuard::acquire(&in_flight, "A").unwrap();

        assert!(matches!(
            InFlightGuard::acquire(&in_flight, "A"),
            Err(BleError::ConnectInProgress(a)) if a == "A"
        ));
        let other = InFlightGuard::acquire(&in_flight, "B").unwrap();

        drop(first);
        assert!(InFlightGuard::acquire(&in_flight, "A").is_ok());
        drop(other);
    }
}
