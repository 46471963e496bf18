//! BLE session manager for SunFibre peripherals
//! This module provides the main interface for bluetooth operations: adapter
//! readiness, scanning, connection lifecycle and per-device handles.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::bluetooth::adapter::{BleAdapter, PowerState};
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::error::{BleError, BleResult};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::peripheral::PeripheralHandle;
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::scanner::{BluetoothScanner, ScanErrorHandler};
use crate::core::bluetooth::subscription::{Subscription, SubscriptionManager};
use crate::core::bluetooth::telemetry::{PollIntervals, TelemetryUpdate, start_telemetry_polling};
use crate::core::bluetooth::types::{Peripheral, ServiceTable};

/// Owns the adapter and is the only caller of transport-level operations
pub struct BleSessionManager {
    adapter: Arc<dyn BleAdapter>,
    /// Known peripherals
    registry: Arc<DeviceRegistry>,
    /// Listeners per peripheral
    subscriptions: Arc<SubscriptionManager>,
    /// Bluetooth scanner
    scanner: Mutex<BluetoothScanner>,
    /// Connection manager
    connection_manager: ConnectionManager,
    /// Notification handler
    notification_handler: NotificationHandler,
    ready_tx: watch::Sender<bool>,
    power_watch: StdMutex<Option<CancellationToken>>,
    config: SessionConfig,
}

impl BleSessionManager {
    pub fn new(adapter: Arc<dyn BleAdapter>, registry: Arc<DeviceRegistry>, config: SessionConfig) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new());
        let scanner = BluetoothScanner::new(
            adapter.clone(),
            registry.clone(),
            config.device_name_prefixes.clone(),
            config.advertisement_refresh(),
        );
        let connection_manager = ConnectionManager::new(adapter.clone(), config.connect_timeout_ms);
        let notification_handler =
            NotificationHandler::new(adapter.clone(), registry.clone(), subscriptions.clone());
        let (ready_tx, _) = watch::channel(false);

        Self {
            adapter,
            registry,
            subscriptions,
            scanner: Mutex::new(scanner),
            connection_manager,
            notification_handler,
            ready_tx,
            power_watch: StdMutex::new(None),
            config,
        }
    }

    /// Reads the current power state and keeps following it in the
    /// background. Returns whether the adapter is powered on right now.
    pub async fn start(&self) -> bool {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .power_watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        match self.adapter.power_state().await {
            Ok(state) => self.set_power_state(state),
            Err(e) => {
                warn!("Failed to read Bluetooth adapter state: {}", e);
                self.ready_tx.send_replace(false);
            }
        }

        match self.adapter.power_events().await {
            Ok(mut events) => {
                let ready_tx = self.ready_tx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            event = events.next() => match event {
                                Some(state) => {
                                    info!("Bluetooth adapter state changed: {:?}", state);
                                    ready_tx.send_replace(state == PowerState::PoweredOn);
                                }
                                None => break,
                            },
                        }
                    }
                });
            }
            Err(e) => warn!("Failed to follow Bluetooth adapter state: {}", e),
        }

        self.is_ready()
    }

    fn set_power_state(&self, state: PowerState) {
        let ready = state == PowerState::PoweredOn;
        if ready {
            info!("Bluetooth adapter is available.");
        } else {
            warn!("Bluetooth adapter is {:?}", state);
        }
        self.ready_tx.send_replace(ready);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Waits at most `timeout` for the adapter to be powered on.
    pub async fn wait_until_ready(&self, timeout: Duration) -> BleResult<()> {
        let mut ready_rx = self.ready_tx.subscribe();
        let powered_on = tokio::time::timeout(timeout, ready_rx.wait_for(|ready| *ready))
            .await
            .is_ok_and(|waited| waited.is_ok());
        if powered_on {
            Ok(())
        } else {
            Err(BleError::AdapterNotReady)
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn devices(&self) -> Vec<Peripheral> {
        self.registry.snapshot()
    }

    /// Scans continuously for the given services. A running scan is replaced.
    pub async fn start_scan(&self, service_filter: &[Uuid], on_error: Option<ScanErrorHandler>) -> BleResult<()> {
        if !self.is_ready() {
            error!("Scan requested before the Bluetooth adapter is ready");
            return Err(BleError::AdapterNotReady);
        }
        self.scanner.lock().await.start_scan(service_filter, on_error).await;
        Ok(())
    }

    pub async fn stop_scan(&self) {
        self.scanner.lock().await.stop_scan().await;
    }

    pub async fn is_scanning(&self) -> bool {
        self.scanner.lock().await.is_scanning()
    }

    /// Connects to a known peripheral and returns its service table. An
    /// already connected peripheral returns its cached table.
    pub async fn connect(&self, address: &str) -> BleResult<ServiceTable> {
        let device = self
            .registry
            .get(address)
            .ok_or_else(|| BleError::UnknownDevice(address.to_string()))?;
        if let Some(table) = device.service_table() {
            info!("Device already connected.");
            return Ok(table.clone());
        }

        let table = self.connection_manager.connect(address).await?;

        if let Err(e) = self.registry.on_connected(address, table.clone()) {
            // entry was cleared while connecting
            error!("Failed to register connection of {}: {}", address, e);
            self.connection_manager.best_effort_disconnect(address).await;
            return Err(e);
        }

        let registry = self.registry.clone();
        let subscriptions = self.subscriptions.clone();
        self.notification_handler.watch_disconnection(address, move |address| {
            if let Err(e) = registry.on_disconnected(address) {
                error!("Failed to register disconnection of {}: {}", address, e);
            }
            subscriptions.cancel_all(address);
        });

        info!("Device {} successfully connected and registered.", address);
        Ok(table)
    }

    /// Drops the connection, then cancels every subscription of the peripheral.
    /// On failure the link is still up and its monitors and watcher stay armed.
    pub async fn disconnect(&self, address: &str) -> BleResult<()> {
        self.connection_manager.disconnect(address).await?;
        self.subscriptions.cancel_all(address);
        self.registry.on_disconnected(address)
    }

    /// Forgets every peripheral that is not connected.
    pub fn clear(&self) -> BleResult<()> {
        self.registry.on_clear()
    }

    pub fn peripheral(&self, address: &str) -> Option<PeripheralHandle> {
        self.registry.get(address).map(|identity| {
            PeripheralHandle::new(
                identity,
                self.adapter.clone(),
                self.registry.clone(),
                self.connection_manager.clone(),
                self.notification_handler.clone(),
            )
        })
    }

    /// Polls telemetry of a known peripheral on the configured intervals.
    pub fn start_telemetry(
        &self,
        address: &str,
        on_update: impl Fn(TelemetryUpdate) + Send + Sync + 'static,
    ) -> BleResult<Subscription> {
        let handle = self
            .peripheral(address)
            .ok_or_else(|| BleError::UnknownDevice(address.to_string()))?;
        Ok(start_telemetry_polling(handle, PollIntervals::from(&self.config), on_update))
    }

    /// Stops scanning, every listener and the adapter state watch.
    pub async fn shutdown(&self) {
        self.stop_scan().await;
        self.subscriptions.cancel_everything();
        if let Some(token) = self.power_watch.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        info!("BLE session shut down.");
    }
}
