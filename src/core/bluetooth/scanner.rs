//! Continuous advertisement scanning
//! Forwards matching, de-duplicated advertisements to the device registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{Advertisement, BleAdapter};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::types::ScannedPeripheral;

/// Receives scan failures. Without one, failures are logged.
pub type ScanErrorHandler = Box<dyn Fn(BleError) + Send + Sync + 'static>;

/// Drops repeats of an advertisement seen within the refresh window.
struct AdvertisementFilter {
    name_prefixes: Vec<String>,
    refresh_window: Duration,
    last_forwarded: HashMap<String, Instant>,
}

impl AdvertisementFilter {
    fn new(name_prefixes: Vec<String>, refresh_window: Duration) -> Self {
        Self {
            name_prefixes,
            refresh_window,
            last_forwarded: HashMap::new(),
        }
    }

    fn matches_name(&self, name: Option<&str>) -> bool {
        match name {
            Some(name) if !name.is_empty() => self.name_prefixes.iter().any(|p| name.starts_with(p.as_str())),
            _ => false,
        }
    }

    fn accept(&mut self, advertisement: &Advertisement, now: Instant) -> Option<ScannedPeripheral> {
        if !self.matches_name(advertisement.name.as_deref()) {
            return None;
        }
        if let Some(last) = self.last_forwarded.get(&advertisement.address) {
            if now.duration_since(*last) < self.refresh_window {
                return None;
            }
        }
        self.last_forwarded.insert(advertisement.address.clone(), now);
        Some(ScannedPeripheral {
            address: advertisement.address.clone(),
            name: advertisement.name.clone().unwrap_or_default(),
            rssi: advertisement.rssi.unwrap_or(0),
            seen_at: Utc::now(),
        })
    }
}

pub struct BluetoothScanner {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    name_prefixes: Vec<String>,
    refresh_window: Duration,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        name_prefixes: Vec<String>,
        refresh_window: Duration,
    ) -> Self {
        Self {
            adapter,
            registry,
            name_prefixes,
            refresh_window,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn start_scan(&mut self, service_filter: &[Uuid], on_error: Option<ScanErrorHandler>) {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }

        self.cancel_token = CancellationToken::new();
        let cancel_token_for_task = self.cancel_token.clone();
        let adapter_for_task = self.adapter.clone();
        let registry_for_task = self.registry.clone();
        let filter = AdvertisementFilter::new(self.name_prefixes.clone(), self.refresh_window);
        let service_filter = service_filter.to_vec();

        let handle = tokio::spawn(async move {
            Self::internal_scan_task(
                adapter_for_task,
                registry_for_task,
                service_filter,
                filter,
                cancel_token_for_task,
                on_error,
            )
            .await;
        });

        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
    }

    async fn internal_scan_task(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        service_filter: Vec<Uuid>,
        mut filter: AdvertisementFilter,
        cancel_token: CancellationToken,
        on_error: Option<ScanErrorHandler>,
    ) {
        let report = |e: BleError| match &on_error {
            Some(handler) => handler(e),
            None => error!("Scan error: {}", e),
        };

        // devices the OS already holds a connection to never advertise
        info!("Checking for connected devices");
        match adapter.connected_devices().await {
            Ok(known) => {
                for device in known {
                    if !filter.matches_name(device.name.as_deref()) {
                        continue;
                    }
                    info!("Found already connected device {}", device.address);
                    let advertisement = Advertisement {
                        address: device.address,
                        name: device.name,
                        rssi: None,
                        services: Vec::new(),
                    };
                    if let Some(scanned) = filter.accept(&advertisement, Instant::now()) {
                        Self::forward(&registry, scanned);
                    }
                }
            }
            Err(e) => warn!("Failed to list connected devices: {}", e),
        }

        let scan = tokio::select! {
            result = adapter.scan(&service_filter) => result,
            _ = cancel_token.cancelled() => return,
        };
        let mut scan_stream = match scan {
            Ok(stream) => stream,
            Err(e) => {
                report(BleError::ScanFailed(e));
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => match result {
                    Some(Ok(advertisement)) => {
                        debug!("Found device - {:?}", advertisement);
                        if let Some(scanned) = filter.accept(&advertisement, Instant::now()) {
                            Self::forward(&registry, scanned);
                        }
                    }
                    Some(Err(e)) => {
                        // the platform stops scanning after an error
                        report(BleError::ScanFailed(e));
                        break;
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                },
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    fn forward(registry: &DeviceRegistry, scanned: ScannedPeripheral) {
        if let Err(e) = registry.on_scanned(scanned) {
            error!("Failed to register scanned device: {}", e);
        }
    }

    /// Safe to call with no scan running.
    pub async fn stop_scan(&mut self) {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            match handle.await {
                Ok(()) => info!("Scan task finished after cancellation."),
                Err(e) if e.is_cancelled() => info!("Scan task was cancelled successfully."),
                Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
            }
        } else {
            debug!("No active scan task handle found to wait for.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(address: &str, name: Option<&str>) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-55),
            services: Vec::new(),
        }
    }

    fn filter() -> AdvertisementFilter {
        AdvertisementFilter::new(
            vec!["SunFibre".to_string(), "BlueIoToy".to_string()],
            Duration::from_millis(1000),
        )
    }

    #[test]
    fn only_named_sunfibre_devices_pass() {
        let mut filter = filter();
        let now = Instant::now();
        assert!(filter.accept(&advertisement("A", Some("SunFibre-1")), now).is_some());
        assert!(filter.accept(&advertisement("B", Some("BlueIoToy 2")), now).is_some());
        assert!(filter.accept(&advertisement("C", Some("Headphones")), now).is_none());
        assert!(filter.accept(&advertisement("D", None), now).is_none());
        assert!(filter.accept(&advertisement("E", Some("")), now).is_none());
    }

    #[test]
    fn repeats_inside_the_window_are_dropped() {
        let mut filter = filter();
        let start = Instant::now();
        let ad = advertisement("A", Some("SunFibre-1"));

        assert!(filter.accept(&ad, start).is_some());
        assert!(filter.accept(&ad, start + Duration::from_millis(200)).is_none());
        assert!(filter.accept(&ad, start + Duration::from_millis(1200)).is_some());
        // other addresses are independent
        assert!(filter.accept(&advertisement("B", Some("SunFibre-2")), start).is_some());
    }

    #[test]
    fn accepted_advertisement_carries_signal_strength() {
        let scanned = filter()
            .accept(&advertisement("A", Some("SunFibre-1")), Instant::now())
            .unwrap();
        assert_eq!(scanned.address, "A");
        assert_eq!(scanned.name, "SunFibre-1");
        assert_eq!(scanned.rssi, -55);
    }
}
