//! `bluest` implementation of the platform adapter
//! Device and characteristic handles are cached by address as they are
//! discovered, so callers only ever deal in addresses and UUIDs.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{
    AdapterError, AdapterResult, Advertisement, BleAdapter, KnownDevice, PowerState,
    receiver_stream,
};
use crate::core::bluetooth::codec::Payload;
use crate::core::bluetooth::types::DiscoveredService;

static MAC_ADDRESS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").ok());

const AVAILABILITY_PROBE: Duration = Duration::from_millis(250);

type CharacteristicKey = (String, Uuid, Uuid);

#[derive(Clone)]
pub struct BluestAdapter {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    characteristics: Arc<Mutex<HashMap<CharacteristicKey, Characteristic>>>,
}

impl BluestAdapter {
    /// Opens the default system adapter. Does not wait for it to power on.
    pub async fn new() -> AdapterResult<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| AdapterError::Platform("No Bluetooth adapter found".to_string()))?;
        info!("Bluetooth adapter opened.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Uppercase MAC when the platform id embeds one, the id itself otherwise.
    pub fn address_of(device: &Device) -> String {
        normalize_address(&device.id().to_string())
    }

    fn remember(devices: &Mutex<HashMap<String, Device>>, device: &Device) -> String {
        let address = Self::address_of(device);
        devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), device.clone());
        address
    }

    fn device(&self, address: &str) -> AdapterResult<Device> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownPeripheral(address.to_string()))
    }

    fn characteristic(&self, address: &str, service: Uuid, characteristic: Uuid) -> AdapterResult<Characteristic> {
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(address.to_string(), service, characteristic))
            .cloned()
            .ok_or(AdapterError::CharacteristicUnavailable(characteristic))
    }

    fn forget_characteristics(&self, address: &str) {
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(a, _, _), _| a != address);
    }
}

pub fn normalize_address(device_id: &str) -> String {
    MAC_ADDRESS_RE
        .as_ref()
        .and_then(|re| re.find_iter(device_id).last())
        .map(|m| m.as_str().replace(['-', '_'], ":").to_uppercase())
        .unwrap_or_else(|| device_id.to_string())
}

/// Powered on if `wait_available` resolves within `bound`, powered off if it is still waiting.
async fn probe_power<E>(
    wait_available: impl Future<Output = Result<(), E>>,
    bound: Duration,
) -> Result<PowerState, E> {
    match tokio::time::timeout(bound, wait_available).await {
        Ok(Ok(())) => Ok(PowerState::PoweredOn),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(PowerState::PoweredOff),
    }
}

fn map_error(e: bluest::Error, address: &str) -> AdapterError {
    use bluest::error::ErrorKind;
    match e.kind() {
        ErrorKind::NotConnected => AdapterError::DeviceDisconnected(address.to_string()),
        ErrorKind::Timeout => AdapterError::Timeout,
        ErrorKind::AdapterUnavailable | ErrorKind::NotReady => AdapterError::NotPoweredOn,
        _ => AdapterError::Platform(e.to_string()),
    }
}

#[async_trait::async_trait]
impl BleAdapter for BluestAdapter {
    async fn power_state(&self) -> AdapterResult<PowerState> {
        probe_power(self.adapter.wait_available(), AVAILABILITY_PROBE)
            .await
            .map_err(|e| map_error(e, ""))
    }

    async fn power_events(&self) -> AdapterResult<BoxStream<'static, PowerState>> {
        let (tx, rx) = mpsc::channel(8);
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to listen for adapter events: {}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    event = events.next() => {
                        let state = match event {
                            Some(Ok(AdapterEvent::Available)) => PowerState::PoweredOn,
                            Some(Ok(AdapterEvent::Unavailable)) => PowerState::PoweredOff,
                            Some(Err(e)) => {
                                warn!("Error in adapter event stream: {}", e);
                                continue;
                            }
                            None => break,
                        };
                        if tx.send(state).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!("Adapter event stream ended");
        });

        Ok(receiver_stream(rx))
    }

    async fn connected_devices(&self) -> AdapterResult<Vec<KnownDevice>> {
        let devices = self
            .adapter
            .connected_devices()
            .await
            .map_err(|e| map_error(e, ""))?;
        Ok(devices
            .iter()
            .map(|device| KnownDevice {
                address: Self::remember(&self.devices, device),
                name: device.name().ok(),
            })
            .collect())
    }

    async fn scan(&self, services: &[Uuid]) -> AdapterResult<BoxStream<'static, AdapterResult<Advertisement>>> {
        let (tx, rx) = mpsc::channel(64);
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let services = services.to_vec();

        tokio::spawn(async move {
            info!("Starting bluetooth scan");
            let mut scan_stream = match adapter.scan(&services).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(map_error(e, ""))).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    result = scan_stream.next() => {
                        let Some(discovered) = result else {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        };
                        let address = Self::remember(&devices, &discovered.device);
                        let advertisement = Advertisement {
                            name: discovered
                                .adv_data
                                .local_name
                                .clone()
                                .or_else(|| discovered.device.name().ok()),
                            address,
                            rssi: discovered.rssi,
                            services: discovered.adv_data.services.clone(),
                        };
                        if tx.send(Ok(advertisement)).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!("Scan task finished");
        });

        Ok(receiver_stream(rx))
    }

    async fn connect(&self, address: &str) -> AdapterResult<()> {
        let device = self.device(address)?;
        if device.is_connected().await {
            info!("Device {} already connected.", address);
            return Ok(());
        }
        info!("Initiating connection to {}...", address);
        self.adapter
            .connect_device(&device)
            .await
            .map_err(|e| map_error(e, address))
    }

    async fn disconnect(&self, address: &str) -> AdapterResult<()> {
        let device = self.device(address)?;
        if device.is_connected().await {
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(|e| map_error(e, address))?;
        } else {
            info!("Device {} not connected", address);
        }
        self.forget_characteristics(address);
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> AdapterResult<Vec<DiscoveredService>> {
        let device = self.device(address)?;
        let services = device
            .discover_services()
            .await
            .map_err(|e| map_error(e, address))?;

        let mut discovered = Vec::with_capacity(services.len());
        for service in services {
            let characteristics = service
                .discover_characteristics()
                .await
                .map_err(|e| map_error(e, address))?;
            debug!(
                "Service {} has {} characteristics",
                service.uuid(),
                characteristics.len()
            );

            let mut cache = self.characteristics.lock().unwrap_or_else(|e| e.into_inner());
            let uuids = characteristics
                .into_iter()
                .map(|ch| {
                    let uuid = ch.uuid();
                    cache.insert((address.to_string(), service.uuid(), uuid), ch);
                    uuid
                })
                .collect();
            discovered.push(DiscoveredService {
                uuid: service.uuid(),
                characteristics: uuids,
            });
        }
        Ok(discovered)
    }

    async fn read(&self, address: &str, service: Uuid, characteristic: Uuid) -> AdapterResult<Payload> {
        self.characteristic(address, service, characteristic)?
            .read()
            .await
            .map_err(|e| map_error(e, address))
    }

    async fn write(&self, address: &str, service: Uuid, characteristic: Uuid, value: &[u8]) -> AdapterResult<()> {
        self.characteristic(address, service, characteristic)?
            .write(value)
            .await
            .map_err(|e| map_error(e, address))
    }

    async fn subscribe(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<Payload>>> {
        let ch = self.characteristic(address, service, characteristic)?;
        let address = address.to_string();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut notifications = match ch.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(map_error(e, &address))).await;
                    return;
                }
            };
            loop {
                tokio::select! {
                    result = notifications.next() => {
                        let Some(result) = result else { break };
                        if tx.send(result.map_err(|e| map_error(e, &address))).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!("Notification stream for {} ended", ch.uuid());
        });

        Ok(receiver_stream(rx))
    }

    async fn subscribe_disconnect(&self, address: &str) -> AdapterResult<BoxStream<'static, AdapterResult<()>>> {
        let device = self.device(address)?;
        let adapter = self.adapter.clone();
        let address = address.to_string();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    let _ = tx.send(Err(map_error(e, &address))).await;
                    return;
                }
            };
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            if tx.send(Ok(())).await.is_err() {
                                break;
                            }
                        }
                        Some(ConnectionEvent::Connected) => {}
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(receiver_stream(rx))
    }
}
