//! In-memory BLE adapter for driving the session layer without hardware.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use sunfibre_ble_lib::config::SessionConfig;
use sunfibre_ble_lib::core::bluetooth::adapter::receiver_stream;
use sunfibre_ble_lib::core::bluetooth::codec::Payload;
use sunfibre_ble_lib::core::bluetooth::{
    AdapterError, AdapterResult, Advertisement, BleAdapter, BleSessionManager, DiscoveredService,
    KnownDevice, PowerState, ServiceId,
};
use sunfibre_ble_lib::state::AppState;

pub const ADDRESS: &str = "AA:BB:CC:00:11:22";
pub const NAME: &str = "SunFibre-1";

const CHANNEL_CAPACITY: usize = 64;

/// Characteristic UUID the fake uses for `index` of `service`.
pub fn char_uuid(service: ServiceId, index: usize) -> Uuid {
    let base: u128 = match service {
        ServiceId::LedControl => 0x1000,
        ServiceId::Monitor => 0x2000,
        ServiceId::Rfid => 0x3000,
        ServiceId::DeviceInformation => 0x4000,
    };
    Uuid::from_u128(base + index as u128)
}

fn service(id: ServiceId, count: usize) -> DiscoveredService {
    DiscoveredService {
        uuid: id.uuid(),
        characteristics: (0..count).map(|i| char_uuid(id, i)).collect(),
    }
}

struct FakePeripheral {
    services: Vec<DiscoveredService>,
    values: HashMap<Uuid, Payload>,
}

#[derive(Default)]
struct FakeState {
    powered: Option<PowerState>,
    power_subscribers: Vec<mpsc::Sender<PowerState>>,
    advertisements: Vec<Advertisement>,
    scan_tx: Option<mpsc::Sender<AdapterResult<Advertisement>>>,
    scan_error: Option<AdapterError>,
    already_connected: Vec<KnownDevice>,
    peripherals: HashMap<String, FakePeripheral>,
    connected: HashSet<String>,
    connect_delay: Duration,
    connect_error: Option<AdapterError>,
    discovery_error: Option<AdapterError>,
    read_error: Option<AdapterError>,
    disconnect_error: Option<AdapterError>,
    disconnect_calls: Vec<String>,
    writes: Vec<(String, Uuid, Payload)>,
    notify_subscribers: HashMap<(String, Uuid), Vec<mpsc::Sender<AdapterResult<Payload>>>>,
    disconnect_subscribers: HashMap<String, Vec<mpsc::Sender<AdapterResult<()>>>>,
}

#[derive(Default)]
pub struct FakeAdapter {
    state: Mutex<FakeState>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        let adapter = Self::default();
        adapter.lock().powered = Some(PowerState::PoweredOn);
        Arc::new(adapter)
    }

    pub fn powered_off() -> Arc<Self> {
        let adapter = Self::default();
        adapter.lock().powered = Some(PowerState::PoweredOff);
        Arc::new(adapter)
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Adds a peripheral exposing every SunFibre service with sample values.
    pub fn add_sunfibre(&self, address: &str) {
        let values = HashMap::from([
            (char_uuid(ServiceId::LedControl, 0), vec![0x02]),
            (char_uuid(ServiceId::LedControl, 1), vec![0x00]),
            (char_uuid(ServiceId::LedControl, 2), vec![0xE4, 0x0C]),
            (char_uuid(ServiceId::LedControl, 3), vec![0x96, 0x00]),
            (char_uuid(ServiceId::Monitor, 0), vec![0x03, 0x10, 0x0E]),
            (char_uuid(ServiceId::Monitor, 1), vec![0x01]),
            (char_uuid(ServiceId::Monitor, 2), vec![0xE8, 0x03, 0x00, 0x00]),
            (char_uuid(ServiceId::Rfid, 0), vec![0x2A, 0x00, 0x00, 0x00]),
            (char_uuid(ServiceId::Rfid, 1), vec![0xFF, 0xFF, 0xFF, 0xFF]),
            (char_uuid(ServiceId::Rfid, 2), vec![0x00]),
            (char_uuid(ServiceId::DeviceInformation, 1), b"fw 1.4.2 / hw C\0".to_vec()),
        ]);
        self.add_peripheral(
            address,
            vec![
                service(ServiceId::LedControl, 4),
                service(ServiceId::Monitor, 3),
                service(ServiceId::Rfid, 3),
                service(ServiceId::DeviceInformation, 2),
            ],
            values,
        );
    }

    /// Adds an older firmware variant with only the LED control service.
    pub fn add_led_only(&self, address: &str) {
        let values = HashMap::from([(char_uuid(ServiceId::LedControl, 0), vec![0x01])]);
        self.add_peripheral(address, vec![service(ServiceId::LedControl, 4)], values);
    }

    pub fn add_peripheral(&self, address: &str, services: Vec<DiscoveredService>, values: HashMap<Uuid, Payload>) {
        self.lock()
            .peripherals
            .insert(address.to_string(), FakePeripheral { services, values });
    }

    /// Queues an advertisement, delivering it right away if a scan is running.
    pub fn advertise(&self, address: &str, name: Option<&str>, rssi: i16) {
        let advertisement = Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(rssi),
            services: vec![ServiceId::LedControl.uuid()],
        };
        let mut state = self.lock();
        if let Some(tx) = &state.scan_tx {
            let _ = tx.try_send(Ok(advertisement.clone()));
        }
        state.advertisements.push(advertisement);
    }

    pub fn fail_scan_stream(&self, error: AdapterError) {
        if let Some(tx) = &self.lock().scan_tx {
            let _ = tx.try_send(Err(error));
        }
    }

    pub fn set_scan_error(&self, error: AdapterError) {
        self.lock().scan_error = Some(error);
    }

    pub fn set_already_connected(&self, address: &str, name: &str) {
        self.lock().already_connected.push(KnownDevice {
            address: address.to_string(),
            name: Some(name.to_string()),
        });
    }

    pub fn set_power(&self, power: PowerState) {
        let mut state = self.lock();
        state.powered = Some(power);
        state.power_subscribers.retain(|tx| tx.try_send(power).is_ok());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_connect_error(&self, error: AdapterError) {
        self.lock().connect_error = Some(error);
    }

    pub fn set_discovery_error(&self, error: AdapterError) {
        self.lock().discovery_error = Some(error);
    }

    pub fn set_disconnect_error(&self, error: Option<AdapterError>) {
        self.lock().disconnect_error = error;
    }

    pub fn set_read_error(&self, error: AdapterError) {
        self.lock().read_error = Some(error);
    }

    pub fn set_value(&self, address: &str, characteristic: Uuid, value: Payload) {
        if let Some(peripheral) = self.lock().peripherals.get_mut(address) {
            peripheral.values.insert(characteristic, value);
        }
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.lock().connected.contains(address)
    }

    pub fn disconnect_calls(&self) -> Vec<String> {
        self.lock().disconnect_calls.clone()
    }

    pub fn writes(&self) -> Vec<(String, Uuid, Payload)> {
        self.lock().writes.clone()
    }

    /// Pushes a value change to every monitor of the characteristic.
    pub fn notify(&self, address: &str, characteristic: Uuid, value: Payload) {
        self.push(address, characteristic, Ok(value));
    }

    pub fn notify_error(&self, address: &str, characteristic: Uuid, error: AdapterError) {
        self.push(address, characteristic, Err(error));
    }

    fn push(&self, address: &str, characteristic: Uuid, item: AdapterResult<Payload>) {
        let mut state = self.lock();
        if let Some(subscribers) = state
            .notify_subscribers
            .get_mut(&(address.to_string(), characteristic))
        {
            subscribers.retain(|tx| tx.try_send(item.clone()).is_ok());
        }
    }

    /// Simulates the peripheral dropping the link.
    pub fn drop_connection(&self, address: &str) {
        let mut state = self.lock();
        state.connected.remove(address);
        if let Some(subscribers) = state.disconnect_subscribers.get_mut(address) {
            subscribers.retain(|tx| tx.try_send(Ok(())).is_ok());
        }
    }

    fn live_subscribers(&self, address: &str, characteristic: Uuid) -> usize {
        self.lock()
            .notify_subscribers
            .get(&(address.to_string(), characteristic))
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn live_disconnect_subscribers(&self, address: &str) -> usize {
        self.lock()
            .disconnect_subscribers
            .get(address)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub async fn wait_for_subscriber(&self, address: &str, characteristic: Uuid) {
        eventually(|| self.live_subscribers(address, characteristic) > 0).await;
    }

    pub async fn wait_for_no_subscriber(&self, address: &str, characteristic: Uuid) {
        eventually(|| self.live_subscribers(address, characteristic) == 0).await;
    }

    pub async fn wait_for_disconnect_subscribers(&self, address: &str, count: usize) {
        eventually(|| self.live_disconnect_subscribers(address) >= count).await;
    }

    fn require_connected(state: &FakeState, address: &str) -> AdapterResult<()> {
        if state.connected.contains(address) {
            Ok(())
        } else {
            Err(AdapterError::DeviceDisconnected(address.to_string()))
        }
    }
}

/// Polls `condition` until it holds, failing the test after one second.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 1 s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn power_state(&self) -> AdapterResult<PowerState> {
        Ok(self.lock().powered.unwrap_or(PowerState::PoweredOff))
    }

    async fn power_events(&self) -> AdapterResult<BoxStream<'static, PowerState>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.lock().power_subscribers.push(tx);
        Ok(receiver_stream(rx))
    }

    async fn connected_devices(&self) -> AdapterResult<Vec<KnownDevice>> {
        Ok(self.lock().already_connected.clone())
    }

    async fn scan(&self, _services: &[Uuid]) -> AdapterResult<BoxStream<'static, AdapterResult<Advertisement>>> {
        let mut state = self.lock();
        if let Some(error) = state.scan_error.clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        for advertisement in &state.advertisements {
            let _ = tx.try_send(Ok(advertisement.clone()));
        }
        state.scan_tx = Some(tx);
        Ok(receiver_stream(rx))
    }

    async fn connect(&self, address: &str) -> AdapterResult<()> {
        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(error) = state.connect_error.clone() {
            return Err(error);
        }
        if !state.peripherals.contains_key(address) {
            return Err(AdapterError::UnknownPeripheral(address.to_string()));
        }
        state.connected.insert(address.to_string());
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> AdapterResult<()> {
        let mut state = self.lock();
        state.disconnect_calls.push(address.to_string());
        if let Some(error) = state.disconnect_error.clone() {
            return Err(error);
        }
        state.connected.remove(address);
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> AdapterResult<Vec<DiscoveredService>> {
        let state = self.lock();
        if let Some(error) = state.discovery_error.clone() {
            return Err(error);
        }
        Self::require_connected(&state, address)?;
        Ok(state
            .peripherals
            .get(address)
            .map(|p| p.services.clone())
            .unwrap_or_default())
    }

    async fn read(&self, address: &str, _service: Uuid, characteristic: Uuid) -> AdapterResult<Payload> {
        let state = self.lock();
        if let Some(error) = state.read_error.clone() {
            return Err(error);
        }
        Self::require_connected(&state, address)?;
        state
            .peripherals
            .get(address)
            .and_then(|p| p.values.get(&characteristic).cloned())
            .ok_or(AdapterError::CharacteristicUnavailable(characteristic))
    }

    async fn write(&self, address: &str, _service: Uuid, characteristic: Uuid, value: &[u8]) -> AdapterResult<()> {
        let mut state = self.lock();
        Self::require_connected(&state, address)?;
        state
            .writes
            .push((address.to_string(), characteristic, value.to_vec()));
        if let Some(peripheral) = state.peripherals.get_mut(address) {
            peripheral.values.insert(characteristic, value.to_vec());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        address: &str,
        _service: Uuid,
        characteristic: Uuid,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<Payload>>> {
        let mut state = self.lock();
        Self::require_connected(&state, address)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        state
            .notify_subscribers
            .entry((address.to_string(), characteristic))
            .or_default()
            .push(tx);
        Ok(receiver_stream(rx))
    }

    async fn subscribe_disconnect(&self, address: &str) -> AdapterResult<BoxStream<'static, AdapterResult<()>>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.lock()
            .disconnect_subscribers
            .entry(address.to_string())
            .or_default()
            .push(tx);
        Ok(receiver_stream(rx))
    }
}

/// Session wired to `adapter` with test-friendly timings.
pub fn session(adapter: &Arc<FakeAdapter>, config: SessionConfig) -> Arc<BleSessionManager> {
    AppState::with_adapter(adapter.clone(), config).get_session_manager_arc()
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout_ms: 500,
        advertisement_refresh_ms: 50,
        ..SessionConfig::default()
    }
}

/// Started session with `ADDRESS` scanned into the registry.
pub async fn discovered_session(adapter: &Arc<FakeAdapter>) -> Arc<BleSessionManager> {
    let manager = session(adapter, fast_config());
    assert!(manager.start().await);
    adapter.advertise(ADDRESS, Some(NAME), -60);
    manager
        .start_scan(&[ServiceId::LedControl.uuid()], None)
        .await
        .unwrap();
    eventually(|| manager.registry().get(ADDRESS).is_some()).await;
    manager.stop_scan().await;
    manager
}

/// Started session with `ADDRESS` connected.
pub async fn connected_session(adapter: &Arc<FakeAdapter>) -> Arc<BleSessionManager> {
    let manager = discovered_session(adapter).await;
    manager.connect(ADDRESS).await.unwrap();
    manager
}
