//! Defines shared data structures for the Bluetooth module.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::codec::DecodeError;
use crate::core::bluetooth::constants::{
    UUID_DEVICE_INFORMATION_SERVICE, UUID_LED_CONTROL_SERVICE, UUID_MONITOR_SERVICE,
    UUID_RFID_SERVICE,
};

/// The services the SunFibre firmware exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceId {
    LedControl,
    Monitor,
    Rfid,
    DeviceInformation,
}

impl ServiceId {
    pub const ALL: [ServiceId; 4] = [
        ServiceId::LedControl,
        ServiceId::Monitor,
        ServiceId::Rfid,
        ServiceId::DeviceInformation,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::LedControl => UUID_LED_CONTROL_SERVICE,
            Self::Monitor => UUID_MONITOR_SERVICE,
            Self::Rfid => UUID_RFID_SERVICE,
            Self::DeviceInformation => UUID_DEVICE_INFORMATION_SERVICE,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.uuid() == uuid)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LedControl => "LED control",
            Self::Monitor => "monitor",
            Self::Rfid => "RFID",
            Self::DeviceInformation => "device information",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "led" | "ledcontrol" => Ok(Self::LedControl),
            "monitor" => Ok(Self::Monitor),
            "rfid" => Ok(Self::Rfid),
            "info" | "deviceinformation" => Ok(Self::DeviceInformation),
            other => Err(format!("unknown service: {}", other)),
        }
    }
}

/// A service as reported by GATT discovery, characteristics in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Reference to one characteristic of a connected peripheral.
/// Only obtainable through a [`ServiceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CharacteristicHandle {
    service: ServiceId,
    index: usize,
    uuid: Uuid,
}

impl CharacteristicHandle {
    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// Known services of a connection mapped to their ordered characteristics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceTable {
    services: BTreeMap<ServiceId, Vec<CharacteristicHandle>>,
}

impl ServiceTable {
    /// Builds the table from discovery results, dropping unknown services.
    pub fn from_discovery(discovered: &[DiscoveredService]) -> Self {
        let mut services = BTreeMap::new();
        for service in discovered {
            let Some(id) = ServiceId::from_uuid(service.uuid) else {
                continue;
            };
            let handles = service
                .characteristics
                .iter()
                .enumerate()
                .map(|(index, uuid)| CharacteristicHandle {
                    service: id,
                    index,
                    uuid: *uuid,
                })
                .collect();
            services.insert(id, handles);
        }
        Self { services }
    }

    pub fn get(&self, service: ServiceId, index: usize) -> Option<CharacteristicHandle> {
        self.services.get(&service)?.get(index).copied()
    }

    pub fn characteristics(&self, service: ServiceId) -> &[CharacteristicHandle] {
        self.services.get(&service).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, service: ServiceId) -> bool {
        self.services.contains_key(&service)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// One-line summary for discovery logs.
    pub fn summary(&self) -> String {
        self.services
            .iter()
            .map(|(id, chars)| format!("{}: {} characteristics", id, chars.len()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// One advertisement as forwarded to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedPeripheral {
    pub address: String,
    pub name: String,
    pub rssi: i16,
    pub seen_at: DateTime<Utc>,
}

/// A discovered or connected device as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peripheral {
    address: String,
    advertised_name: String,
    signal_strength: i16,
    last_seen_at: DateTime<Utc>,
    connection_state: ConnectionState,
    service_table: Option<ServiceTable>,
}

impl Peripheral {
    pub(crate) fn discovered(scanned: &ScannedPeripheral) -> Self {
        Self {
            address: scanned.address.clone(),
            advertised_name: scanned.name.clone(),
            signal_strength: scanned.rssi,
            last_seen_at: scanned.seen_at,
            connection_state: ConnectionState::Discovered,
            service_table: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn advertised_name(&self) -> &str {
        &self.advertised_name
    }

    pub fn signal_strength(&self) -> i16 {
        self.signal_strength
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen_at
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn service_table(&self) -> Option<&ServiceTable> {
        self.service_table.as_ref()
    }

    pub(crate) fn touch(&mut self, seen_at: DateTime<Utc>) {
        self.last_seen_at = seen_at;
    }

    pub(crate) fn set_connected(&mut self, table: ServiceTable) {
        self.connection_state = ConnectionState::Connected;
        self.service_table = Some(table);
    }

    pub(crate) fn set_disconnected(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
        self.service_table = None;
    }
}

/// Light mode of the dim LED characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimLedMode {
    Off = 0x00,
    OnStrong = 0x01,
    OnMild = 0x02,
    FlashSlow = 0x03,
    FlashFast = 0x04,
}

impl DimLedMode {
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DimLedMode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::OnStrong),
            0x02 => Ok(Self::OnMild),
            0x03 => Ok(Self::FlashSlow),
            0x04 => Ok(Self::FlashFast),
            value => Err(DecodeError::UnexpectedValue {
                field: "dim LED mode",
                value,
            }),
        }
    }
}

impl std::str::FromStr for DimLedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "off" => Ok(Self::Off),
            "onstrong" | "strong" => Ok(Self::OnStrong),
            "onmild" | "mild" => Ok(Self::OnMild),
            "flashslow" => Ok(Self::FlashSlow),
            "flashfast" => Ok(Self::FlashFast),
            other => Err(format!("unknown LED mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryLevel {
    Drained,
    VeryLow,
    Low,
    Medium,
    High,
    Unknown,
}

impl TryFrom<u8> for BatteryLevel {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Drained),
            0x01 => Ok(Self::VeryLow),
            0x02 => Ok(Self::Low),
            0x03 => Ok(Self::Medium),
            0x04 => Ok(Self::High),
            0xFF => Ok(Self::Unknown),
            value => Err(DecodeError::UnexpectedValue {
                field: "battery level",
                value,
            }),
        }
    }
}

/// Battery level with the voltage in millivolts, when the firmware reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub level: BatteryLevel,
    pub voltage_mv: Option<i16>,
}
