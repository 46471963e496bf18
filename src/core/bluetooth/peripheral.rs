//! Per-device facade
//! Typed, named characteristic operations scoped to one peripheral's live
//! connection. State is always read from the registry; the handle never
//! mutates a peripheral itself.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::core::bluetooth::adapter::BleAdapter;
use crate::core::bluetooth::codec::{self, Payload, to_hex_string};
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::constants::*;
use crate::core::bluetooth::error::{BleError, BleResult};
use crate::core::bluetooth::notification::{ErrorHandler, NotificationHandler};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::subscription::Subscription;
use crate::core::bluetooth::types::{
    BatteryLevel, BatteryStatus, CharacteristicHandle, ConnectionState, DimLedMode, Peripheral,
    ServiceId,
};

#[derive(Clone)]
pub struct PeripheralHandle {
    identity: Peripheral,
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    connections: ConnectionManager,
    notifications: NotificationHandler,
}

impl PeripheralHandle {
    pub(crate) fn new(
        identity: Peripheral,
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        connections: ConnectionManager,
        notifications: NotificationHandler,
    ) -> Self {
        Self {
            identity,
            adapter,
            registry,
            connections,
            notifications,
        }
    }

    fn current(&self) -> Option<Peripheral> {
        self.registry.get(self.identity.address())
    }

    pub fn address(&self) -> &str {
        self.identity.address()
    }

    pub fn advertised_name(&self) -> String {
        self.current()
            .map(|p| p.advertised_name().to_string())
            .unwrap_or_else(|| self.identity.advertised_name().to_string())
    }

    pub fn signal_strength(&self) -> i16 {
        self.current()
            .map(|p| p.signal_strength())
            .unwrap_or_else(|| self.identity.signal_strength())
    }

    /// Registry state, `Connecting` while an attempt is in flight, and
    /// `Disconnected` once the entry has been removed.
    pub fn connection_state(&self) -> ConnectionState {
        if self.connections.is_connecting(self.address()) {
            return ConnectionState::Connecting;
        }
        self.current()
            .map(|p| p.connection_state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.registry.is_connected(self.address())
    }

    pub fn lookup_characteristic(&self, service: ServiceId, index: usize) -> BleResult<CharacteristicHandle> {
        let peripheral = self
            .current()
            .ok_or_else(|| BleError::NoServiceTable(self.address().to_string()))?;
        let table = peripheral
            .service_table()
            .ok_or_else(|| BleError::NoServiceTable(self.address().to_string()))?;
        table
            .get(service, index)
            .ok_or(BleError::CharacteristicNotFound { service, index })
    }

    pub async fn read_raw(&self, field: &'static str, service: ServiceId, index: usize) -> BleResult<Payload> {
        let characteristic = self.lookup_characteristic(service, index)?;
        debug!("Reading {} of {}", field, self.address());
        let value = self
            .adapter
            .read(self.address(), service.uuid(), characteristic.uuid())
            .await
            .map_err(|source| BleError::ReadFailed { field, source })?;
        debug!("Read {}: {}", field, to_hex_string(&value));
        Ok(value)
    }

    pub async fn write_raw(&self, field: &'static str, service: ServiceId, index: usize, value: &[u8]) -> BleResult<()> {
        let characteristic = self.lookup_characteristic(service, index)?;
        info!("Writing {} of {}: {}", field, self.address(), to_hex_string(value));
        self.adapter
            .write(self.address(), service.uuid(), characteristic.uuid(), value)
            .await
            .map_err(|source| BleError::WriteFailed { field, source })
    }

    /// Registers a change listener. The callback gets raw payloads; the
    /// typed `monitor_*` wrappers decode them.
    pub fn monitor(
        &self,
        service: ServiceId,
        index: usize,
        on_change: impl Fn(Payload) + Send + 'static,
        on_error: Option<ErrorHandler>,
    ) -> BleResult<Subscription> {
        let characteristic = self.lookup_characteristic(service, index)?;
        Ok(self
            .notifications
            .monitor_characteristic(self.address(), characteristic, on_change, on_error))
    }

    fn monitor_decoded<T: 'static>(
        &self,
        field: &'static str,
        service: ServiceId,
        index: usize,
        decode: fn(&[u8]) -> BleResult<T>,
        on_change: impl Fn(T) + Send + 'static,
        on_error: Option<ErrorHandler>,
    ) -> BleResult<Subscription> {
        self.monitor(
            service,
            index,
            move |payload| match decode(&payload) {
                Ok(value) => on_change(value),
                Err(e) => warn!("Ignoring undecodable {} change: {}", field, e),
            },
            on_error,
        )
    }

    /// Calls `handler` on every disconnection until the subscription is cancelled.
    pub fn on_disconnected(&self, handler: impl Fn(&str) + Send + 'static) -> Subscription {
        self.notifications.watch_disconnection(self.address(), handler)
    }

    pub(crate) fn track(&self, subscription: &Subscription) {
        self.notifications.track(self.address(), subscription);
    }

    // LED control service

    pub async fn read_dim_led_mode(&self) -> BleResult<DimLedMode> {
        let payload = self
            .read_raw("dim LED", ServiceId::LedControl, CHARACTERISTIC_DIM_LED_IDX)
            .await?;
        decode_dim_led_mode(&payload)
    }

    pub async fn write_dim_led_mode(&self, mode: DimLedMode) -> BleResult<()> {
        let payload = codec::encode_u8(mode.to_byte().into())?;
        self.write_raw("dim LED", ServiceId::LedControl, CHARACTERISTIC_DIM_LED_IDX, &payload)
            .await
    }

    pub fn monitor_dim_led_mode(
        &self,
        on_change: impl Fn(DimLedMode) + Send + 'static,
        on_error: Option<ErrorHandler>,
    ) -> BleResult<Subscription> {
        self.monitor_decoded(
            "dim LED",
            ServiceId::LedControl,
            CHARACTERISTIC_DIM_LED_IDX,
            decode_dim_led_mode,
            on_change,
            on_error,
        )
    }

    pub async fn read_debug_led(&self) -> BleResult<u8> {
        let payload = self
            .read_raw("debug LED", ServiceId::LedControl, CHARACTERISTIC_DEBUG_LED_IDX)
            .await?;
        Ok(codec::decode_u8(&payload)?)
    }

    pub async fn write_debug_led(&self, value: u8) -> BleResult<()> {
        let payload = codec::encode_u8(value.into())?;
        self.write_raw("debug LED", ServiceId::LedControl, CHARACTERISTIC_DEBUG_LED_IDX, &payload)
            .await
    }

    /// LED voltage in millivolts.
    pub async fn read_led_voltage(&self) -> BleResult<i16> {
        let payload = self
            .read_raw("VLED", ServiceId::LedControl, CHARACTERISTIC_VLED_IDX)
            .await?;
        Ok(codec::decode_i16_le(&payload)?)
    }

    /// LED current in milliamps.
    pub async fn read_led_current(&self) -> BleResult<i16> {
        let payload = self
            .read_raw("ISNS", ServiceId::LedControl, CHARACTERISTIC_ISNS_IDX)
            .await?;
        Ok(codec::decode_i16_le(&payload)?)
    }

    // Monitor service

    pub async fn read_battery(&self) -> BleResult<BatteryStatus> {
        let payload = self
            .read_raw("battery level", ServiceId::Monitor, CHARACTERISTIC_BATTERY_LEVEL_IDX)
            .await?;
        decode_battery_status(&payload)
    }

    pub async fn read_battery_charging(&self) -> BleResult<bool> {
        let payload = self
            .read_raw("battery charging", ServiceId::Monitor, CHARACTERISTIC_BATTERY_CHARGING_IDX)
            .await?;
        Ok(codec::decode_bool(&payload)?)
    }

    pub fn monitor_battery_charging(
        &self,
        on_change: impl Fn(bool) + Send + 'static,
        on_error: Option<ErrorHandler>,
    ) -> BleResult<Subscription> {
        self.monitor_decoded(
            "battery charging",
            ServiceId::Monitor,
            CHARACTERISTIC_BATTERY_CHARGING_IDX,
            |payload| Ok(codec::decode_bool(payload)?),
            on_change,
            on_error,
        )
    }

    pub async fn read_temperature(&self) -> BleResult<i32> {
        let payload = self
            .read_raw("temperature", ServiceId::Monitor, CHARACTERISTIC_TEMPERATURE_IDX)
            .await?;
        Ok(codec::decode_i32_le(&payload)?)
    }

    // RFID service

    /// Last tag seen by the reader, `-1` when none.
    pub async fn read_rfid_detected_tag_id(&self) -> BleResult<i64> {
        let payload = self
            .read_raw("RFID detected tag id", ServiceId::Rfid, CHARACTERISTIC_RFID_DETECTED_TAG_ID_IDX)
            .await?;
        Ok(codec::decode_tag_id(&payload)?)
    }

    pub fn monitor_rfid_detected_tag_id(
        &self,
        on_change: impl Fn(i64) + Send + 'static,
        on_error: Option<ErrorHandler>,
    ) -> BleResult<Subscription> {
        self.monitor_decoded(
            "RFID detected tag id",
            ServiceId::Rfid,
            CHARACTERISTIC_RFID_DETECTED_TAG_ID_IDX,
            |payload| Ok(codec::decode_tag_id(payload)?),
            on_change,
            on_error,
        )
    }

    /// Paired tag, `-1` when none.
    pub async fn read_rfid_paired_tag_id(&self) -> BleResult<i64> {
        let payload = self
            .read_raw("RFID paired tag id", ServiceId::Rfid, CHARACTERISTIC_RFID_PAIRED_TAG_ID_IDX)
            .await?;
        Ok(codec::decode_tag_id(&payload)?)
    }

    /// Pairs a tag; `-1` unpairs.
    pub async fn write_rfid_paired_tag_id(&self, tag_id: i64) -> BleResult<()> {
        let payload = codec::encode_tag_id(tag_id)?;
        self.write_raw(
            "RFID paired tag id",
            ServiceId::Rfid,
            CHARACTERISTIC_RFID_PAIRED_TAG_ID_IDX,
            &payload,
        )
        .await
    }

    pub async fn read_rfid_enabled(&self) -> BleResult<bool> {
        let payload = self
            .read_raw("RFID enabled", ServiceId::Rfid, CHARACTERISTIC_RFID_ENABLED_IDX)
            .await?;
        Ok(codec::decode_bool(&payload)?)
    }

    pub async fn write_rfid_enabled(&self, enabled: bool) -> BleResult<()> {
        self.write_raw(
            "RFID enabled",
            ServiceId::Rfid,
            CHARACTERISTIC_RFID_ENABLED_IDX,
            &codec::encode_bool(enabled),
        )
        .await
    }

    // Device information service

    pub async fn read_firmware_version(&self) -> BleResult<String> {
        let payload = self
            .read_raw(
                "FW/HW version",
                ServiceId::DeviceInformation,
                CHARACTERISTIC_DIS_FW_HW_VERSION_IDX,
            )
            .await?;
        Ok(codec::decode_utf8_string(&payload)?)
    }
}

fn decode_dim_led_mode(payload: &[u8]) -> BleResult<DimLedMode> {
    Ok(DimLedMode::try_from(codec::decode_u8(payload)?)?)
}

/// Level byte, then an optional little-endian voltage in millivolts.
fn decode_battery_status(payload: &[u8]) -> BleResult<BatteryStatus> {
    let level = BatteryLevel::try_from(codec::decode_u8(payload)?)?;
    let voltage_mv = match payload.get(1..) {
        Some(rest) if !rest.is_empty() => Some(codec::decode_i16_le(rest)?),
        _ => None,
    };
    Ok(BatteryStatus { level, voltage_mv })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_status_with_and_without_voltage() {
        assert_eq!(
            decode_battery_status(&[0x03, 0x10, 0x0E]).unwrap(),
            BatteryStatus {
                level: BatteryLevel::Medium,
                voltage_mv: Some(3600)
            }
        );
        assert_eq!(
            decode_battery_status(&[0xFF]).unwrap(),
            BatteryStatus {
                level: BatteryLevel::Unknown,
                voltage_mv: None
            }
        );
        // a dangling voltage byte is a protocol mismatch
        assert!(decode_battery_status(&[0x01, 0x10]).is_err());
    }

    #[test]
    fn dim_led_decoding_rejects_unknown_modes() {
        assert_eq!(decode_dim_led_mode(&[0x02]).unwrap(), DimLedMode::OnMild);
        let err = decode_dim_led_mode(&[0x07]).unwrap_err();
        assert!(err.is_feature_unsupported());
    }
}
