//! Constants used throughout the BLE layer
//! This module contains the service UUIDs, characteristic indices and
//! timing defaults of the SunFibre firmware.

use uuid::Uuid;

/// Advertised name prefixes accepted during scanning
pub const DEVICE_NAME_PREFIXES: [&str; 2] = ["SunFibre", "BlueIoToy"];

/// LED control service (dim mode, debug LED, VLED, ISNS)
pub const UUID_LED_CONTROL_SERVICE: Uuid = Uuid::from_u128(0x0000aaaa_1212_efde_1523_785fef13d123);

/// Monitor service (battery, charging, temperature)
pub const UUID_MONITOR_SERVICE: Uuid = Uuid::from_u128(0x0000aaaa_1413_f0df_1624_7960f014d224);

/// RFID tag pairing service
pub const UUID_RFID_SERVICE: Uuid = Uuid::from_u128(0x0000aaaa_1514_f1e0_1725_7a61f115d325);

/// Standard Bluetooth Device Information Service
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

// LED control service
pub const CHARACTERISTIC_DIM_LED_IDX: usize = 0;
pub const CHARACTERISTIC_DEBUG_LED_IDX: usize = 1;
pub const CHARACTERISTIC_VLED_IDX: usize = 2;
pub const CHARACTERISTIC_ISNS_IDX: usize = 3;

// Monitor service
pub const CHARACTERISTIC_BATTERY_LEVEL_IDX: usize = 0;
pub const CHARACTERISTIC_BATTERY_CHARGING_IDX: usize = 1;
pub const CHARACTERISTIC_TEMPERATURE_IDX: usize = 2;

// RFID service
pub const CHARACTERISTIC_RFID_DETECTED_TAG_ID_IDX: usize = 0;
pub const CHARACTERISTIC_RFID_PAIRED_TAG_ID_IDX: usize = 1;
pub const CHARACTERISTIC_RFID_ENABLED_IDX: usize = 2;

// Device information service
pub const CHARACTERISTIC_DIS_FW_HW_VERSION_IDX: usize = 1;

/// Domain value for "no tag paired/detected"
pub const NO_TAG_ID: i64 = -1;

/// Timeout for a single connection attempt in milliseconds
pub const DEVICE_CONNECT_TIMEOUT_MS: u64 = 8000;

/// Window during which repeated advertisements from one address are dropped
pub const ADVERTISEMENT_REFRESH_MS: u64 = 1000;

// Polling intervals in milliseconds
pub const MONITOR_REFRESH_VLED_ISNS_INTERVAL_MS: u64 = 5000;
pub const MONITOR_REFRESH_TEMPERATURE_INTERVAL_MS: u64 = 20000;
pub const RFID_MONITOR_REFRESH_INTERVAL_MS: u64 = 30000;
pub const SETTINGS_REFRESH_INTERVAL_MS: u64 = 15000;
