//! Bluetooth functionality for SunFibre peripherals
//! This module handles all bluetooth operations including scanning,
//! connecting, discovery and typed characteristic I/O.

pub mod adapter;
mod bluest_adapter;
pub mod codec;
mod connection;
pub mod constants;
pub mod error;
mod manager;
mod notification;
mod peripheral;
pub mod registry;
mod scanner;
mod subscription;
mod telemetry;
pub mod types;

// Re-export types that should be publicly accessible
pub use adapter::{AdapterError, AdapterResult, Advertisement, BleAdapter, KnownDevice, PowerState};
pub use bluest_adapter::{BluestAdapter, normalize_address};
pub use connection::ConnectionManager;
pub use constants::*; // Re-export all constants
pub use error::{BleError, BleResult};
pub use manager::BleSessionManager;
pub use notification::{ErrorHandler, NotificationHandler};
pub use peripheral::PeripheralHandle;
pub use registry::{DeviceAction, DeviceRegistry};
pub use scanner::{BluetoothScanner, ScanErrorHandler};
pub use subscription::{Subscription, SubscriptionKind, SubscriptionManager};
pub use telemetry::{PollIntervals, TelemetryUpdate, start_telemetry_polling};
pub use types::{
    BatteryLevel, BatteryStatus, CharacteristicHandle, ConnectionState, DimLedMode,
    DiscoveredService, Peripheral, ScannedPeripheral, ServiceId, ServiceTable,
};
