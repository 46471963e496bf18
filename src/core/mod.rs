//! Core functionality for the SunFibre BLE session
//! This module contains the BLE session and characteristic-protocol layer

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BleSessionManager, PeripheralHandle};
