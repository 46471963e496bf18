//! SunFibre BLE session library
//! Scanning, connection lifecycle and the characteristic protocol of
//! SunFibre lighting devices.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
