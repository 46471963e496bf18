//! Application state management
//! Builds the adapter, device registry and session manager once per process.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::config::SessionConfig;
use crate::core::BleSessionManager;
use crate::core::bluetooth::{BleAdapter, BluestAdapter, DeviceRegistry};

/// Global application state
pub struct AppState {
    /// The device registry shared with every UI reader
    pub registry: Arc<DeviceRegistry>,
    /// The BLE session manager instance
    pub session_manager: Arc<BleSessionManager>,
}

impl AppState {
    /// Creates the state on the platform's default Bluetooth adapter.
    pub async fn new(config: SessionConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");
        let adapter = BluestAdapter::new()
            .await
            .context("No Bluetooth adapter found")?;
        Ok(Self::with_adapter(Arc::new(adapter), config))
    }

    /// Creates the state on any adapter implementation.
    pub fn with_adapter(adapter: Arc<dyn BleAdapter>, config: SessionConfig) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let session_manager = Arc::new(BleSessionManager::new(adapter, registry.clone(), config));
        Self {
            registry,
            session_manager,
        }
    }

    /// Gets a reference to the session manager
    pub fn get_session_manager_arc(&self) -> Arc<BleSessionManager> {
        self.session_manager.clone()
    }
}
