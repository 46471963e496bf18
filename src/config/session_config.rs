use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    ADVERTISEMENT_REFRESH_MS, DEVICE_CONNECT_TIMEOUT_MS, DEVICE_NAME_PREFIXES,
    MONITOR_REFRESH_TEMPERATURE_INTERVAL_MS, MONITOR_REFRESH_VLED_ISNS_INTERVAL_MS,
    RFID_MONITOR_REFRESH_INTERVAL_MS, SETTINGS_REFRESH_INTERVAL_MS, UUID_LED_CONTROL_SERVICE,
};

const CONFIG_FILE_NAME: &str = "session_config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for a single connection attempt.
    pub connect_timeout_ms: u64,

    /// Advertised names must start with one of these to be listed.
    pub device_name_prefixes: Vec<String>,

    /// Service UUIDs passed to the platform scan filter.
    pub scan_services: Vec<Uuid>,

    /// Repeats of an advertisement inside this window are dropped.
    pub advertisement_refresh_ms: u64,

    pub led_poll_interval_ms: u64,
    pub temperature_poll_interval_ms: u64,
    pub rfid_poll_interval_ms: u64,
    pub battery_poll_interval_ms: u64,

    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout_ms: DEVICE_CONNECT_TIMEOUT_MS,
            device_name_prefixes: DEVICE_NAME_PREFIXES.iter().map(|p| p.to_string()).collect(),
            scan_services: vec![UUID_LED_CONTROL_SERVICE],
            advertisement_refresh_ms: ADVERTISEMENT_REFRESH_MS,
            led_poll_interval_ms: MONITOR_REFRESH_VLED_ISNS_INTERVAL_MS,
            temperature_poll_interval_ms: MONITOR_REFRESH_TEMPERATURE_INTERVAL_MS,
            rfid_poll_interval_ms: RFID_MONITOR_REFRESH_INTERVAL_MS,
            battery_poll_interval_ms: SETTINGS_REFRESH_INTERVAL_MS,
            log_level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn advertisement_refresh(&self) -> Duration {
        Duration::from_millis(self.advertisement_refresh_ms)
    }

    /// Falls back to `Info` for unrecognised values.
    pub fn log_level(&self) -> log::Level {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level {:?}, using info.", self.log_level);
            log::Level::Info
        })
    }

    /// `<platform config dir>/session_config.json`, if a home directory exists.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "SunFibre", "sunfibre-ble")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Loads the config from `file_path`, or the defaults if it does not exist.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path)
            .await
            .with_context(|| format!("reading {:?}", file_path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing {:?}", file_path))?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the config to `file_path`, creating its directory.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        if let Some(config_dir) = file_path.parent() {
            crate::utils::ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize session config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Session config saved to {:?}.", file_path);
        Ok(())
    }
}
