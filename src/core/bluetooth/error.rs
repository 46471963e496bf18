//! Error types for the BLE layer

use thiserror::Error;

use crate::core::bluetooth::adapter::AdapterError;
use crate::core::bluetooth::codec::{DecodeError, EncodeError};
use crate::core::bluetooth::types::ServiceId;

pub type BleResult<T> = std::result::Result<T, BleError>;

/// Every failure the session layer surfaces to its callers.
#[derive(Debug, Error)]
pub enum BleError {
    #[error("Bluetooth adapter is not powered on")]
    AdapterNotReady,

    #[error("Scan failed: {0}")]
    ScanFailed(#[source] AdapterError),

    #[error("Connection to {address} timed out after {timeout_ms} ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    #[error("Connection to {address} failed: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: AdapterError,
    },

    #[error("A connection attempt to {0} is already in flight")]
    ConnectInProgress(String),

    #[error("Disconnect from {address} failed: {source}")]
    DisconnectFailed {
        address: String,
        #[source]
        source: AdapterError,
    },

    #[error("Service discovery on {address} failed: {source}")]
    DiscoveryFailed {
        address: String,
        #[source]
        source: AdapterError,
    },

    #[error("Device {0} is not in the devices list")]
    UnknownDevice(String),

    #[error("Device {0} has no service table (not connected)")]
    NoServiceTable(String),

    #[error("Device does not possess characteristic {index} of the {service} service")]
    CharacteristicNotFound { service: ServiceId, index: usize },

    #[error("Reading {field} failed: {source}")]
    ReadFailed {
        field: &'static str,
        #[source]
        source: AdapterError,
    },

    #[error("Writing {field} failed: {source}")]
    WriteFailed {
        field: &'static str,
        #[source]
        source: AdapterError,
    },

    #[error("Monitoring characteristic failed: {0}")]
    MonitorFailed(#[source] AdapterError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Unsupported devices action received: {0}")]
    UnsupportedAction(String),
}

impl BleError {
    /// The device firmware lacks the feature or speaks another protocol revision.
    pub fn is_feature_unsupported(&self) -> bool {
        matches!(
            self,
            Self::CharacteristicNotFound { .. } | Self::Decode(_) | Self::Encode(_)
        )
    }

    /// Recoverable by retrying the connection.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ConnectFailed { .. }
                | Self::DiscoveryFailed { .. }
                | Self::ConnectInProgress(_)
        )
    }

    /// Recoverable by asking the user to enable Bluetooth.
    pub fn is_adapter_failure(&self) -> bool {
        matches!(self, Self::AdapterNotReady | Self::ScanFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_scan_failures_are_distinguishable() {
        let timeout = BleError::ConnectTimeout {
            address: "AA:BB:CC:00:11:22".into(),
            timeout_ms: 8000,
        };
        let scan = BleError::ScanFailed(AdapterError::NotPoweredOn);

        assert!(timeout.is_connection_failure());
        assert!(!timeout.is_adapter_failure());
        assert!(scan.is_adapter_failure());
        assert!(!scan.is_connection_failure());
        assert!(BleError::AdapterNotReady.is_adapter_failure());
    }

    #[test]
    fn protocol_mismatch_reads_as_feature_unsupported() {
        let missing = BleError::CharacteristicNotFound {
            service: ServiceId::Rfid,
            index: 2,
        };
        let decode: BleError = DecodeError::Absent.into();

        assert!(missing.is_feature_unsupported());
        assert!(decode.is_feature_unsupported());
        assert!(!BleError::UnknownDevice("x".into()).is_feature_unsupported());
    }
}
