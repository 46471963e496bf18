//! Platform adapter seam
//! The narrow set of transport operations the session layer depends on.
//! [`crate::core::bluetooth::BluestAdapter`] is the production implementation.

use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::codec::Payload;
use crate::core::bluetooth::types::DiscoveredService;

/// Transport failure as reported by the platform stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("Operation was cancelled")]
    OperationCancelled,
    #[error("Device {0} was disconnected")]
    DeviceDisconnected(String),
    #[error("Bluetooth adapter is not powered on")]
    NotPoweredOn,
    #[error("Operation timed out")]
    Timeout,
    #[error("Device {0} is not known to the adapter")]
    UnknownPeripheral(String),
    #[error("Characteristic {0} is not available")]
    CharacteristicUnavailable(Uuid),
    #[error("{0}")]
    Platform(String),
}

impl AdapterError {
    /// Expected while tearing down or disconnecting; not a genuine failure.
    pub fn is_teardown_race(&self) -> bool {
        matches!(self, Self::OperationCancelled | Self::DeviceDisconnected(_))
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
}

/// A raw advertisement as delivered by the platform scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

/// Connected peripheral reported by the OS outside of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDevice {
    pub address: String,
    pub name: Option<String>,
}

/// Platform BLE collaborator. Streams are `'static` and stop the underlying
/// operation when dropped.
#[async_trait::async_trait]
pub trait BleAdapter: Send + Sync {
    async fn power_state(&self) -> AdapterResult<PowerState>;

    async fn power_events(&self) -> AdapterResult<BoxStream<'static, PowerState>>;

    /// Peripherals the OS already holds a connection to.
    async fn connected_devices(&self) -> AdapterResult<Vec<KnownDevice>>;

    async fn scan(
        &self,
        services: &[Uuid],
    ) -> AdapterResult<BoxStream<'static, AdapterResult<Advertisement>>>;

    async fn connect(&self, address: &str) -> AdapterResult<()>;

    async fn disconnect(&self, address: &str) -> AdapterResult<()>;

    async fn discover_services(&self, address: &str) -> AdapterResult<Vec<DiscoveredService>>;

    async fn read(&self, address: &str, service: Uuid, characteristic: Uuid) -> AdapterResult<Payload>;

    async fn write(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> AdapterResult<()>;

    async fn subscribe(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<Payload>>>;

    /// Yields once per disconnection of `address`.
    async fn subscribe_disconnect(
        &self,
        address: &str,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<()>>>;
}

/// Turns a channel receiver into a boxed stream that ends when all senders are gone.
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn only_cancel_and_disconnect_are_teardown_races() {
        assert!(AdapterError::OperationCancelled.is_teardown_race());
        assert!(AdapterError::DeviceDisconnected("A".into()).is_teardown_race());
        assert!(!AdapterError::Timeout.is_teardown_race());
        assert!(!AdapterError::Platform("GATT error 0x85".into()).is_teardown_race());
    }

    #[tokio::test]
    async fn receiver_stream_ends_with_senders() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        let items: Vec<i32> = receiver_stream(rx).collect().await;
        assert_eq!(items, vec![1, 2]);
    }
}
