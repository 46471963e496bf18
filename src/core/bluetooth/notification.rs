//! Notification handling for connected peripherals
//! Runs characteristic-change and disconnection listeners as tasks, each
//! bound to a [`Subscription`].

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, error, info};

use crate::core::bluetooth::adapter::{AdapterError, BleAdapter};
use crate::core::bluetooth::codec::{Payload, to_hex_string};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::subscription::{Subscription, SubscriptionKind, SubscriptionManager};
use crate::core::bluetooth::types::CharacteristicHandle;

/// Called for monitor errors other than the tolerated teardown races.
pub type ErrorHandler = Box<dyn Fn(AdapterError) + Send + Sync + 'static>;

/// Spawns listener tasks and tracks their subscriptions per peripheral
#[derive(Clone)]
pub struct NotificationHandler {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
}

impl NotificationHandler {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            adapter,
            registry,
            subscriptions,
        }
    }

    /// Starts monitoring a characteristic. Raw payloads are delivered to
    /// `on_change` only while the peripheral is still connected.
    pub fn monitor_characteristic(
        &self,
        address: &str,
        characteristic: CharacteristicHandle,
        on_change: impl Fn(Payload) + Send + 'static,
        on_error: Option<ErrorHandler>,
    ) -> Subscription {
        let subscription = Subscription::new(SubscriptionKind::Characteristic);
        self.subscriptions.track(address, &subscription);

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let address = address.to_string();
        let token = subscription.token();

        tokio::spawn(async move {
            let service_uuid = characteristic.service().uuid();
            let char_uuid = characteristic.uuid();

            let subscribed = tokio::select! {
                result = adapter.subscribe(&address, service_uuid, char_uuid) => result,
                _ = token.cancelled() => return,
            };
            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    Self::handle_monitor_error(e, on_error.as_ref());
                    return;
                }
            };
            debug!("Monitoring {} on {}", char_uuid, address);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(value)) => {
                            if !registry.is_connected(&address) {
                                debug!("Dropping change of {} from disconnected {}", char_uuid, address);
                                continue;
                            }
                            debug!("Monitor {}, value has changed: {}", char_uuid, to_hex_string(&value));
                            on_change(value);
                        }
                        Some(Err(e)) => {
                            Self::handle_monitor_error(e, on_error.as_ref());
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("Monitor of {} on {} ended", char_uuid, address);
        });

        subscription
    }

    fn handle_monitor_error(e: AdapterError, on_error: Option<&ErrorHandler>) {
        if e.is_teardown_race() {
            debug!("Monitor ended by teardown: {}", e);
            return;
        }
        match on_error {
            Some(handler) => handler(e),
            None => error!("Error in monitoring: {}", e),
        }
    }

    /// Ties an externally created subscription to a peripheral's teardown.
    pub fn track(&self, address: &str, subscription: &Subscription) {
        self.subscriptions.track(address, subscription);
    }

    /// Calls `on_disconnected` every time the peripheral disconnects, until cancelled.
    pub fn watch_disconnection(
        &self,
        address: &str,
        on_disconnected: impl Fn(&str) + Send + 'static,
    ) -> Subscription {
        let subscription = Subscription::new(SubscriptionKind::Disconnection);
        self.subscriptions.track(address, &subscription);

        let adapter = self.adapter.clone();
        let address = address.to_string();
        let token = subscription.token();

        tokio::spawn(async move {
            info!("Device {} listening for disconnections...", address);
            let subscribed = tokio::select! {
                result = adapter.subscribe_disconnect(&address) => result,
                _ = token.cancelled() => return,
            };
            let mut events = match subscribed {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to listen for disconnection of {}: {}", address, e);
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(Ok(())) => {
                            info!("Device {} disconnected.", address);
                            on_disconnected(&address);
                        }
                        Some(Err(e)) => error!("Error in disconnection listener: {}", e),
                        None => break,
                    },
                }
            }
        });

        subscription
    }
}
