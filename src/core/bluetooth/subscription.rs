//! Cancellable subscriptions
//! Every monitor, disconnection listener and poller hands back a
//! [`Subscription`]. Cancelling twice is a no-op. Dropping a subscription does
//! not cancel it; the owner must call [`Subscription::cancel`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio_util::sync::CancellationToken;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Characteristic,
    Disconnection,
    Polling,
}

struct Inner {
    id: u64,
    kind: SubscriptionKind,
    token: CancellationToken,
    cancelled: AtomicBool,
}

/// Handle to a running listener.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Subscription {
    pub fn new(kind: SubscriptionKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                token: CancellationToken::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.inner.kind
    }

    /// Stops the listener. Later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Cancelling {:?} subscription {}", self.inner.kind, self.inner.id);
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Token the listener task selects on.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
}

/// Subscriptions grouped by peripheral address, so a disconnect can tear
/// down everything bound to that peripheral.
#[derive(Default)]
pub struct SubscriptionManager {
    by_address: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, address: &str, subscription: &Subscription) {
        let mut by_address = self.by_address.lock().unwrap_or_else(|e| e.into_inner());
        let subscriptions = by_address.entry(address.to_string()).or_default();
        subscriptions.retain(|s| !s.is_cancelled());
        subscriptions.push(subscription.clone());
    }

    /// Cancels every subscription tracked for `address`. Returns how many were live.
    pub fn cancel_all(&self, address: &str) -> usize {
        let removed = self
            .by_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address)
            .unwrap_or_default();
        let live = removed.iter().filter(|s| !s.is_cancelled()).count();
        for subscription in &removed {
            subscription.cancel();
        }
        if live > 0 {
            debug!("Cancelled {} subscriptions of {}", live, address);
        }
        live
    }

    pub fn cancel_everything(&self) {
        let all: Vec<Subscription> = self
            .by_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .flat_map(|(_, subs)| subs)
            .collect();
        for subscription in all {
            subscription.cancel();
        }
    }

    pub fn active_count(&self, address: &str) -> usize {
        self.by_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .map(|subs| subs.iter().filter(|s| !s.is_cancelled()).count())
            .unwrap_or(0)
    }
}
