//! Session event bus.
//!
//! State transitions are announced through an explicit subscriber list rather
//! than single-slot callback fields: multiple subscribers, unsubscription, and
//! no accidental overwrite. Callbacks are invoked synchronously at the point
//! of transition, at most once per transition, and must not block.

use crate::SessionError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Notifications fired by the session and its collaborators.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The channel connected or disconnected.
    ConnectionChanged { connected: bool },
    /// The execution context was invalidated; `reload` distinguishes a
    /// suspected brief host reload from a genuine teardown.
    ContextInvalid { reload: bool },
    /// A circuit breaker tripped open.
    CircuitOpened { failure_count: usize },
    /// Health probing crossed the critical consecutive-failure threshold.
    HealthCheckFailed { error: SessionError, consecutive_failures: u64 },
    /// The reconnection budget is exhausted; the session is offline until an
    /// external trigger re-validates the context.
    ReconnectExhausted { attempts: u32 },
}

/// Handle for removing a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct BusInner {
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

/// Multi-subscriber event bus. Clones share the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("subscribers", &self.subscriber_count()).finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a subscriber; returns a handle for [`EventBus::unsubscribe`].
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .lock()
            .expect("event bus poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber. Returns false if the handle was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock().expect("event bus poisoned");
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Deliver an event to every current subscriber. The list is snapshotted
    /// first so callbacks can subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &SessionEvent) {
        let snapshot: Vec<Subscriber> = {
            let subscribers = self.inner.subscribers.lock().expect("event bus poisoned");
            subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in snapshot {
            callback(event);
        }
    }

    /// Drop every subscription (session teardown).
    pub fn clear(&self) {
        self.inner.subscribers.lock().expect("event bus poisoned").clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().expect("event bus poisoned").len()
    }
}
