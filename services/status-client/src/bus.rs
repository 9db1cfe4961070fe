//! In-process status event bus.
//!
//! One bus is constructed at start-up and cloned into every producer and
//! consumer. Listeners are keyed by [`EventName`] and invoked synchronously,
//! in registration order, on the publishing task. A listener that returns an
//! error or panics is logged and skipped; the publisher never sees it.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, error, warn};

use crate::events::{EventName, StatusEvent};

/// Failure reported by a listener. Isolated to that listener.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

impl SubscriberError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

type Callback = Arc<dyn Fn(&StatusEvent) -> Result<(), SubscriberError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Clone)]
struct Listener {
    id: SubscriberId,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct BusInner {
    listeners: RwLock<HashMap<EventName, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<EventName, Vec<Listener>>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EventName, Vec<Listener>>> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, name: EventName, id: SubscriberId) -> bool {
        let mut listeners = self.write();
        let Some(list) = listeners.get_mut(&name) else {
            return false;
        };
        let Some(pos) = list.iter().position(|l| l.id == id) else {
            return false;
        };
        let removed = list.remove(pos);
        // A publish already holding a snapshot must not call it any more.
        removed.active.store(false, Ordering::SeqCst);
        if list.is_empty() {
            listeners.remove(&name);
        }
        true
    }
}

/// Cloneable handle to the shared listener registry.
#[derive(Clone, Default)]
pub struct StatusBus {
    inner: Arc<BusInner>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `name`. The listener stays registered until the
    /// returned handle is dropped, unsubscribed, or detached.
    pub fn subscribe<F>(&self, name: EventName, callback: F) -> SubscriptionHandle
    where
        F: Fn(&StatusEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.write().entry(name).or_default().push(Listener {
            id,
            active: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(callback),
        });
        debug!(event = %name, subscriber = id.0, "subscribed");
        SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            name,
            id,
            detached: false,
        }
    }

    /// Remove a listener. Unknown ids are a no-op; returns whether anything
    /// was removed.
    pub fn unsubscribe(&self, name: EventName, id: SubscriberId) -> bool {
        self.inner.remove(name, id)
    }

    /// Deliver `event` to every listener registered for its name. Returns the
    /// number of listeners invoked.
    pub fn publish(&self, event: StatusEvent) -> usize {
        let name = event.name();
        let snapshot: Vec<Listener> = self.inner.read().get(&name).cloned().unwrap_or_default();
        if snapshot.is_empty() {
            debug!(event = %name, "no subscribers");
            return 0;
        }

        let mut invoked = 0;
        for listener in &snapshot {
            if !listener.active.load(Ordering::SeqCst) {
                continue;
            }
            invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event = %name, subscriber = listener.id.0, error = %e, "subscriber failed");
                }
                Err(_) => {
                    error!(event = %name, subscriber = listener.id.0, "subscriber panicked");
                }
            }
        }
        invoked
    }

    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.inner.read().get(&name).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for StatusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.inner.read();
        let counts: HashMap<EventName, usize> =
            listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("StatusBus").field("listeners", &counts).finish()
    }
}

/// Scoped registration. Dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes immediately"]
#[derive(Debug)]
pub struct SubscriptionHandle {
    bus: Weak<BusInner>,
    name: EventName,
    id: SubscriberId,
    detached: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn name(&self) -> EventName {
        self.name
    }

    pub fn unsubscribe(mut self) -> bool {
        self.detached = true;
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.remove(self.name, self.id))
    }

    /// Keep the listener registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.name, self.id);
        }
    }
}
