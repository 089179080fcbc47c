//! Registered cart observers and the fan-out of new cart values.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::types::Cart;

type Callback = Arc<dyn Fn(&Cart) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Ids are handed out in increasing order, so iteration follows registration order.
    callbacks: BTreeMap<u64, Callback>,
}

/// The set of callbacks that want to see every new cart value.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback that is invoked with every new cart value.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Cart) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.insert(id, Arc::new(callback));

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// The number of currently registered callbacks.
    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `cart` to every registered callback, in registration order.
    ///
    /// Callbacks added during delivery only see later values. A callback removed during delivery
    /// is skipped if it was not reached yet. A panicking callback is logged and skipped.
    ///
    /// Returns the number of callbacks that completed normally.
    pub fn notify(&self, cart: &Cart) -> usize {
        // Never call out while holding the lock, callbacks may (un)subscribe.
        let callbacks: Vec<(u64, Callback)> = lock(&self.inner)
            .callbacks
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in callbacks {
            if !lock(&self.inner).callbacks.contains_key(&id) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| callback(cart))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("unknown panic");
                    metric!(counter("cart.subscriber.failure") += 1);
                    tracing::error!(subscriber = id, "Cart subscriber panicked: {}", message);
                }
            }
        }
        delivered
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle keeps the callback registered, call [`unsubscribe`](Self::unsubscribe) to
/// stop receiving values.
#[must_use = "the callback stays registered until `unsubscribe` is called"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes exactly this callback.
    ///
    /// Returns `true` if the callback was still registered. Calling this again is a no-op.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).callbacks.remove(&self.id).is_some(),
            None => false,
        }
    }

    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| lock(&registry).callbacks.contains_key(&self.id))
    }
}
