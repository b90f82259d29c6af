//! Per-subscriber delivery slots.
//!
//! Bounds how many deliveries may be in flight to a single subscription at
//! once, independently of the worker's global concurrency bound, so one slow
//! or failing subscriber cannot occupy every worker slot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Default in-flight deliveries per subscription.
pub const DEFAULT_SLOTS_PER_SUBSCRIPTION: usize = 1;

/// Registry of per-subscription delivery semaphores.
pub struct SubscriberLimiter {
    slots_per_subscription: usize,
    semaphores: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl SubscriberLimiter {
    /// Create a limiter granting `slots_per_subscription` concurrent
    /// deliveries per subscription (minimum 1).
    #[must_use]
    pub fn new(slots_per_subscription: usize) -> Self {
        Self {
            slots_per_subscription: slots_per_subscription.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a delivery slot for the given subscription.
    ///
    /// The slot is held until the returned permit is dropped. Returns `None`
    /// only if the semaphore was closed, which the limiter never does.
    pub async fn acquire(&self, subscription_id: Uuid) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut map = self.semaphores.lock().await;
            map.entry(subscription_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.slots_per_subscription)))
                .clone()
        };

        semaphore.acquire_owned().await.ok()
    }

    /// Drop the semaphore for a removed subscription.
    pub async fn forget(&self, subscription_id: Uuid) {
        self.semaphores.lock().await.remove(&subscription_id);
    }
}

impl Default for SubscriberLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS_PER_SUBSCRIPTION)
    }
}
