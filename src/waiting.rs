//! Waiting registry
//!
//! Every cancellable blocking operation registers a callback here for its
//! lifetime. [`WaitingSet::cancel_all`] invokes all of them, unblocking every
//! operation of the process at once (used on shutdown and by stop handlers).
//!
//! Callbacks only capture cancel handles (listener queues, socket control
//! handles, flags), never the object owning the [`Waiting`] guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Set of cancellable in-flight operations
#[derive(Default)]
pub struct WaitingSet {
    callbacks: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
}

impl WaitingSet {
    /// Create an empty set
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a cancel callback, removed when the returned guard drops
    pub fn add<F>(self: &Arc<Self>, callback: F) -> Waiting
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(id, Arc::new(callback));
        }

        Waiting {
            set: Arc::downgrade(self),
            id,
        }
    }

    /// Invoke every registered callback
    ///
    /// Callbacks run outside the lock and may register or drop guards.
    pub fn cancel_all(&self) {
        let snapshot: Vec<Callback> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.values().cloned().collect(),
            Err(_) => return,
        };

        tracing::debug!(count = snapshot.len(), "Canceling all waiting operations");

        for callback in snapshot {
            callback();
        }
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if no operation is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.remove(&id);
        }
    }
}

/// Registration of one cancellable operation
pub struct Waiting {
    set: Weak<WaitingSet>,
    id: u64,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.remove(self.id);
        }
    }
}
