//! Ordered callback registries with handle-based removal.
//!
//! Every registration receives a process-unique [`SubscriptionId`]. Because
//! ids are allocated from one monotonic counter, ordering a registry by id is
//! the same as ordering it by registration time, and a registration keeps its
//! id when it moves from a pending queue into a live registry.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::error;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// A callback stored in a registry.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque identity of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An ordered set of callbacks for one event kind.
pub struct Registry<T: ?Sized> {
    entries: BTreeMap<SubscriptionId, Callback<T>>,
}

impl<T: ?Sized> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Appends a callback and returns its handle.
    pub fn insert(&mut self, callback: Callback<T>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.insert(id, callback);
        id
    }

    /// Re-inserts a callback under an id it already owns.
    pub(crate) fn adopt(&mut self, id: SubscriptionId, callback: Callback<T>) {
        self.entries.insert(id, callback);
    }

    /// Removes a registration. Returns `false` if it was already gone.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Takes every registration out, in registration order.
    pub fn drain(&mut self) -> Vec<(SubscriptionId, Callback<T>)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    /// Returns the callbacks in registration order.
    pub fn snapshot(&self) -> Vec<Callback<T>> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Callbacks never run while a registry lock is held, so a poisoned lock only
/// means an internal bookkeeping step was interrupted.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invokes every callback in `callbacks` with `value`, in order.
///
/// A panicking callback is logged and skipped; the remaining callbacks still
/// run.
pub(crate) fn invoke_all<T: ?Sized>(label: &str, callbacks: &[Callback<T>], value: &T) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
            error!(event = label, "callback panicked during dispatch");
        }
    }
}

/// Snapshots `registry` and dispatches `value` to it outside the lock.
pub(crate) fn dispatch<T: ?Sized>(label: &str, registry: &Mutex<Registry<T>>, value: &T) {
    let callbacks = lock(registry).snapshot();
    invoke_all(label, &callbacks, value);
}

/// Handle returned by every `on_*` registration.
///
/// [`unsubscribe`](Subscription::unsubscribe) removes exactly this
/// registration from whichever store currently holds it and is a no-op after
/// the first call. Dropping the handle does **not** unsubscribe.
#[must_use = "dropping a Subscription keeps the callback registered; keep it to unsubscribe later"]
pub struct Subscription {
    id: SubscriptionId,
    remover: Arc<dyn Fn(SubscriptionId) + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        remover: impl Fn(SubscriptionId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            remover: Arc::new(remover),
        }
    }

    /// A subscription bound directly to one registry.
    pub(crate) fn for_registry<T: ?Sized + 'static>(
        id: SubscriptionId,
        registry: &Arc<Mutex<Registry<T>>>,
    ) -> Self {
        let weak = Arc::downgrade(registry);
        Self::new(id, move |id| {
            if let Some(registry) = weak.upgrade() {
                lock(&registry).remove(id);
            }
        })
    }

    /// The identity of this registration.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes the registration. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        (self.remover)(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
