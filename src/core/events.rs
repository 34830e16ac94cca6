//! Typed listener registries.
//!
//! Every event stream in the client (turn changes, lifecycle, agent audio,
//! capture chunks) gets its own `Listeners<T>` instead of a string-keyed
//! emitter, so subscribers are checked at compile time.
//!
//! Listeners fire synchronously, in subscription order, on the thread that
//! calls [`Listeners::emit`]. The registry is snapshotted before dispatch, so
//! a listener may subscribe or unsubscribe from inside its own callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// Callback type stored in a registry.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Listener<T>)>>,
}

impl<T> Registry<T> {
    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}

/// An ordered set of listeners for one event type.
pub struct Listeners<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.entries.write().push((id, Arc::new(listener)));

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            remover: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    /// Deliver an event to every listener, in subscription order.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .registry
            .entries
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.registry.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        self.registry.entries.write().clear();
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.registry.entries.read().len())
            .finish()
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle unsubscribes. Use [`Subscription::detach`] to keep the
/// listener registered for the lifetime of the registry.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    remover: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Identifier of the listener inside its registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remover.take() {
            remove();
        }
    }

    /// Keep the listener registered and discard the handle.
    pub fn detach(mut self) {
        self.remover = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remover.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.remover.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_subscription_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().push(("a", *v)))
        };
        let b = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().push(("b", *v)))
        };

        listeners.emit(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
        assert_eq!(listeners.len(), 2);

        drop(a);
        b.unsubscribe();
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_detach_keeps_listener() {
        let listeners: Listeners<()> = Listeners::new();
        listeners.subscribe(|_| {}).detach();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_unsubscribe_inside_callback() {
        let listeners: Listeners<()> = Listeners::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let sub = {
            let slot = slot.clone();
            let calls = calls.clone();
            listeners.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                slot.lock().take();
            })
        };
        *slot.lock() = Some(sub);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let listeners: Listeners<u8> = Listeners::new();
        let sub = listeners.subscribe(|_| {});
        drop(listeners);
        sub.unsubscribe();
    }
}
