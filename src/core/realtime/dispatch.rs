//! Typed dispatch of inbound events, keyed by [`EventKind`].

use std::collections::HashMap;

use parking_lot::RwLock;

use super::messages::{EventKind, ServerEvent};
use crate::core::events::{Listeners, Subscription};

/// Routes each [`ServerEvent`] to the listeners registered for its kind,
/// then to the catch-all listeners.
#[derive(Default)]
pub struct EventDispatcher {
    by_kind: RwLock<HashMap<EventKind, Listeners<ServerEvent>>>,
    any: Listeners<ServerEvent>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .subscribe(listener)
    }

    pub fn subscribe_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.any.subscribe(listener)
    }

    pub fn dispatch(&self, event: &ServerEvent) {
        let listeners = self.by_kind.read().get(&event.kind()).cloned();
        if let Some(listeners) = listeners {
            listeners.emit(event);
        }
        self.any.emit(event);
    }

    pub fn listener_count(&self, kind: &EventKind) -> usize {
        self.by_kind.read().get(kind).map_or(0, |l| l.len())
    }

    pub fn clear(&self) {
        for listeners in self.by_kind.write().drain().map(|(_, l)| l) {
            listeners.clear();
        }
        self.any.clear();
    }
}
