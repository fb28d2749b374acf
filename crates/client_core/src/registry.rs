//! Subscription registry for server events.
//!
//! Dispatch is mediated here rather than by the raw socket's listener table,
//! so registrations survive reconnects without callers re-subscribing.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use shared::protocol::{EventKind, ServerEvent};

pub type EventCallback = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Handle identifying one registered callback. Returned by
/// [`EventRegistry::on`]; pass it back to [`EventRegistry::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(u64, EventCallback)>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind. Callbacks fire in
    /// registration order; a live connection is not required.
    pub fn on(
        &self,
        kind: EventKind,
        callback: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.lock_handlers();
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription { kind, id }
    }

    /// Remove a single callback. Returns whether it was still registered.
    pub fn off(&self, subscription: Subscription) -> bool {
        let mut handlers = self.lock_handlers();
        let Some(entries) = handlers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscription.id);
        before != entries.len()
    }

    /// Remove every callback registered for `kind`. Returns how many were
    /// dropped.
    pub fn off_all(&self, kind: EventKind) -> usize {
        self.lock_handlers().remove(&kind).map_or(0, |v| v.len())
    }

    pub fn clear(&self) {
        self.lock_handlers().clear();
    }

    /// Deliver `event` to every subscriber of its kind, in registration
    /// order. The subscriber set is snapshotted first: removal during a
    /// dispatch affects future dispatches only.
    pub fn dispatch(&self, event: &ServerEvent) {
        let callbacks: Vec<EventCallback> = {
            let handlers = self.lock_handlers();
            handlers
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock_handlers().get(&kind).map_or(0, Vec::len)
    }

    fn lock_handlers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(u64, EventCallback)>>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
