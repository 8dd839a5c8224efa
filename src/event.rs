//! Multicast events with add/remove handler registration.
//!
//! Handlers run in registration order. A handler may disconnect itself (or
//! any other handler) while the event is being dispatched; a handler removed
//! during dispatch is not invoked afterwards. The registry lock is never held
//! while a handler runs.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifies a connected handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(HandlerId, Handler<T>)>,
}

/// An observer list for values of type `T`.
pub struct Event<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler. Returns an id for [`Event::disconnect`].
    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry.handlers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut registry = self.registry();
        let before = registry.handlers.len();
        registry.handlers.retain(|(handler_id, _)| *handler_id != id);
        registry.handlers.len() != before
    }

    /// Remove all handlers.
    pub fn clear(&self) {
        // Handlers may own values whose drop touches this event again.
        let removed = std::mem::take(&mut self.registry().handlers);
        drop(removed);
    }

    pub fn len(&self) -> usize {
        self.registry().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_connected(&self, id: HandlerId) -> bool {
        self.registry()
            .handlers
            .iter()
            .any(|(handler_id, _)| *handler_id == id)
    }

    /// Invoke every connected handler with `value`.
    pub(crate) fn emit(&self, value: &T) {
        let snapshot: Vec<(HandlerId, Handler<T>)> = self.registry().handlers.clone();

        for (id, handler) in snapshot.iter() {
            if self.is_connected(*id) {
                handler(value);
            }
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handlers", &self.len())
            .finish()
    }
}
