//! Typed event bus — maps envelope kinds to handler closures.
//!
//! The node, not a shared base class, owns the bus: negotiation handlers
//! and swarm handlers alike register here, and every locally-delivered
//! envelope is dispatched through it. Emitting a kind nobody listens to
//! is not an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::{Envelope, EnvelopeKind};

type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Token returned by `on`/`once`, used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct Registration {
    id: u64,
    once: bool,
    handler: Handler,
}

/// Dispatch table from envelope kind to registered handlers.
pub struct MessageBus {
    listeners: Mutex<HashMap<EnvelopeKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `kind`. Handlers fire in registration order.
    pub fn on(
        &self,
        kind: EnvelopeKind,
        handler: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(kind, false, Arc::new(handler))
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once(
        &self,
        kind: EnvelopeKind,
        handler: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(kind, true, Arc::new(handler))
    }

    fn register(&self, kind: EnvelopeKind, once: bool, handler: Handler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().unwrap();
        listeners
            .entry(kind)
            .or_default()
            .push(Registration { id, once, handler });
        HandlerId(id)
    }

    /// Remove one listener. Returns whether it was still registered.
    pub fn remove_listener(&self, kind: EnvelopeKind, id: HandlerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(entries) = listeners.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|r| r.id != id.0);
            return entries.len() < before;
        }
        false
    }

    /// Remove every listener for `kind`.
    pub fn remove_all(&self, kind: EnvelopeKind) {
        self.listeners.lock().unwrap().remove(&kind);
    }

    /// Total registered listeners across all kinds.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .values()
            .map(|v| v.len())
            .sum()
    }

    /// Invoke every handler registered for the envelope's kind.
    ///
    /// Handlers are invoked outside the table lock so they may freely
    /// register, remove, or emit.
    pub fn emit(&self, envelope: Envelope) {
        let handlers: Vec<Handler> = {
            let mut listeners = self.listeners.lock().unwrap();
            match listeners.get_mut(&envelope.kind) {
                Some(entries) => {
                    let fired: Vec<Handler> =
                        entries.iter().map(|r| r.handler.clone()).collect();
                    entries.retain(|r| !r.once);
                    fired
                }
                None => return,
            }
        };
        for handler in handlers {
            handler(envelope.clone());
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
