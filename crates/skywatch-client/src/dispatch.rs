//! Typed publish/subscribe registry for telemetry events.
//!
//! Handlers for one topic form an unordered set; dispatch order across them
//! is unspecified and consumers must not rely on it. Each handler invocation
//! is isolated: a panicking subscriber is caught and logged, and can neither
//! starve its siblings nor unwind into the connection's read loop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use skywatch_core::{Envelope, EventType};

/// Client-side connection lifecycle notifications. These never appear on the
/// wire; the dispatcher synthesizes an envelope for them so the handler
/// signature stays uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Connected,
    Disconnected,
    MaxReconnectReached,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::MaxReconnectReached => "max_reconnect_reached",
        }
    }
}

/// What a subscriber can listen to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Event(EventType),
    Lifecycle(Lifecycle),
}

impl From<EventType> for Topic {
    fn from(e: EventType) -> Self {
        Topic::Event(e)
    }
}

impl From<Lifecycle> for Topic {
    fn from(l: Lifecycle) -> Self {
        Topic::Lifecycle(l)
    }
}

pub type Handler = Arc<dyn Fn(&Value, &Envelope) + Send + Sync>;

/// Handle returned by [`EventDispatcher::on`]. Unsubscribing takes the handle
/// back, so `off` cannot silently miss the way removing by closure identity
/// could.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    id: u64,
}

#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<HashMap<Topic, HashMap<u64, Handler>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; multiple handlers per topic are allowed.
    pub fn on<T, F>(&self, topic: T, handler: F) -> Subscription
    where
        T: Into<Topic>,
        F: Fn(&Value, &Envelope) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .unwrap()
            .entry(topic.clone())
            .or_default()
            .insert(id, Arc::new(handler));
        Subscription { topic, id }
    }

    /// Remove a handler. Consumes the handle; a handle is valid for exactly
    /// one `off`.
    pub fn off(&self, sub: Subscription) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(handlers) = registry.get_mut(&sub.topic) {
            handlers.remove(&sub.id);
            if handlers.is_empty() {
                registry.remove(&sub.topic);
            }
        }
    }

    /// Dispatch a parsed wire envelope to its event topic.
    pub fn emit_event(&self, envelope: &Envelope) {
        self.emit(
            Topic::Event(envelope.event.clone()),
            &envelope.data,
            envelope,
        );
    }

    /// Dispatch a lifecycle notification with a synthesized envelope.
    pub fn emit_lifecycle(&self, lifecycle: Lifecycle) {
        let envelope = Envelope::synthetic(lifecycle.as_str(), Value::Null);
        self.emit(Topic::Lifecycle(lifecycle), &Value::Null, &envelope);
    }

    fn emit(&self, topic: Topic, data: &Value, envelope: &Envelope) {
        // Snapshot the handler set and release the lock before invoking, so
        // handlers are free to subscribe/unsubscribe reentrantly.
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock().unwrap();
            match registry.get(&topic) {
                Some(set) => set.values().cloned().collect(),
                None => return,
            }
        };

        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(data, envelope)));
            if result.is_err() {
                tracing::error!(topic = ?topic, "event handler panicked, continuing");
            }
        }
    }

    #[cfg(test)]
    fn handler_count(&self, topic: &Topic) -> usize {
        self.registry
            .lock()
            .unwrap()
            .get(topic)
            .map(|set| set.len())
            .unwrap_or(0)
    }
}
