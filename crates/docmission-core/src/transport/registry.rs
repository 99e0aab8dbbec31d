//! Named event handlers

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

/// An event delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub payload: Value,
    /// Connection the event arrived on (increments per successful connect)
    pub epoch: u64,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, payload: Value, epoch: u64) -> Self {
        Self {
            name: name.into(),
            payload,
            epoch,
        }
    }
}

/// Handler invoked once per delivered event
pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Handlers keyed by event name, kept in registration order
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn register(&self, event: &str, handler: EventHandler) {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(event.to_string()).or_default().push(handler);
    }

    /// Invoke every handler registered for `event.name`; returns how many ran
    pub(crate) fn dispatch(&self, event: &InboundEvent) -> usize {
        // Handlers run outside the lock so they may register further handlers
        let matching = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers.get(&event.name).cloned().unwrap_or_default()
        };
        for handler in &matching {
            handler(event);
        }
        matching.len()
    }
}
