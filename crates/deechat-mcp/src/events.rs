//! Typed lifecycle events and the fan-out bus.
//!
//! Publishing is synchronous: listeners run inside the publishing call,
//! in registration order. A listener that panics is caught and logged;
//! it never takes the publisher down. Events for a single server are
//! published in the order they happen within the emitting component.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum McpEventKind {
    /// A server connection was established
    ServerConnected,
    /// A server connection ended
    ServerDisconnected,
    /// A server failed to open or errored at runtime
    ServerError,
    /// An uncorrelated message arrived from a server
    ServerMessage,
    /// A tool catalog was (re)discovered
    ToolDiscovered,
    /// A tool call completed
    ToolCalled,
    /// A tool call failed
    ToolError,
    /// A config was added
    ConfigAdded,
    /// A config was updated
    ConfigUpdated,
    /// A config was removed
    ConfigRemoved,
}

/// One lifecycle event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpEvent {
    /// Event kind
    #[serde(rename = "type")]
    pub kind: McpEventKind,
    /// Affected server, when the event concerns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// When the event was published
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message, for error kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl McpEvent {
    /// An event for one server
    pub fn server(kind: McpEventKind, server_id: impl Into<String>) -> Self {
        Self {
            kind,
            server_id: Some(server_id.into()),
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    /// Attach a payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach an error message
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Listener invoked synchronously on publish
pub type EventListener = Arc<dyn Fn(&McpEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Fan-out of typed lifecycle events to subscribers
pub struct EventBus {
    listeners: RwLock<Vec<(u64, EventListener)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// An empty bus
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; returns the token to unsubscribe with
    pub fn subscribe(&self, listener: EventListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        ListenerId(id)
    }

    /// Detach a listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id.0);
    }

    /// Deliver an event to every listener, catching panics
    pub fn publish(&self, event: McpEvent) {
        let listeners: Vec<EventListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
            if result.is_err() {
                warn!(kind = ?event.kind, "event listener panicked");
            }
        }
    }
}
