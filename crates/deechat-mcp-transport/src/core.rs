//! Core transport traits and types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use deechat_mcp_config::TransportKind;
use deechat_mcp_protocol::JsonRpcMessage;

use crate::correlation::RequestTracker;
use crate::retry::RetryPolicy;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Send operation failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Message could not be (de)serialized
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// Malformed JSON-RPC or unexpected protocol state
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The peer answered with a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i32,
        /// Error message from the peer
        message: String,
        /// Additional error data, if the peer provided any
        data: Option<Value>,
    },

    /// Request or connect exceeded its time limit
    #[error("operation timed out")]
    Timeout,

    /// The request was abandoned by a disconnect or explicit cancellation
    #[error("canceled: {0}")]
    Canceled(String),

    /// Authentication failed (401/403 or equivalent)
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Transport configuration is unusable
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Transport variant or endpoint not available
    #[error("transport not available: {0}")]
    NotAvailable(String),

    /// Invariant violation inside the transport
    #[error("internal error: {0}")]
    Internal(String),
}

/// Transport lifecycle states.
///
/// Transitions are monotonic within a single connect cycle:
/// `Disconnected → Connecting → Connected → Disconnecting → Disconnected`.
/// `Failed` is reachable from any non-terminal state; a failed transport
/// must pass through `Disconnected` (via `disconnect()`) before another
/// `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum TransportState {
    /// No live connection
    Disconnected,
    /// Connection attempt in flight
    Connecting,
    /// Connected and ready
    Connected,
    /// Graceful teardown in flight
    Disconnecting,
    /// The transport failed
    #[serde(rename = "error")]
    Failed {
        /// Failure reason description
        reason: String,
    },
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnecting => f.write_str("disconnecting"),
            Self::Failed { reason } => write!(f, "error ({reason})"),
        }
    }
}

/// Feature flags a variant advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Server can stream multiple inbound messages per request
    pub streaming: bool,
    /// Server-initiated notifications are delivered
    pub notifications: bool,
    /// Server sessions survive individual requests (`Mcp-Session-Id`)
    pub sessions: bool,
    /// The transport reconnects on its own after a drop
    pub reconnect: bool,
}

/// Point-in-time counters for one transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    /// Messages written to the wire
    pub messages_sent: u64,
    /// Messages read off the wire
    pub messages_received: u64,
    /// Bytes read off the wire
    pub bytes_in: u64,
    /// Bytes written to the wire
    pub bytes_out: u64,
    /// Errors observed
    pub errors: u64,
    /// When the current connection was established
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last message moved in either direction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Lock-free counters updated with relaxed ordering; monotonic within a
/// run is the only guarantee.
#[derive(Debug, Default)]
pub struct AtomicStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
}

impl AtomicStats {
    /// Record one outbound message of `bytes` length
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_message_at.lock() = Some(Utc::now());
    }

    /// Record one inbound message of `bytes` length
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_message_at.lock() = Some(Utc::now());
    }

    /// Record an error
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Stamp the connection time
    pub fn mark_connected(&self) {
        *self.connected_at.lock() = Some(Utc::now());
    }

    /// Clear the connection time
    pub fn mark_disconnected(&self) {
        *self.connected_at.lock() = None;
    }

    /// Take a snapshot for callers
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connected_at: *self.connected_at.lock(),
            last_message_at: *self.last_message_at.lock(),
        }
    }
}

/// Transport events fanned out to subscribers
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established
    Connected,
    /// Connection ended
    Disconnected {
        /// Why the connection ended, when known
        reason: Option<String>,
    },
    /// The status machine moved
    StateChanged {
        /// New state
        state: TransportState,
    },
    /// An error occurred
    Error {
        /// The error
        error: TransportError,
    },
    /// An uncorrelated inbound message (notification or server request)
    Message {
        /// The message
        message: JsonRpcMessage,
    },
}

/// Broadcast emitter for transport events.
///
/// Lagging subscribers lose events rather than blocking the transport.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    sender: broadcast::Sender<TransportEvent>,
}

impl TransportEvents {
    /// Create an emitter with a bounded fan-out buffer
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Subscribe to events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; silently dropped when nobody listens
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for TransportEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Status storage shared by every variant: the state value plus the
/// emitter, so every transition produces exactly one `StateChanged`.
#[derive(Debug)]
pub struct StatusCell {
    state: RwLock<TransportState>,
    events: TransportEvents,
}

impl StatusCell {
    /// Create a cell starting in `Disconnected`
    pub fn new(events: TransportEvents) -> Self {
        Self {
            state: RwLock::new(TransportState::Disconnected),
            events,
        }
    }

    /// Current state
    pub fn get(&self) -> TransportState {
        self.state.read().clone()
    }

    /// Move to `next`, emitting `StateChanged` when the state actually changes
    pub fn set(&self, next: TransportState) {
        {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            *state = next.clone();
        }
        self.events.emit(TransportEvent::StateChanged { state: next });
    }
}

/// Core transport trait.
///
/// `request`/`notify` are provided on top of [`send`](Transport::send)
/// and the variant's [`RequestTracker`]; implementations only supply the
/// wire mechanics and the inbound routing.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Which variant this is
    fn transport_type(&self) -> TransportKind;

    /// Feature flags
    fn capabilities(&self) -> &TransportCapabilities;

    /// Current lifecycle state
    fn state(&self) -> TransportState;

    /// Whether the transport is connected
    fn is_connected(&self) -> bool {
        matches!(self.state(), TransportState::Connected)
    }

    /// Establish the connection
    async fn connect(&self) -> TransportResult<()>;

    /// Tear the connection down, cancelling all pending requests
    async fn disconnect(&self) -> TransportResult<()>;

    /// Write one JSON-RPC message to the wire
    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()>;

    /// The pending-request table for this transport
    fn tracker(&self) -> &RequestTracker;

    /// Per-request timeout currently in effect
    fn request_timeout(&self) -> Duration;

    /// Change the per-request timeout
    fn set_timeout(&self, timeout: Duration);

    /// Change the reconnect policy (only meaningful when
    /// `capabilities().reconnect` is set)
    fn set_retry_policy(&self, policy: RetryPolicy);

    /// Subscribe to lifecycle and message events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Counter snapshot
    fn stats(&self) -> TransportStats;

    /// Endpoint description for logs
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// Issue a request and await the correlated response.
    ///
    /// Allocates an id, registers the pending entry, sends, then waits up
    /// to [`request_timeout`](Transport::request_timeout). Every request
    /// resolves exactly once: success, RPC error, timeout, or
    /// disconnect-cancel.
    async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        let (id, rx) = self.tracker().register();
        let message = JsonRpcMessage::request(id, method, params);
        if let Err(e) = self.send(&message).await {
            self.tracker().discard(id);
            return Err(e);
        }
        self.tracker().wait(id, rx, self.request_timeout()).await
    }

    /// Send a one-way notification
    async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        self.send(&JsonRpcMessage::notification(method, params))
            .await
    }

    /// Final teardown; after this the transport must not be reused
    async fn destroy(&self) {
        let _ = self.disconnect().await;
    }
}

/// Shared inbound routing: responses resolve pending requests, anything
/// else fans out as a `Message` event. Lines that are not JSON-RPC are
/// diagnostic output and only logged.
pub(crate) fn route_inbound(
    raw: &str,
    tracker: &RequestTracker,
    events: &TransportEvents,
    stats: &AtomicStats,
) {
    match serde_json::from_str::<JsonRpcMessage>(raw) {
        Ok(JsonRpcMessage::Response(response)) => {
            stats.record_received(raw.len());
            if !tracker.resolve(response) {
                debug!("dropping response for unknown or expired request id");
            }
        }
        Ok(message) => {
            stats.record_received(raw.len());
            events.emit(TransportEvent::Message { message });
        }
        Err(_) => {
            debug!(line = raw, "ignoring non-JSON-RPC output");
        }
    }
}

/// Headers derived from the configured authentication settings.
///
/// OAuth2 acquisition happens above the transport; when the variant
/// carries a ready token it is injected exactly like a bearer token.
pub(crate) fn auth_headers(auth: &deechat_mcp_config::AuthConfig) -> Vec<(String, String)> {
    use deechat_mcp_config::AuthConfig;
    match auth {
        AuthConfig::None => Vec::new(),
        AuthConfig::Bearer { token } => {
            vec![("Authorization".to_string(), format!("Bearer {token}"))]
        }
        AuthConfig::Oauth2 { token, .. } => token
            .as_ref()
            .map(|t| vec![("Authorization".to_string(), format!("Bearer {t}"))])
            .unwrap_or_default(),
        AuthConfig::Custom { headers } => headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_matches_wire_names() {
        assert_eq!(TransportState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            TransportState::Failed {
                reason: "boom".into()
            }
            .to_string(),
            "error (boom)"
        );
    }

    #[test]
    fn status_cell_emits_once_per_transition() {
        let events = TransportEvents::new();
        let mut rx = events.subscribe();
        let cell = StatusCell::new(events);

        cell.set(TransportState::Connecting);
        cell.set(TransportState::Connecting); // no-op
        cell.set(TransportState::Connected);

        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::StateChanged {
                state: TransportState::Connecting
            }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::StateChanged {
                state: TransportState::Connected
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stats_snapshot_counts_both_directions() {
        let stats = AtomicStats::default();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_received(7);
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_out, 15);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_in, 7);
        assert_eq!(snapshot.errors, 1);
        assert!(snapshot.last_message_at.is_some());
        assert!(snapshot.connected_at.is_none());
    }

    #[test]
    fn bearer_and_custom_auth_become_headers() {
        use deechat_mcp_config::AuthConfig;
        use std::collections::HashMap;

        let bearer = auth_headers(&AuthConfig::Bearer {
            token: "tok".into(),
        });
        assert_eq!(bearer[0].1, "Bearer tok");

        let mut headers = HashMap::new();
        headers.insert("X-Api-Key".to_string(), "k".to_string());
        let custom = auth_headers(&AuthConfig::Custom { headers });
        assert_eq!(custom, vec![("X-Api-Key".to_string(), "k".to_string())]);

        assert!(auth_headers(&AuthConfig::None).is_empty());

        let pending_oauth = auth_headers(&AuthConfig::Oauth2 {
            client_id: "c".into(),
            client_secret: None,
            auth_url: "https://a".into(),
            token_url: "https://t".into(),
            scope: None,
            redirect_uri: None,
            token: None,
        });
        assert!(pending_oauth.is_empty(), "no token means no header");
    }
}
