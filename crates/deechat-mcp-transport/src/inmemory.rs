//! In-memory loopback transport.
//!
//! No real I/O: a process-global broker indexed by channel name carries
//! serialized messages between every transport joined to the same
//! channel. Delivery is asynchronous (next scheduler tick), so the
//! ordering and suspension behavior matches the real transports closely
//! enough for tests and for application-embedded servers.
//!
//! With `self_handle` enabled the transport also hosts a small echo
//! server on its channel: it answers `initialize`, `tools/list` (a single
//! `test-tool`), `tools/call`, `ping`, and a deliberately slow `slow-op`
//! used to exercise request timeouts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use deechat_mcp_config::{ServerConfig, TransportKind};
use deechat_mcp_protocol::{
    methods, JsonRpcError, JsonRpcMessage, JsonRpcResponse, PROTOCOL_VERSION,
};

use crate::core::{
    route_inbound, AtomicStats, StatusCell, Transport, TransportCapabilities, TransportError,
    TransportEvent, TransportEvents, TransportResult, TransportState, TransportStats,
};
use crate::correlation::RequestTracker;
use crate::retry::RetryPolicy;

/// One participant on a channel
struct Peer {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Process-global broker: channel name to joined peers
static BROKER: Lazy<DashMap<String, Vec<Peer>>> = Lazy::new(DashMap::new);
static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Register a peer on a channel, returning its id and inbox
fn join_channel(channel: &str) -> (u64, mpsc::UnboundedReceiver<String>) {
    let id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    BROKER.entry(channel.to_string()).or_default().push(Peer { id, tx });
    (id, rx)
}

/// Remove a peer; empty channels are dropped from the broker
fn leave_channel(channel: &str, peer_id: u64) {
    if let Some(mut peers) = BROKER.get_mut(channel) {
        peers.retain(|p| p.id != peer_id);
        if peers.is_empty() {
            drop(peers);
            BROKER.remove_if(channel, |_, v| v.is_empty());
        }
    }
}

/// Deliver a payload to every peer on the channel except the sender.
/// Delivery happens on the next tick, never inline.
fn deliver(channel: &str, from_peer: u64, payload: String) {
    let targets: Vec<mpsc::UnboundedSender<String>> = BROKER
        .get(channel)
        .map(|peers| {
            peers
                .iter()
                .filter(|p| p.id != from_peer)
                .map(|p| p.tx.clone())
                .collect()
        })
        .unwrap_or_default();

    for tx in targets {
        let payload = payload.clone();
        tokio::spawn(async move {
            let _ = tx.send(payload);
        });
    }
}

/// Configuration for the in-memory transport
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Broker channel to join
    pub channel: String,
    /// Host the loopback echo server on the same channel
    pub self_handle: bool,
}

impl From<&ServerConfig> for InMemoryConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            channel: config.channel.clone().unwrap_or_default(),
            self_handle: config.self_handle,
        }
    }
}

struct InMemoryInner {
    config: InMemoryConfig,
    status: StatusCell,
    events: TransportEvents,
    capabilities: TransportCapabilities,
    tracker: RequestTracker,
    stats: AtomicStats,
    timeout: Mutex<Duration>,
    peer_id: Mutex<Option<u64>>,
    loopback_peer_id: Mutex<Option<u64>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// In-memory transport over the process-global broker
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<InMemoryInner>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("channel", &self.inner.config.channel)
            .field("state", &self.inner.status.get())
            .finish()
    }
}

impl InMemoryTransport {
    /// Create a transport for the given channel
    pub fn new(config: InMemoryConfig) -> Self {
        let events = TransportEvents::new();
        Self {
            inner: Arc::new(InMemoryInner {
                config,
                status: StatusCell::new(events.clone()),
                events,
                capabilities: TransportCapabilities {
                    streaming: false,
                    notifications: true,
                    sessions: false,
                    reconnect: false,
                },
                tracker: RequestTracker::new(),
                stats: AtomicStats::default(),
                timeout: Mutex::new(Duration::from_secs(30)),
                peer_id: Mutex::new(None),
                loopback_peer_id: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn transport_type(&self) -> TransportKind {
        TransportKind::InMemory
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.inner.capabilities
    }

    fn state(&self) -> TransportState {
        self.inner.status.get()
    }

    async fn connect(&self) -> TransportResult<()> {
        let inner = &self.inner;
        if inner.config.channel.is_empty() {
            return Err(TransportError::ConfigurationError(
                "channel cannot be empty".to_string(),
            ));
        }
        match inner.status.get() {
            TransportState::Connected => return Ok(()),
            TransportState::Connecting | TransportState::Disconnecting => {
                return Err(TransportError::Internal(
                    "connect while a transition is in flight".to_string(),
                ));
            }
            TransportState::Failed { reason } => {
                return Err(TransportError::Internal(format!(
                    "transport is in error state ({reason}); disconnect first"
                )));
            }
            TransportState::Disconnected => {}
        }
        inner.status.set(TransportState::Connecting);

        let (peer_id, mut inbox) = join_channel(&inner.config.channel);
        *inner.peer_id.lock() = Some(peer_id);

        let transport = self.clone();
        let inbox_task = tokio::spawn(async move {
            while let Some(line) = inbox.recv().await {
                route_inbound(
                    &line,
                    &transport.inner.tracker,
                    &transport.inner.events,
                    &transport.inner.stats,
                );
            }
        });
        inner.tasks.lock().push(inbox_task);

        if inner.config.self_handle {
            let (loopback_id, task) = spawn_loopback_server(&inner.config.channel);
            *inner.loopback_peer_id.lock() = Some(loopback_id);
            inner.tasks.lock().push(task);
        }

        inner.status.set(TransportState::Connected);
        inner.stats.mark_connected();
        inner.events.emit(TransportEvent::Connected);
        debug!(channel = %inner.config.channel, "in-memory transport joined channel");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let inner = &self.inner;
        inner.status.set(TransportState::Disconnecting);
        inner.tracker.cancel_all("transport disconnected");

        if let Some(peer_id) = inner.peer_id.lock().take() {
            leave_channel(&inner.config.channel, peer_id);
        }
        if let Some(loopback_id) = inner.loopback_peer_id.lock().take() {
            leave_channel(&inner.config.channel, loopback_id);
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }

        inner.status.set(TransportState::Disconnected);
        inner.events.emit(TransportEvent::Disconnected {
            reason: Some("transport closed".to_string()),
        });
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        let inner = &self.inner;
        if !self.is_connected() {
            return Err(TransportError::SendFailed(format!(
                "cannot send in state: {}",
                self.state()
            )));
        }
        let peer_id = inner
            .peer_id
            .lock()
            .ok_or_else(|| TransportError::ConnectionLost("not joined to a channel".to_string()))?;

        let payload = serde_json::to_string(message)
            .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
        inner.stats.record_sent(payload.len());
        deliver(&inner.config.channel, peer_id, payload);
        Ok(())
    }

    fn tracker(&self) -> &RequestTracker {
        &self.inner.tracker
    }

    fn request_timeout(&self) -> Duration {
        *self.inner.timeout.lock()
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock() = timeout;
    }

    fn set_retry_policy(&self, _policy: RetryPolicy) {
        // No wire to lose; nothing to reconnect.
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("inmemory:{}", self.inner.config.channel))
    }
}

/// Host the loopback echo server as an extra peer on `channel`.
fn spawn_loopback_server(channel: &str) -> (u64, tokio::task::JoinHandle<()>) {
    let (peer_id, mut inbox) = join_channel(channel);
    let channel = channel.to_string();

    let task = tokio::spawn(async move {
        while let Some(line) = inbox.recv().await {
            let Ok(JsonRpcMessage::Request(request)) = serde_json::from_str(&line) else {
                // Notifications and responses need no answer.
                continue;
            };

            let response = match request.method.as_str() {
                methods::INITIALIZE => JsonRpcResponse::success(
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "inmemory-loopback", "version": "1.0.0"}
                    }),
                    request.id,
                ),
                methods::TOOLS_LIST => JsonRpcResponse::success(
                    json!({
                        "tools": [{
                            "name": "test-tool",
                            "description": "Echoes its input back, prefixed",
                            "inputSchema": {
                                "type": "object",
                                "properties": {"input": {"type": "string"}},
                                "required": ["input"]
                            }
                        }]
                    }),
                    request.id,
                ),
                methods::TOOLS_CALL => {
                    let params = request.params.unwrap_or(Value::Null);
                    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                    if name == "test-tool" {
                        let input = params
                            .pointer("/arguments/input")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        JsonRpcResponse::success(
                            json!({"toolResult": format!("Processed: {input}")}),
                            request.id,
                        )
                    } else {
                        JsonRpcResponse::error(
                            JsonRpcError::invalid_params(format!("unknown tool: {name}")),
                            request.id,
                        )
                    }
                }
                methods::RESOURCES_LIST => JsonRpcResponse::success(
                    json!({
                        "resources": [{
                            "uri": "memory://greeting",
                            "name": "greeting",
                            "mimeType": "text/plain"
                        }]
                    }),
                    request.id,
                ),
                methods::RESOURCES_READ => {
                    let uri = request
                        .params
                        .as_ref()
                        .and_then(|p| p.get("uri"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if uri == "memory://greeting" {
                        JsonRpcResponse::success(
                            json!({
                                "contents": [{"uri": uri, "text": "hello from memory"}]
                            }),
                            request.id,
                        )
                    } else {
                        JsonRpcResponse::error(
                            JsonRpcError::invalid_params(format!("unknown resource: {uri}")),
                            request.id,
                        )
                    }
                }
                methods::PING => JsonRpcResponse::success(json!({}), request.id),
                "slow-op" => {
                    let delay = request
                        .params
                        .as_ref()
                        .and_then(|p| p.get("delay"))
                        .and_then(Value::as_u64)
                        .unwrap_or(1000);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    JsonRpcResponse::success(json!({"done": true}), request.id)
                }
                other => {
                    JsonRpcResponse::error(JsonRpcError::method_not_found(other), request.id)
                }
            };

            match serde_json::to_string(&JsonRpcMessage::Response(response)) {
                Ok(payload) => deliver(&channel, peer_id, payload),
                Err(e) => debug!(error = %e, "loopback response serialization failed"),
            }
        }
    });

    (peer_id, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn loopback(channel: &str) -> InMemoryTransport {
        InMemoryTransport::new(InMemoryConfig {
            channel: channel.to_string(),
            self_handle: true,
        })
    }

    #[tokio::test]
    #[serial]
    async fn loopback_answers_initialize_and_ping() {
        let transport = loopback("t-init");
        transport.connect().await.unwrap();

        let init = transport
            .request(methods::INITIALIZE, Some(json!({})))
            .await
            .unwrap();
        assert_eq!(init["serverInfo"]["name"], "inmemory-loopback");
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);

        let pong = transport.request(methods::PING, None).await.unwrap();
        assert_eq!(pong, json!({}));

        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn loopback_lists_and_calls_test_tool() {
        let transport = loopback("t-tools");
        transport.connect().await.unwrap();

        let tools = transport.request(methods::TOOLS_LIST, None).await.unwrap();
        assert_eq!(tools["tools"][0]["name"], "test-tool");

        let result = transport
            .request(
                methods::TOOLS_CALL,
                Some(json!({"name": "test-tool", "arguments": {"input": "hi"}})),
            )
            .await
            .unwrap();
        assert_eq!(result["toolResult"], "Processed: hi");

        let err = transport
            .request(methods::TOOLS_CALL, Some(json!({"name": "bogus"})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: -32602, .. }));

        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn slow_op_times_out_and_releases_the_pending_entry() {
        let transport = loopback("t-slow");
        transport.connect().await.unwrap();
        transport.set_timeout(Duration::from_millis(100));

        let before = transport.tracker().len();
        let err = transport
            .request("slow-op", Some(json!({"delay": 1000})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert_eq!(transport.tracker().len(), before);

        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn two_transports_on_one_channel_exchange_messages() {
        let a = InMemoryTransport::new(InMemoryConfig {
            channel: "t-pair".into(),
            self_handle: false,
        });
        let b = InMemoryTransport::new(InMemoryConfig {
            channel: "t-pair".into(),
            self_handle: false,
        });
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let mut b_events = b.subscribe();
        a.notify("hello", Some(json!({"n": 1}))).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(TransportEvent::Message { message }) = b_events.recv().await {
                    break message;
                }
            }
        })
        .await
        .expect("delivery");
        assert_eq!(message.method(), Some("hello"));

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn disconnect_leaves_the_channel() {
        let transport = loopback("t-leave");
        transport.connect().await.unwrap();
        assert!(BROKER.contains_key("t-leave"));
        transport.disconnect().await.unwrap();
        assert!(!BROKER.contains_key("t-leave"));
    }
}
