//! WebSocket transport.
//!
//! One JSON-RPC message per text frame. A driver task owns the socket:
//! it is the single stream consumer, answers protocol pings, sends a
//! keep-alive ping every 30 seconds, and - when `auto_reconnect` is set -
//! re-establishes dropped connections with exponential backoff. While a
//! reconnect is in flight, outbound notifications buffer into a bounded
//! queue (oldest dropped first); requests fail fast.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use deechat_mcp_config::{ServerConfig, TransportKind};
use deechat_mcp_protocol::JsonRpcMessage;

use crate::core::{
    auth_headers, route_inbound, AtomicStats, StatusCell, Transport, TransportCapabilities,
    TransportError, TransportEvent, TransportEvents, TransportResult, TransportState,
    TransportStats,
};
use crate::correlation::RequestTracker;
use crate::retry::RetryPolicy;

/// Keep-alive ping cadence
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Bounded buffer for notifications queued across a reconnect
const RECONNECT_QUEUE_LIMIT: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the WebSocket transport
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Endpoint URL (`ws://` or `wss://`)
    pub url: String,
    /// Extra headers for the upgrade request (auth already merged)
    pub headers: Vec<(String, String)>,
    /// Reconnect automatically after a close frame or read error
    pub auto_reconnect: bool,
}

impl From<&ServerConfig> for WebSocketConfig {
    fn from(config: &ServerConfig) -> Self {
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.extend(auth_headers(&config.auth));
        Self {
            url: config.url.clone().unwrap_or_default(),
            headers,
            auto_reconnect: config.auto_reconnect,
        }
    }
}

struct WsInner {
    config: WebSocketConfig,
    status: StatusCell,
    events: TransportEvents,
    capabilities: TransportCapabilities,
    tracker: RequestTracker,
    stats: AtomicStats,
    timeout: Mutex<Duration>,
    retry: Mutex<RetryPolicy>,
    /// Sender into the current connection epoch's writer; absent while
    /// disconnected or reconnecting
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    /// Notifications queued while a reconnect is in flight
    queued: Mutex<VecDeque<String>>,
    /// Set after the first successful connect; gates queueing
    was_connected: AtomicBool,
    shutdown: broadcast::Sender<()>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// WebSocket transport
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.inner.config.url)
            .field("state", &self.inner.status.get())
            .finish()
    }
}

impl WebSocketTransport {
    /// Create a transport for the given endpoint
    pub fn new(config: WebSocketConfig) -> Self {
        let events = TransportEvents::new();
        let (shutdown, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(WsInner {
                config,
                status: StatusCell::new(events.clone()),
                events,
                capabilities: TransportCapabilities {
                    streaming: true,
                    notifications: true,
                    sessions: false,
                    reconnect: true,
                },
                tracker: RequestTracker::new(),
                stats: AtomicStats::default(),
                timeout: Mutex::new(Duration::from_secs(30)),
                retry: Mutex::new(RetryPolicy::default()),
                outbound: Mutex::new(None),
                queued: Mutex::new(VecDeque::new()),
                was_connected: AtomicBool::new(false),
                shutdown,
                driver: Mutex::new(None),
            }),
        }
    }

    async fn establish(config: &WebSocketConfig) -> TransportResult<WsStream> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(format!("bad url: {e}")))?;
        for (name, value) in &config.headers {
            let name: tokio_tungstenite::tungstenite::http::HeaderName = name
                .parse()
                .map_err(|_| TransportError::ConfigurationError(format!("bad header: {name}")))?;
            let value = value
                .parse()
                .map_err(|_| TransportError::ConfigurationError(format!("bad value for header {name:?}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(stream)
    }

    /// One connection epoch: pump frames until the socket drops or a
    /// shutdown arrives. Returns `true` when shutdown ended the epoch.
    async fn run_epoch(
        inner: &Arc<WsInner>,
        ws: WsStream,
        ready: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> bool {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

        // Single producer onto the socket.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if sink.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        *inner.outbound.lock() = Some(out_tx.clone());
        inner.status.set(TransportState::Connected);
        inner.stats.mark_connected();
        inner.was_connected.store(true, Ordering::Relaxed);
        inner.events.emit(TransportEvent::Connected);
        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        // Flush notifications queued during the reconnect window.
        let queued: Vec<String> = inner.queued.lock().drain(..).collect();
        for payload in queued {
            let _ = out_tx.send(Message::text(payload)).await;
        }

        let mut shutdown_rx = inner.shutdown.subscribe();
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // first tick fires immediately

        let ended_by_shutdown = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = out_tx.send(Message::Close(None)).await;
                    break true;
                }
                _ = ping_timer.tick() => {
                    if out_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break false;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        route_inbound(text.as_str(), &inner.tracker, &inner.events, &inner.stats);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = out_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Liveness confirmed.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server sent close frame");
                        break false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        inner.stats.record_error();
                        inner.events.emit(TransportEvent::Error {
                            error: TransportError::ConnectionLost(e.to_string()),
                        });
                        break false;
                    }
                    None => break false,
                }
            }
        };

        *inner.outbound.lock() = None;
        writer.abort();
        ended_by_shutdown
    }

    /// Driver task: runs epochs and, between them, the backoff loop.
    async fn drive(
        inner: Arc<WsInner>,
        first: WsStream,
        ready: tokio::sync::oneshot::Sender<()>,
    ) {
        let mut ws = first;
        let mut ready = Some(ready);
        let mut shutdown_rx = inner.shutdown.subscribe();
        loop {
            let ended_by_shutdown = Self::run_epoch(&inner, ws, ready.take()).await;
            inner.tracker.cancel_all("transport disconnected");

            let disconnecting = ended_by_shutdown
                || matches!(
                    inner.status.get(),
                    TransportState::Disconnecting | TransportState::Disconnected
                );
            if disconnecting {
                inner.status.set(TransportState::Disconnected);
                inner.events.emit(TransportEvent::Disconnected {
                    reason: Some("transport closed".to_string()),
                });
                return;
            }

            inner.events.emit(TransportEvent::Disconnected {
                reason: Some("connection dropped".to_string()),
            });
            if !inner.config.auto_reconnect {
                inner.status.set(TransportState::Disconnected);
                return;
            }

            // Backoff loop; one error event per failed attempt.
            inner.status.set(TransportState::Connecting);
            let policy = inner.retry.lock().clone();
            let mut attempt = 0u32;
            ws = loop {
                let Some(delay) = policy.delay(attempt) else {
                    warn!(url = %inner.config.url, "reconnect attempts exhausted");
                    inner.status.set(TransportState::Failed {
                        reason: "reconnect attempts exhausted".to_string(),
                    });
                    inner.status.set(TransportState::Disconnected);
                    return;
                };
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        inner.status.set(TransportState::Disconnected);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if matches!(
                    inner.status.get(),
                    TransportState::Disconnecting | TransportState::Disconnected
                ) {
                    return;
                }
                match Self::establish(&inner.config).await {
                    Ok(stream) => {
                        info!(url = %inner.config.url, attempt, "websocket reconnected");
                        break stream;
                    }
                    Err(e) => {
                        inner.stats.record_error();
                        inner.events.emit(TransportEvent::Error { error: e });
                        attempt += 1;
                    }
                }
            };
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn transport_type(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.inner.capabilities
    }

    fn state(&self) -> TransportState {
        self.inner.status.get()
    }

    async fn connect(&self) -> TransportResult<()> {
        let inner = &self.inner;
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

        // The initial connect does not retry; the orchestrator owns that.
        match Self::establish(&inner.config).await {
            Ok(stream) => {
                let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
                let driver = tokio::spawn(Self::drive(Arc::clone(inner), stream, ready_tx));
                *inner.driver.lock() = Some(driver);
                // Wait for the writer to be installed so a send issued
                // right after connect() cannot race the driver.
                let _ = ready_rx.await;
                Ok(())
            }
            Err(e) => {
                inner.stats.record_error();
                inner.status.set(TransportState::Failed {
                    reason: e.to_string(),
                });
                inner.events.emit(TransportEvent::Error { error: e.clone() });
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let inner = &self.inner;
        inner.status.set(TransportState::Disconnecting);
        inner.tracker.cancel_all("transport disconnected");
        let _ = inner.shutdown.send(());

        let driver = inner.driver.lock().take();
        if let Some(driver) = driver {
            // Give the driver a moment to close cleanly, then drop it.
            if tokio::time::timeout(Duration::from_secs(2), driver).await.is_err() {
                debug!("websocket driver did not finish in time");
            }
        }
        inner.queued.lock().clear();
        inner.status.set(TransportState::Disconnected);
        inner.events.emit(TransportEvent::Disconnected {
            reason: Some("transport closed".to_string()),
        });
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        let inner = &self.inner;
        let payload = serde_json::to_string(message)
            .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;

        let sender = inner.outbound.lock().clone();
        if let Some(sender) = sender {
            let bytes = payload.len();
            sender
                .send(Message::text(payload))
                .await
                .map_err(|_| TransportError::ConnectionLost("socket writer gone".to_string()))?;
            inner.stats.record_sent(bytes);
            return Ok(());
        }

        // Disconnected-but-reconnecting: buffer notifications, never
        // pending-response requests.
        let reconnecting = inner.config.auto_reconnect
            && inner.was_connected.load(Ordering::Relaxed)
            && matches!(inner.status.get(), TransportState::Connecting);
        if reconnecting && message.is_notification() {
            let mut queued = inner.queued.lock();
            if queued.len() >= RECONNECT_QUEUE_LIMIT {
                queued.pop_front();
            }
            queued.push_back(payload);
            return Ok(());
        }

        Err(TransportError::SendFailed(format!(
            "cannot send in state: {}",
            self.state()
        )))
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

    fn set_retry_policy(&self, policy: RetryPolicy) {
        *self.inner.retry.lock() = policy;
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.inner.config.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(url: &str) -> WebSocketConfig {
        WebSocketConfig {
            url: url.to_string(),
            headers: vec![],
            auto_reconnect: false,
        }
    }

    #[tokio::test]
    async fn refused_connection_fails_and_enters_error_state() {
        // Port 9 (discard) is virtually never listening.
        let transport = WebSocketTransport::new(test_config("ws://127.0.0.1:9/mcp"));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(matches!(transport.state(), TransportState::Failed { .. }));

        // Error state clears through disconnect.
        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_fast() {
        let transport = WebSocketTransport::new(test_config("ws://127.0.0.1:9/mcp"));
        let err = transport
            .send(&JsonRpcMessage::notification("x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }

    #[tokio::test]
    async fn queue_drops_oldest_notification_on_overflow() {
        let transport = WebSocketTransport::new(WebSocketConfig {
            url: "ws://127.0.0.1:9/mcp".into(),
            headers: vec![],
            auto_reconnect: true,
        });
        // Simulate the reconnect window.
        transport.inner.was_connected.store(true, Ordering::Relaxed);
        transport.inner.status.set(TransportState::Connecting);

        for i in 0..(RECONNECT_QUEUE_LIMIT + 5) {
            transport
                .send(&JsonRpcMessage::notification(
                    "n",
                    Some(serde_json::json!({"i": i})),
                ))
                .await
                .unwrap();
        }
        let queued = transport.inner.queued.lock();
        assert_eq!(queued.len(), RECONNECT_QUEUE_LIMIT);
        // The oldest entries were dropped first.
        assert!(queued.front().unwrap().contains("\"i\":5"));
    }

    #[tokio::test]
    async fn requests_fail_fast_during_reconnect() {
        let transport = WebSocketTransport::new(WebSocketConfig {
            url: "ws://127.0.0.1:9/mcp".into(),
            headers: vec![],
            auto_reconnect: true,
        });
        transport.inner.was_connected.store(true, Ordering::Relaxed);
        transport.inner.status.set(TransportState::Connecting);

        let err = transport
            .send(&JsonRpcMessage::request(1, "tools/list", None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }
}
