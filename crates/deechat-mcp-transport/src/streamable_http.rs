//! Streamable HTTP transport.
//!
//! Outbound messages are HTTP POSTs with
//! `Accept: application/json, text/event-stream`. The server may answer a
//! POST inline (JSON body) or stream the answer as SSE events; a
//! companion GET event stream carries server-initiated messages. Session
//! continuity rides on the `Mcp-Session-Id` header the server hands out
//! during `initialize`; every request mirrors the protocol revision in
//! `MCP-Protocol-Version`, and disconnect sends a `DELETE` with the
//! session header to end the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use deechat_mcp_config::{ServerConfig, TransportKind};
use deechat_mcp_protocol::{JsonRpcMessage, PROTOCOL_VERSION};

use crate::core::{
    auth_headers, route_inbound, AtomicStats, StatusCell, Transport, TransportCapabilities,
    TransportError, TransportEvent, TransportEvents, TransportResult, TransportState,
    TransportStats,
};
use crate::correlation::RequestTracker;
use crate::retry::RetryPolicy;
use crate::sse::SseDecoder;

/// Session header exchanged with the server
const SESSION_HEADER: &str = "Mcp-Session-Id";
/// Protocol revision header sent on every request
const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";

/// Configuration for the streamable HTTP transport
#[derive(Debug, Clone)]
pub struct StreamableHttpConfig {
    /// MCP endpoint URL
    pub url: String,
    /// Extra headers (auth already merged)
    pub headers: Vec<(String, String)>,
}

impl From<&ServerConfig> for StreamableHttpConfig {
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
        }
    }
}

struct HttpInner {
    config: StreamableHttpConfig,
    http: reqwest::Client,
    status: StatusCell,
    events: TransportEvents,
    capabilities: TransportCapabilities,
    tracker: RequestTracker,
    stats: AtomicStats,
    timeout: Mutex<Duration>,
    retry: Mutex<RetryPolicy>,
    session_id: RwLock<Option<String>>,
    last_event_id: RwLock<Option<String>>,
    stream_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HttpInner {
    fn apply_common_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request.header(PROTOCOL_HEADER, PROTOCOL_VERSION);
        if let Some(session) = self.session_id.read().as_deref() {
            request = request.header(SESSION_HEADER, session);
        }
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        request
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(session) {
                info!(session_id = session, "received MCP session id");
                *current = Some(session.to_string());
            }
        }
    }
}

/// Streamable HTTP transport
#[derive(Clone)]
pub struct StreamableHttpTransport {
    inner: Arc<HttpInner>,
}

impl std::fmt::Debug for StreamableHttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpTransport")
            .field("url", &self.inner.config.url)
            .field("state", &self.inner.status.get())
            .finish()
    }
}

impl StreamableHttpTransport {
    /// Create a transport for the given endpoint
    pub fn new(config: StreamableHttpConfig) -> Self {
        let events = TransportEvents::new();
        Self {
            inner: Arc::new(HttpInner {
                config,
                http: reqwest::Client::new(),
                status: StatusCell::new(events.clone()),
                events,
                capabilities: TransportCapabilities {
                    streaming: true,
                    notifications: true,
                    sessions: true,
                    reconnect: true,
                },
                tracker: RequestTracker::new(),
                stats: AtomicStats::default(),
                timeout: Mutex::new(Duration::from_secs(30)),
                retry: Mutex::new(RetryPolicy::default()),
                session_id: RwLock::new(None),
                last_event_id: RwLock::new(None),
                stream_task: Mutex::new(None),
            }),
        }
    }

    /// Current session id, if the server assigned one
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    /// Companion GET event stream for server-initiated messages, with
    /// reconnect per the retry policy and `Last-Event-ID` resumption.
    async fn run_event_stream(inner: Arc<HttpInner>) {
        let mut attempt = 0u32;
        loop {
            if matches!(
                inner.status.get(),
                TransportState::Disconnecting | TransportState::Disconnected
            ) {
                return;
            }

            let mut request = inner
                .http
                .get(&inner.config.url)
                .header("Accept", "text/event-stream");
            request = inner.apply_common_headers(request);
            if let Some(last) = inner.last_event_id.read().as_deref() {
                request = request.header("Last-Event-ID", last);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    attempt = 0;
                    inner.capture_session(&response);
                    debug!("companion event stream established");

                    let mut decoder = SseDecoder::default();
                    let mut stream = response.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        let Ok(chunk) = chunk else { break };
                        for event in decoder.push(&String::from_utf8_lossy(&chunk)) {
                            if let Some(id) = &event.id {
                                *inner.last_event_id.write() = Some(id.clone());
                            }
                            if event.data.trim().is_empty() {
                                continue;
                            }
                            route_inbound(&event.data, &inner.tracker, &inner.events, &inner.stats);
                        }
                    }
                    debug!("companion event stream ended");
                }
                Ok(response) => {
                    // Many servers only open the GET stream after the
                    // session exists; treat failures as retryable noise.
                    debug!(status = %response.status(), "companion event stream unavailable");
                }
                Err(e) => {
                    debug!(error = %e, "companion event stream connect failed");
                }
            }

            let delay = inner.retry.lock().delay(attempt);
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    warn!(url = %inner.config.url, "companion event stream gave up reconnecting");
                    return;
                }
            }
            attempt += 1;
        }
    }

    /// Drain an SSE-streamed POST response inline so answers are routed
    /// before `send` returns.
    async fn drain_post_stream(inner: &Arc<HttpInner>, response: reqwest::Response) {
        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            for event in decoder.push(&String::from_utf8_lossy(&chunk)) {
                if let Some(id) = &event.id {
                    *inner.last_event_id.write() = Some(id.clone());
                }
                if event.data.trim().is_empty() {
                    continue;
                }
                route_inbound(&event.data, &inner.tracker, &inner.events, &inner.stats);
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn transport_type(&self) -> TransportKind {
        TransportKind::StreamableHttp
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

        let task = tokio::spawn(Self::run_event_stream(Arc::clone(inner)));
        *inner.stream_task.lock() = Some(task);

        // POST carries the request/response traffic; the transport is
        // usable as soon as the companion stream is being established.
        inner.status.set(TransportState::Connected);
        inner.stats.mark_connected();
        inner.events.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let inner = &self.inner;
        inner.status.set(TransportState::Disconnecting);
        inner.tracker.cancel_all("transport disconnected");

        if let Some(task) = inner.stream_task.lock().take() {
            task.abort();
        }

        // Terminate the server-side session.
        let session = inner.session_id.read().clone();
        if let Some(session) = session {
            let request = inner
                .http
                .delete(&inner.config.url)
                .header(SESSION_HEADER, &session)
                .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
                .timeout(Duration::from_secs(5));
            if let Err(e) = request.send().await {
                debug!(error = %e, "session DELETE failed");
            }
            *inner.session_id.write() = None;
        }
        *inner.last_event_id.write() = None;

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

        let payload = serde_json::to_string(message)
            .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;

        let mut request = inner
            .http
            .post(&inner.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .timeout(*inner.timeout.lock())
            .body(payload.clone());
        request = inner.apply_common_headers(request);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_connect() {
                TransportError::ConnectionFailed(e.to_string())
            } else {
                TransportError::SendFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::AuthenticationFailed(format!(
                "server returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(TransportError::SendFailed(format!(
                "POST returned {status}"
            )));
        }

        inner.capture_session(&response);
        inner.stats.record_sent(payload.len());

        // 202 Accepted: notification taken, no body follows.
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.contains("application/json") {
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
            if !body.is_empty() {
                route_inbound(
                    &String::from_utf8_lossy(&body),
                    &inner.tracker,
                    &inner.events,
                    &inner.stats,
                );
            }
        } else if content_type.contains("text/event-stream") {
            Self::drain_post_stream(inner, response).await;
        }

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

    fn test_transport() -> StreamableHttpTransport {
        StreamableHttpTransport::new(StreamableHttpConfig {
            url: "http://127.0.0.1:9/mcp".into(),
            headers: vec![],
        })
    }

    #[tokio::test]
    async fn advertises_sessions_and_streaming() {
        let transport = test_transport();
        let caps = transport.capabilities();
        assert!(caps.sessions);
        assert!(caps.streaming);
        assert!(caps.reconnect);
        assert_eq!(transport.transport_type(), TransportKind::StreamableHttp);
    }

    #[tokio::test]
    async fn send_before_connect_fails_fast() {
        let transport = test_transport();
        let err = transport
            .send(&JsonRpcMessage::notification("x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }

    #[tokio::test]
    async fn unreachable_server_surfaces_connection_failed() {
        let transport = test_transport();
        transport.connect().await.unwrap();

        let err = transport
            .send(&JsonRpcMessage::request(1, "ping", None))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                TransportError::ConnectionFailed(_) | TransportError::SendFailed(_)
            ),
            "got {err:?}"
        );

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn session_starts_absent() {
        let transport = test_transport();
        assert!(transport.session_id().is_none());
    }
}
