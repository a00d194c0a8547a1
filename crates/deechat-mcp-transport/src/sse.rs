//! Legacy server-sent events transport, plus the SSE wire parser shared
//! with the streamable HTTP transport.
//!
//! Inbound messages arrive on a long-lived GET event stream; outbound
//! messages go out as HTTP POSTs. The stream may announce a dedicated
//! POST endpoint via an `endpoint` event. This transport is deprecated
//! in favor of streamable HTTP and says so on every connect.

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

/// One parsed server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// `event:` field, when present
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
    /// `id:` field, when present
    pub id: Option<String>,
}

/// Incremental SSE decoder: feed it chunks, get complete events back.
///
/// Events are separated by a blank line; `data:` lines accumulate and
/// join with newlines per the SSE specification.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let raw = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue; // comment or keep-alive
        }
        let (field, value) = match line.find(':') {
            Some(pos) => (&line[..pos], line[pos + 1..].trim_start()),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

/// Configuration for the legacy SSE transport
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Event-stream URL
    pub url: String,
    /// Extra headers (auth already merged)
    pub headers: Vec<(String, String)>,
}

impl From<&ServerConfig> for SseConfig {
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

struct SseInner {
    config: SseConfig,
    http: reqwest::Client,
    status: StatusCell,
    events: TransportEvents,
    capabilities: TransportCapabilities,
    tracker: RequestTracker,
    stats: AtomicStats,
    timeout: Mutex<Duration>,
    retry: Mutex<RetryPolicy>,
    /// POST endpoint discovered via the `endpoint` event
    post_endpoint: RwLock<Option<String>>,
    stream_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Legacy SSE transport (deprecated)
#[derive(Clone)]
pub struct SseTransport {
    inner: Arc<SseInner>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("url", &self.inner.config.url)
            .field("state", &self.inner.status.get())
            .finish()
    }
}

impl SseTransport {
    /// Create a transport for the given event-stream endpoint
    pub fn new(config: SseConfig) -> Self {
        let events = TransportEvents::new();
        Self {
            inner: Arc::new(SseInner {
                config,
                http: reqwest::Client::new(),
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
                post_endpoint: RwLock::new(None),
                stream_task: Mutex::new(None),
            }),
        }
    }

    /// Resolve the POST target: the discovered endpoint, made absolute
    /// against the stream URL when relative, or the stream URL itself.
    fn post_url(&self) -> String {
        let discovered = self.inner.post_endpoint.read().clone();
        match discovered {
            Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {
                endpoint
            }
            Some(endpoint) => match url::Url::parse(&self.inner.config.url)
                .and_then(|base| base.join(&endpoint))
            {
                Ok(joined) => joined.to_string(),
                Err(_) => self.inner.config.url.clone(),
            },
            None => self.inner.config.url.clone(),
        }
    }

    /// Long-lived stream task: connect, decode events, reconnect per the
    /// retry policy when the stream drops.
    async fn run_stream(inner: Arc<SseInner>) {
        let mut attempt = 0u32;
        loop {
            let mut request = inner
                .http
                .get(&inner.config.url)
                .header("Accept", "text/event-stream")
                .header("MCP-Protocol-Version", PROTOCOL_VERSION);
            for (name, value) in &inner.config.headers {
                request = request.header(name, value);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    attempt = 0;
                    inner.status.set(TransportState::Connected);
                    inner.stats.mark_connected();
                    inner.events.emit(TransportEvent::Connected);

                    let mut decoder = SseDecoder::default();
                    let mut stream = response.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        let Ok(chunk) = chunk else { break };
                        for event in decoder.push(&String::from_utf8_lossy(&chunk)) {
                            Self::handle_event(&inner, event);
                        }
                    }
                    debug!("SSE stream ended");
                }
                Ok(response) => {
                    inner.stats.record_error();
                    inner.events.emit(TransportEvent::Error {
                        error: TransportError::ConnectionFailed(format!(
                            "event stream returned {}",
                            response.status()
                        )),
                    });
                }
                Err(e) => {
                    inner.stats.record_error();
                    inner.events.emit(TransportEvent::Error {
                        error: TransportError::ConnectionFailed(e.to_string()),
                    });
                }
            }

            if matches!(
                inner.status.get(),
                TransportState::Disconnecting | TransportState::Disconnected
            ) {
                return;
            }
            inner.tracker.cancel_all("transport disconnected");
            inner.events.emit(TransportEvent::Disconnected {
                reason: Some("event stream dropped".to_string()),
            });
            inner.status.set(TransportState::Connecting);

            let delay = inner.retry.lock().delay(attempt);
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    warn!(url = %inner.config.url, "event stream reconnects exhausted");
                    inner.status.set(TransportState::Disconnected);
                    return;
                }
            }
            attempt += 1;
        }
    }

    fn handle_event(inner: &Arc<SseInner>, event: SseEvent) {
        match event.event.as_deref() {
            Some("endpoint") => {
                // The endpoint may be a plain string or {"uri": "..."}.
                let endpoint = if event.data.trim_start().starts_with('{') {
                    serde_json::from_str::<serde_json::Value>(&event.data)
                        .ok()
                        .and_then(|v| v.get("uri").and_then(|u| u.as_str().map(String::from)))
                } else {
                    Some(event.data.clone())
                };
                if let Some(endpoint) = endpoint {
                    info!(%endpoint, "discovered SSE message endpoint");
                    *inner.post_endpoint.write() = Some(endpoint);
                }
            }
            Some("message") | None => {
                if event.data.trim().is_empty() {
                    return; // keep-alive
                }
                route_inbound(&event.data, &inner.tracker, &inner.events, &inner.stats);
            }
            Some(other) => debug!(event = other, "ignoring unknown SSE event type"),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn transport_type(&self) -> TransportKind {
        TransportKind::Sse
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

        warn!(
            url = %inner.config.url,
            "the SSE transport is deprecated; prefer streamableHttp"
        );
        inner.status.set(TransportState::Connecting);
        let task = tokio::spawn(Self::run_stream(Arc::clone(inner)));
        *inner.stream_task.lock() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let inner = &self.inner;
        inner.status.set(TransportState::Disconnecting);
        inner.tracker.cancel_all("transport disconnected");
        if let Some(task) = inner.stream_task.lock().take() {
            task.abort();
        }
        *inner.post_endpoint.write() = None;
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

        let mut request = inner
            .http
            .post(self.post_url())
            .header("Content-Type", "application/json")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .timeout(*inner.timeout.lock())
            .body(payload.clone());
        for (name, value) in &inner.config.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
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

        inner.stats.record_sent(payload.len());
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
