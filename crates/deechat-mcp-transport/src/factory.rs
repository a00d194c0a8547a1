//! Transport factory.
//!
//! The single place aware of every variant. `create` runs generic config
//! validation, the per-variant validator, the builder, and then applies
//! the common knobs (request timeout, retry policy) and hooks a logging
//! bridge onto the transport's error and state-change events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use deechat_mcp_config::{ServerConfig, TransportKind};

use crate::core::{Transport, TransportError, TransportEvent, TransportResult};
use crate::inmemory::{InMemoryConfig, InMemoryTransport};
use crate::retry::RetryPolicy;
use crate::sse::{SseConfig, SseTransport};
use crate::stdio::{StdioConfig, StdioTransport};
use crate::streamable_http::{StreamableHttpConfig, StreamableHttpTransport};
use crate::websocket::{WebSocketConfig, WebSocketTransport};

type Validator = fn(&ServerConfig) -> TransportResult<()>;
type Builder = fn(&ServerConfig) -> TransportResult<Arc<dyn Transport>>;

struct VariantEntry {
    description: &'static str,
    validate: Validator,
    build: Builder,
}

/// Registry of transport variants
pub struct TransportFactory {
    entries: HashMap<TransportKind, VariantEntry>,
}

impl std::fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactory")
            .field("variants", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory {
    /// A factory with all five variants registered
    pub fn new() -> Self {
        let mut entries: HashMap<TransportKind, VariantEntry> = HashMap::new();

        entries.insert(
            TransportKind::Stdio,
            VariantEntry {
                description: "child process over stdio",
                validate: validate_stdio,
                build: |config| Ok(Arc::new(StdioTransport::new(StdioConfig::from(config)))),
            },
        );
        entries.insert(
            TransportKind::Websocket,
            VariantEntry {
                description: "websocket",
                validate: validate_websocket,
                build: |config| {
                    Ok(Arc::new(WebSocketTransport::new(WebSocketConfig::from(
                        config,
                    ))))
                },
            },
        );
        entries.insert(
            TransportKind::StreamableHttp,
            VariantEntry {
                description: "streamable HTTP",
                validate: validate_http,
                build: |config| {
                    Ok(Arc::new(StreamableHttpTransport::new(
                        StreamableHttpConfig::from(config),
                    )))
                },
            },
        );
        entries.insert(
            TransportKind::Sse,
            VariantEntry {
                description: "server-sent events (deprecated)",
                validate: validate_http,
                build: |config| Ok(Arc::new(SseTransport::new(SseConfig::from(config)))),
            },
        );
        entries.insert(
            TransportKind::InMemory,
            VariantEntry {
                description: "in-memory loopback",
                validate: validate_inmemory,
                build: |config| {
                    Ok(Arc::new(InMemoryTransport::new(InMemoryConfig::from(
                        config,
                    ))))
                },
            },
        );

        Self { entries }
    }

    /// Build a transport for a server config
    pub fn create(&self, config: &ServerConfig) -> TransportResult<Arc<dyn Transport>> {
        config
            .validate()
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

        let entry = self.entries.get(&config.transport).ok_or_else(|| {
            TransportError::NotAvailable(format!("unsupported transport: {}", config.transport))
        })?;
        (entry.validate)(config)?;
        let transport = (entry.build)(config)?;

        transport.set_timeout(Duration::from_millis(config.timeout_ms));
        transport.set_retry_policy(RetryPolicy::from(&config.retry));
        bridge_logging(&transport, &config.id);

        debug!(
            server_id = %config.id,
            transport = %config.transport,
            "built transport ({})",
            entry.description
        );
        Ok(transport)
    }

    /// Variants this factory can build
    pub fn supported(&self) -> Vec<TransportKind> {
        self.entries.keys().copied().collect()
    }

    /// Human description of a variant
    pub fn description(&self, kind: TransportKind) -> Option<&'static str> {
        self.entries.get(&kind).map(|e| e.description)
    }
}

/// Forward transport errors and state changes into the log stream.
fn bridge_logging(transport: &Arc<dyn Transport>, server_id: &str) {
    let mut events = transport.subscribe();
    let server_id = server_id.to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Error { error }) => {
                    warn!(server_id = %server_id, error = %error, "transport error");
                }
                Ok(TransportEvent::StateChanged { state }) => {
                    debug!(server_id = %server_id, state = %state, "transport state changed");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn validate_stdio(config: &ServerConfig) -> TransportResult<()> {
    if config.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
        return Err(TransportError::ConfigurationError(
            "stdio transport requires a command".to_string(),
        ));
    }
    Ok(())
}

fn validate_websocket(config: &ServerConfig) -> TransportResult<()> {
    let url = require_url(config)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::ConfigurationError(format!(
            "websocket transport requires a ws:// or wss:// url, got '{}'",
            url.scheme()
        )));
    }
    Ok(())
}

fn validate_http(config: &ServerConfig) -> TransportResult<()> {
    let url = require_url(config)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TransportError::ConfigurationError(format!(
            "HTTP transports require an http:// or https:// url, got '{}'",
            url.scheme()
        )));
    }
    Ok(())
}

fn validate_inmemory(config: &ServerConfig) -> TransportResult<()> {
    if config.channel.as_deref().is_none_or(|c| c.trim().is_empty()) {
        return Err(TransportError::ConfigurationError(
            "inMemory transport requires a channel".to_string(),
        ));
    }
    Ok(())
}

fn require_url(config: &ServerConfig) -> TransportResult<url::Url> {
    let raw = config.url.as_deref().ok_or_else(|| {
        TransportError::ConfigurationError("network transport requires a url".to_string())
    })?;
    url::Url::parse(raw)
        .map_err(|e| TransportError::ConfigurationError(format!("malformed url '{raw}': {e}")))
}

/// Guess the transport variant from an endpoint URL.
///
/// `ws(s)` maps to websocket; `http(s)` maps to streamable HTTP unless
/// the path ends with `/sse` or `/events`, which marks a legacy SSE
/// endpoint. Anything else is unknown.
pub fn detect_protocol_type(url: &str) -> Option<TransportKind> {
    let parsed = url::Url::parse(url).ok()?;
    match parsed.scheme() {
        "ws" | "wss" => Some(TransportKind::Websocket),
        "http" | "https" => {
            let path = parsed.path().trim_end_matches('/');
            if path.ends_with("/sse") || path.ends_with("/events") {
                Some(TransportKind::Sse)
            } else {
                Some(TransportKind::StreamableHttp)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deechat_mcp_config::ServerConfig;

    #[tokio::test]
    async fn builds_each_variant() {
        let factory = TransportFactory::new();

        let stdio = ServerConfig::new("s", TransportKind::Stdio).with_command("cat");
        assert_eq!(
            factory.create(&stdio).unwrap().transport_type(),
            TransportKind::Stdio
        );

        let ws = ServerConfig::new("w", TransportKind::Websocket).with_url("wss://host/mcp");
        assert_eq!(
            factory.create(&ws).unwrap().transport_type(),
            TransportKind::Websocket
        );

        let http =
            ServerConfig::new("h", TransportKind::StreamableHttp).with_url("https://host/mcp");
        assert_eq!(
            factory.create(&http).unwrap().transport_type(),
            TransportKind::StreamableHttp
        );

        let sse = ServerConfig::new("e", TransportKind::Sse).with_url("https://host/events");
        assert_eq!(
            factory.create(&sse).unwrap().transport_type(),
            TransportKind::Sse
        );

        let mem = ServerConfig::new("m", TransportKind::InMemory).with_channel("c");
        assert_eq!(
            factory.create(&mem).unwrap().transport_type(),
            TransportKind::InMemory
        );
    }

    #[tokio::test]
    async fn create_applies_timeout_from_config() {
        let factory = TransportFactory::new();
        let mut config = ServerConfig::new("m", TransportKind::InMemory).with_channel("c");
        config.timeout_ms = 1234;
        let transport = factory.create(&config).unwrap();
        assert_eq!(transport.request_timeout(), Duration::from_millis(1234));
    }

    #[tokio::test]
    async fn invalid_configs_are_rejected_before_build() {
        let factory = TransportFactory::new();

        let no_command = ServerConfig::new("s", TransportKind::Stdio);
        assert!(matches!(
            factory.create(&no_command).unwrap_err(),
            TransportError::ConfigurationError(_)
        ));

        let bad_scheme = ServerConfig::new("w", TransportKind::Websocket).with_url("https://x");
        assert!(factory.create(&bad_scheme).is_err());
    }

    #[test]
    fn protocol_detection_matches_contract() {
        assert_eq!(
            detect_protocol_type("wss://x/y"),
            Some(TransportKind::Websocket)
        );
        assert_eq!(detect_protocol_type("ws://x"), Some(TransportKind::Websocket));
        assert_eq!(
            detect_protocol_type("https://x/events"),
            Some(TransportKind::Sse)
        );
        assert_eq!(
            detect_protocol_type("http://x/api/sse"),
            Some(TransportKind::Sse)
        );
        assert_eq!(
            detect_protocol_type("https://x/y"),
            Some(TransportKind::StreamableHttp)
        );
        assert_eq!(detect_protocol_type("ftp://x"), None);
        assert_eq!(detect_protocol_type("not a url"), None);
    }

    #[test]
    fn factory_lists_all_variants() {
        let factory = TransportFactory::new();
        let mut supported = factory.supported();
        supported.sort_by_key(|k| format!("{k}"));
        assert_eq!(supported.len(), 5);
        assert!(factory.description(TransportKind::Sse).unwrap().contains("deprecated"));
    }
}
