//! # DeeChat MCP Transport
//!
//! Multi-protocol transport layer for MCP communications.
//!
//! Five wire mechanisms hide behind one [`Transport`] contract:
//!
//! - [`stdio::StdioTransport`] - child process, newline-delimited JSON
//! - [`websocket::WebSocketTransport`] - one message per text frame
//! - [`streamable_http::StreamableHttpTransport`] - HTTP POST plus a
//!   companion SSE stream, with `Mcp-Session-Id` session continuity
//! - [`sse::SseTransport`] - the legacy SSE transport (deprecated)
//! - [`inmemory::InMemoryTransport`] - process-local loopback broker
//!
//! Request/response correlation is owned by the transport: every variant
//! carries a [`RequestTracker`] that allocates monotonically increasing
//! integer ids, holds the pending table, and enforces per-request
//! timeouts. The [`factory::TransportFactory`] is the only place aware of
//! all variants; everything above it sees `Arc<dyn Transport>`.

pub mod core;
pub mod correlation;
pub mod factory;
pub mod inmemory;
pub mod retry;
pub mod sse;
pub mod stdio;
pub mod streamable_http;
pub mod websocket;

pub use crate::core::{
    AtomicStats, StatusCell, Transport, TransportCapabilities, TransportError, TransportEvent,
    TransportEvents, TransportResult, TransportState, TransportStats,
};
pub use correlation::RequestTracker;
pub use factory::{detect_protocol_type, TransportFactory};
pub use retry::RetryPolicy;

// The transport selection enum lives with the config model; re-exported
// here so transport users need not depend on the config crate directly.
pub use deechat_mcp_config::TransportKind;
