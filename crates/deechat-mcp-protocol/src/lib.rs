//! # DeeChat MCP Protocol
//!
//! Wire-level types for the Model Context Protocol (MCP), a JSON-RPC 2.0
//! dialect used to expose tools and resources to LLM-based clients.
//!
//! This crate is the foundation layer of the DeeChat MCP client runtime:
//! it knows how messages look on the wire and nothing about how they get
//! there. Transports frame these types, the client runtime speaks them.
//!
//! ## Message model
//!
//! A [`JsonRpcMessage`] is one of:
//!
//! - **Request** - `method` and `id` both set; expects a response
//! - **Notification** - `method` set, no `id`; fire-and-forget
//! - **Response** - `result` or `error` (never both), echoing the request `id`

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponsePayload, JsonRpcVersion, RequestId, ResponseId,
};
pub use types::{
    CallToolParams, ClientCapabilities, Implementation, InitializeRequest, InitializeResult,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult, ResourceDef,
    ServerCapabilities, ToolDef, ToolsCapability,
};

/// MCP protocol revision spoken by this implementation.
///
/// Sent in the `initialize` handshake and mirrored in the
/// `MCP-Protocol-Version` header by HTTP-family transports.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Maximum message size accepted from a peer (in bytes)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Method names the client issues or understands.
pub mod methods {
    /// Capability negotiation handshake
    pub const INITIALIZE: &str = "initialize";
    /// Notification sent after a successful `initialize` response
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Tool catalog discovery
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation
    pub const TOOLS_CALL: &str = "tools/call";
    /// Server-side tool catalog change signal
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Resource catalog discovery
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Resource content retrieval
    pub const RESOURCES_READ: &str = "resources/read";
    /// Liveness probe
    pub const PING: &str = "ping";
}
