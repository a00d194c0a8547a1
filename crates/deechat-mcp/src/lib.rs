//! # DeeChat MCP Runtime
//!
//! The client runtime that mediates between DeeChat's tool-invocation
//! layer and an open-ended set of external MCP servers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  McpOrchestrator                (public facade)              │
//! │  - initialization latch, per-server connect-with-retry       │
//! │  - tool aggregation, idempotent call caching                 │
//! └──────┬───────────────────┬──────────────────┬────────────────┘
//!        │                   │                  │
//! ┌──────▼──────┐   ┌────────▼───────┐   ┌──────▼───────┐
//! │ConfigRegistry│  │ClientSupervisor│   │  ToolCache   │
//! │ (on disk)    │  │ (live clients) │   │ (TTL maps)   │
//! └──────────────┘  └────────┬───────┘   └──────────────┘
//!                            │
//!                   ┌────────▼───────┐
//!                   │   McpClient    │  one per server
//!                   └────────┬───────┘
//!                            │
//!                   ┌────────▼───────┐
//!                   │   Transport    │  stdio / ws / http / sse / mem
//!                   └────────────────┘
//! ```
//!
//! Events flow the other way: Transport → Client → Supervisor →
//! [`EventBus`] → subscribers. No component holds a strong link to a
//! component it did not construct.

pub mod cache;
pub mod client;
pub mod error;
pub mod events;
pub mod inprocess;
pub mod orchestrator;
pub mod supervisor;
pub mod types;

pub use cache::{ToolCache, BUILTIN_SERVER_ID};
pub use client::McpClient;
pub use error::{ErrorKind, McpError, Result};
pub use events::{EventBus, EventListener, ListenerId, McpEvent, McpEventKind};
pub use inprocess::InprocessServer;
pub use orchestrator::{McpOrchestrator, OrchestratorOptions};
pub use supervisor::{ClientSupervisor, ServerClient};
pub use types::{ServerStatus, Tool, ToolCallRequest, ToolCallResponse};

// Re-export the layers callers usually need alongside the runtime.
pub use deechat_mcp_config::{
    ConfigRegistry, RegistryPaths, ServerCollection, ServerConfig, TransportKind,
};
pub use deechat_mcp_protocol::PROTOCOL_VERSION;
pub use deechat_mcp_transport::{detect_protocol_type, TransportFactory};
