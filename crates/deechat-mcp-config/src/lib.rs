//! # DeeChat MCP Configuration
//!
//! Durable server definitions and the on-disk configuration registry.
//!
//! A [`ServerConfig`] describes one MCP server: how to reach it (transport
//! selection plus transport-specific fields), how to treat it (enablement,
//! timeouts, retry policy, authentication) and where it belongs (one of
//! three collections: system / project / user).
//!
//! The [`ConfigRegistry`] keeps the authoritative in-memory index and
//! mirrors every mutation to disk - one JSON file per config, one
//! directory per collection. On startup it also migrates the legacy
//! single-file store (`mcp-servers.json`) into the user collection.

pub mod error;
pub mod model;
pub mod paths;
pub mod registry;

pub use error::{ConfigError, Result};
pub use model::{
    AuthConfig, ConfigSource, ExecutionMode, RetryConfig, RuntimeState, RuntimeStatus,
    SandboxConfig, ServerCollection, ServerConfig, TransportKind, MIN_TIMEOUT_MS,
};
pub use paths::RegistryPaths;
pub use registry::{ConfigChange, ConfigRegistry, ListenerId};
