//! The `ServerConfig` data model.
//!
//! Field names are camelCase on disk to stay compatible with the files the
//! desktop app writes. Every optional field carries a serde default so a
//! file written by an older version still loads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Minimum accepted request timeout, in milliseconds
pub const MIN_TIMEOUT_MS: u64 = 1000;

/// Collection a config belongs to; drives on-disk location and
/// write-permission scope (system entries cannot be removed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerCollection {
    /// Shipped with the application; immutable through the public API
    System,
    /// Stored under the workspace's `.deechat/mcp/` directory
    Project,
    /// The user's own servers
    #[default]
    User,
}

impl ServerCollection {
    /// Collection name as used on disk and in events
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for ServerCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a config originally came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigSource {
    /// Created by the user through the UI
    #[default]
    User,
    /// Discovered in a project workspace
    Project,
    /// Bundled with the application
    System,
    /// Brought in via import or legacy migration
    Imported,
}

/// Wire mechanism used to reach the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON over stdio
    Stdio,
    /// WebSocket, one message per text frame
    Websocket,
    /// Streamable HTTP (POST + companion SSE stream, session headers)
    StreamableHttp,
    /// Legacy server-sent events transport (deprecated)
    Sse,
    /// Process-local loopback broker, used for tests and embedded servers
    InMemory,
}

impl TransportKind {
    /// Whether this transport reaches out over the network
    pub fn is_network(self) -> bool {
        matches!(self, Self::Websocket | Self::StreamableHttp | Self::Sse)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Websocket => "websocket",
            Self::StreamableHttp => "streamableHttp",
            Self::Sse => "sse",
            Self::InMemory => "inMemory",
        };
        f.write_str(name)
    }
}

/// How the server is hosted relative to the application process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    /// Hosted inside the application process, no real transport
    Inprocess,
    /// Spawned through a sandboxing launcher
    Sandbox,
    /// Plain external process or remote endpoint
    Standard,
}

/// Retry policy knobs for connects and durable-session reconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum retry attempts; 0 disables retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on the backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Authentication settings, discriminated on `type`.
///
/// OAuth2 token acquisition is not performed by the runtime; when the
/// `oauth2` variant carries a `token` it is injected as a bearer header
/// exactly like the `bearer` variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    /// No authentication
    #[default]
    None,
    /// Static bearer token
    Bearer {
        /// Token injected as `Authorization: Bearer <token>`
        token: String,
    },
    /// OAuth2 client definition; acquisition happens above this layer
    #[serde(rename_all = "camelCase")]
    Oauth2 {
        /// OAuth2 client id
        client_id: String,
        /// OAuth2 client secret, absent for public clients
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        /// Authorization endpoint
        auth_url: String,
        /// Token endpoint
        token_url: String,
        /// Requested scope
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        /// Redirect URI for the authorization-code flow
        #[serde(default, skip_serializing_if = "Option::is_none")]
        redirect_uri: Option<String>,
        /// A ready access token, when one has already been acquired
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Arbitrary headers merged into every outbound request
    Custom {
        /// Header name/value pairs
        headers: HashMap<String, String>,
    },
}

/// Sandbox launcher settings, consulted by execution-mode inference
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Whether sandboxed execution is requested
    #[serde(default)]
    pub enabled: bool,
}

/// Live status of a server, never persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuntimeStatus {
    /// No live connection
    #[default]
    Disconnected,
    /// Connection attempt in flight
    Connecting,
    /// Healthy connection
    Connected,
    /// Last attempt or connection ended in an error
    Error,
}

/// Runtime-only state attached to a config; excluded from serialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    /// Current status
    #[serde(default)]
    pub status: RuntimeStatus,
    /// Child process id, for stdio servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the current connection was established
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_at: Option<DateTime<Utc>>,
    /// Number of tools last discovered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    /// Errors observed since the config was loaded
    #[serde(default)]
    pub error_count: u32,
    /// Most recent error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The durable definition of one MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Opaque identifier, stable across renames
    #[serde(default)]
    pub id: String,
    /// Human-readable name, unique within its collection
    pub name: String,
    /// Optional description shown in the UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Server version, advisory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Free-form tags; also consulted by execution inference
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Collection grouping (system / project / user)
    #[serde(default)]
    pub collection: ServerCollection,
    /// Provenance of this config
    #[serde(default)]
    pub source: ConfigSource,
    /// Display/aggregation priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Transport selection
    #[serde(rename = "type")]
    pub transport: TransportKind,

    // Stdio fields
    /// Command to spawn (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments (stdio)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory for the child (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Extra environment merged into the child's environment (stdio)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    // Network fields
    /// Endpoint URL (websocket / streamableHttp / sse)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra headers sent on every request (network transports)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    // In-memory fields
    /// Broker channel name (inMemory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Host a loopback echo server on the same channel (inMemory)
    #[serde(default)]
    pub self_handle: bool,

    // Behavior
    /// Whether the orchestrator connects this server
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    /// Connect during application startup
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Reconnect automatically after a dropped durable session
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Per-request timeout in milliseconds (>= 1000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Cap on concurrent in-flight tool calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,

    /// Authentication settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Execution hint; inferred when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionMode>,
    /// Sandbox launcher settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Last successful connection timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,

    /// Live state; never written to disk
    #[serde(skip)]
    pub runtime: RuntimeState,
}

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl ServerConfig {
    /// Create a config with defaults for everything but name and transport
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            version: None,
            tags: Vec::new(),
            collection: ServerCollection::default(),
            source: ConfigSource::default(),
            priority: None,
            transport,
            command: None,
            args: Vec::new(),
            working_directory: None,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            channel: None,
            self_handle: false,
            is_enabled: true,
            auto_start: true,
            auto_reconnect: false,
            timeout_ms: default_timeout_ms(),
            retry: RetryConfig::default(),
            max_concurrent: None,
            auth: AuthConfig::default(),
            execution: None,
            sandbox: None,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
            runtime: RuntimeState::default(),
        }
    }

    /// Set the command (stdio)
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Append an argument (stdio)
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the endpoint URL (network transports)
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the broker channel (inMemory)
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the collection
    pub fn with_collection(mut self, collection: ServerCollection) -> Self {
        self.collection = collection;
        self
    }

    /// Set enablement
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    /// Validate the structural invariants.
    ///
    /// Transport-specific requirements: stdio needs a non-empty command,
    /// network transports need a well-formed absolute URL with a scheme
    /// matching the transport, inMemory needs a channel name.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::invalid("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name must not be empty"));
        }
        if self.timeout_ms < MIN_TIMEOUT_MS {
            return Err(ConfigError::invalid(format!(
                "timeoutMs must be at least {MIN_TIMEOUT_MS} (got {})",
                self.timeout_ms
            )));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoffFactor must be at least 1.0",
            ));
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(ConfigError::invalid("stdio servers require a command"));
                }
            }
            TransportKind::Websocket | TransportKind::StreamableHttp | TransportKind::Sse => {
                let raw = self
                    .url
                    .as_deref()
                    .ok_or_else(|| ConfigError::invalid("network servers require a url"))?;
                let parsed = url::Url::parse(raw)
                    .map_err(|e| ConfigError::invalid(format!("malformed url '{raw}': {e}")))?;
                let scheme_ok = match self.transport {
                    TransportKind::Websocket => matches!(parsed.scheme(), "ws" | "wss"),
                    _ => matches!(parsed.scheme(), "http" | "https"),
                };
                if !scheme_ok {
                    return Err(ConfigError::invalid(format!(
                        "url scheme '{}' does not match transport '{}'",
                        parsed.scheme(),
                        self.transport
                    )));
                }
            }
            TransportKind::InMemory => {
                if self.channel.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(ConfigError::invalid("inMemory servers require a channel"));
                }
            }
        }

        Ok(())
    }

    /// The effective execution mode: the explicit hint, or the inferred one.
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution.unwrap_or_else(|| self.infer_execution())
    }

    /// Infer an execution mode from the transport and launch shape.
    pub fn infer_execution(&self) -> ExecutionMode {
        match self.transport {
            TransportKind::InMemory => ExecutionMode::Inprocess,
            TransportKind::Websocket | TransportKind::StreamableHttp | TransportKind::Sse => {
                ExecutionMode::Standard
            }
            TransportKind::Stdio => {
                let command = self.command.as_deref().unwrap_or_default();
                let binary = std::path::Path::new(command)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(command);
                if matches!(binary, "npx" | "npm") {
                    ExecutionMode::Sandbox
                } else if self.tags.iter().any(|t| t == "inprocess") {
                    ExecutionMode::Inprocess
                } else if self.sandbox.as_ref().is_some_and(|s| s.enabled) {
                    ExecutionMode::Sandbox
                } else {
                    ExecutionMode::Standard
                }
            }
        }
    }

    /// Case-insensitive substring match over name, description and tags
    pub fn matches_query(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.name.to_lowercase().contains(&needle)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle))
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }
}
