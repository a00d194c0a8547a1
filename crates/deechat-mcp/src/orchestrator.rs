//! The public facade: wires the registry, supervisor and cache together
//! and owns initialization, per-server retry, and tool aggregation.
//!
//! Retry decisions live here (and in the durable-session transports'
//! reconnect loops); no other layer retries. Failures during
//! auto-initialization never abort startup - they are logged and
//! published as `serverError` events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use deechat_mcp_config::{
    ConfigChange, ConfigRegistry, RegistryPaths, RuntimeStatus, ServerConfig,
};
use deechat_mcp_protocol::methods;

use crate::cache::ToolCache;
use crate::error::{ErrorKind, McpError, Result};
use crate::events::{EventBus, EventListener, ListenerId, McpEvent, McpEventKind};
use crate::inprocess::InprocessServer;
use crate::supervisor::{ClientSupervisor, ServerClient};
use crate::types::{ServerStatus, Tool, ToolCallRequest, ToolCallResponse};

/// Tuning knobs for the orchestrator's connect loop
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Pause between a successful open and tool discovery; some servers
    /// advertise tools only after finishing their own post-initialize
    /// setup.
    pub settle_delay: Duration,
    /// Base of the linear retry delay (`attempt × retry_step`)
    pub retry_step: Duration,
    /// Connect attempts per server when the config carries no retry count
    pub default_max_retries: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            retry_step: Duration::from_secs(2),
            default_max_retries: 3,
        }
    }
}

/// Process-scoped runtime facade.
///
/// Create one per application, call [`initialize`](Self::initialize)
/// once (concurrent callers share the same initialization), and
/// [`destroy`](Self::destroy) on shutdown.
pub struct McpOrchestrator {
    registry: Arc<ConfigRegistry>,
    supervisor: ClientSupervisor,
    cache: Arc<ToolCache>,
    events: Arc<EventBus>,
    options: OrchestratorOptions,
    init: OnceCell<()>,
}

impl std::fmt::Debug for McpOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpOrchestrator")
            .field("initialized", &self.init.initialized())
            .field("servers", &self.registry.get_all().len())
            .finish()
    }
}

impl McpOrchestrator {
    /// Create a runtime over the given storage layout
    pub fn new(paths: RegistryPaths) -> Self {
        Self::with_options(paths, OrchestratorOptions::default())
    }

    /// Create a runtime with custom connect-loop tuning
    pub fn with_options(paths: RegistryPaths, options: OrchestratorOptions) -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            registry: Arc::new(ConfigRegistry::new(paths)),
            supervisor: ClientSupervisor::new(Arc::clone(&events)),
            cache: Arc::new(ToolCache::new()),
            events,
            options,
            init: OnceCell::new(),
        }
    }

    /// The configuration registry
    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    /// The event bus
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The client supervisor (read access for status and stats)
    pub fn supervisor(&self) -> &ClientSupervisor {
        &self.supervisor
    }

    /// Subscribe to lifecycle events; returns the unsubscribe token
    pub fn subscribe(&self, listener: EventListener) -> ListenerId {
        self.events.subscribe(listener)
    }

    /// Detach a listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.events.unsubscribe(id)
    }

    /// Register an application-embedded server for the in-process
    /// short-circuit.
    pub fn register_inprocess_server(
        &self,
        server_id: impl Into<String>,
        server: Arc<dyn InprocessServer>,
    ) {
        self.supervisor.register_inprocess(server_id, server);
    }

    /// Load configs and connect every enabled server, sequentially.
    ///
    /// Concurrent callers await the same initialization; a failed
    /// initialization releases the latch so the next call retries.
    /// Individual server failures never abort startup.
    pub async fn initialize(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                self.registry.initialize().await?;

                // Registry mutations surface as config events on the bus.
                let bus = Arc::clone(&self.events);
                self.registry.subscribe(Arc::new(move |change| {
                    bus.publish(config_change_event(change));
                }));

                // A tools/list_changed announcement invalidates that
                // server's catalog; the next aggregation rediscovers it.
                let cache = Arc::clone(&self.cache);
                self.events.subscribe(Arc::new(move |event| {
                    if event.kind == McpEventKind::ServerMessage {
                        let method = event
                            .data
                            .as_ref()
                            .and_then(|d| d.get("method"))
                            .and_then(Value::as_str);
                        if method == Some(methods::TOOLS_LIST_CHANGED) {
                            if let Some(server_id) = &event.server_id {
                                cache.invalidate_tools(server_id);
                            }
                        }
                    }
                }));

                self.cache.start_sweeper();
                self.supervisor.start_watchdog();

                let mut enabled: Vec<ServerConfig> = self
                    .registry
                    .get_all()
                    .into_iter()
                    .filter(|c| c.is_enabled)
                    .collect();
                enabled.sort_by(|a, b| {
                    b.priority.unwrap_or(0).cmp(&a.priority.unwrap_or(0))
                });

                info!(count = enabled.len(), "connecting enabled MCP servers");
                for config in enabled {
                    if let Err(e) = self.connect_with_retry(&config).await {
                        warn!(
                            server_id = %config.id,
                            error = %e,
                            "server failed to connect during startup"
                        );
                    }
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Open a client, wait for the server to settle, discover tools and
    /// cache them. Retries with a linearly growing delay, then publishes
    /// `serverError` and propagates.
    pub async fn connect_with_retry(&self, config: &ServerConfig) -> Result<Arc<ServerClient>> {
        let max_attempts = if config.retry.max_retries > 0 {
            config.retry.max_retries
        } else {
            self.options.default_max_retries
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_connect(config).await {
                Ok(client) => {
                    let _ = self.registry.touch_last_connected(&config.id).await;
                    return Ok(client);
                }
                Err(e) if e.kind() == ErrorKind::ConfigInvalid => {
                    // Validation failures are final.
                    self.publish_connect_failure(config, attempt, &e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    self.publish_connect_failure(config, attempt, &e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        server_id = %config.id,
                        attempt,
                        error = %e,
                        "connect attempt failed, retrying"
                    );
                    tokio::time::sleep(self.options.retry_step * attempt).await;
                }
            }
        }
    }

    fn publish_connect_failure(&self, config: &ServerConfig, attempt: u32, error: &McpError) {
        self.events.publish(
            McpEvent::server(McpEventKind::ServerError, &config.id)
                .with_data(json!({"attempt": attempt}))
                .with_error(error.to_string()),
        );
    }

    async fn try_connect(&self, config: &ServerConfig) -> Result<Arc<ServerClient>> {
        let client = self.supervisor.get_or_open(config).await?;

        // Some servers advertise tools only after their own setup runs.
        tokio::time::sleep(self.options.settle_delay).await;

        match client.list_tools().await {
            Ok(tools) => {
                self.cache.put_tools(&config.id, tools.clone());
                self.events.publish(
                    McpEvent::server(McpEventKind::ToolDiscovered, &config.id)
                        .with_data(json!({"count": tools.len()})),
                );
                Ok(client)
            }
            Err(e) => {
                self.supervisor.close(&config.id).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Server management
    // ------------------------------------------------------------------

    /// Persist a new server and, when enabled, try to connect it once
    /// through the retry loop. Connect failures are logged, not fatal.
    pub async fn add_server(&self, config: ServerConfig) -> Result<ServerConfig> {
        let added = self.registry.add(config).await?;
        if added.is_enabled {
            if let Err(e) = self.connect_with_retry(&added).await {
                warn!(server_id = %added.id, error = %e, "new server failed to connect");
            }
        }
        Ok(added)
    }

    /// Close, unregister and forget one server
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        self.supervisor.close(id).await;
        self.registry.remove(id).await?;
        self.cache.invalidate_server(id);
        self.events
            .publish(McpEvent::server(McpEventKind::ServerDisconnected, id));
        Ok(())
    }

    /// Merge a patch into a server config.
    ///
    /// Enabling a server (`isEnabled` false → true) connects it; if the
    /// connect fails, the flag rolls back to `false`, the rollback is
    /// persisted, and the error propagates. Disabling closes the client
    /// and drops its cache entries.
    pub async fn update_server(&self, id: &str, patch: Value) -> Result<ServerConfig> {
        let before = self
            .registry
            .get(id)
            .ok_or_else(|| McpError::ConfigInvalid(format!("unknown server: {id}")))?;
        let updated = self.registry.update(id, patch).await?;

        if !before.is_enabled && updated.is_enabled {
            if let Err(e) = self.connect_with_retry(&updated).await {
                let rolled_back = self
                    .registry
                    .update(id, json!({"isEnabled": false}))
                    .await?;
                debug!(server_id = %id, "rolled back isEnabled after failed connect");
                debug_assert!(!rolled_back.is_enabled);
                return Err(e);
            }
        } else if before.is_enabled && !updated.is_enabled {
            self.supervisor.close(id).await;
            self.cache.invalidate_server(id);
            self.events
                .publish(McpEvent::server(McpEventKind::ServerDisconnected, id));
        }

        Ok(updated)
    }

    /// Every configured server, with live runtime state filled in
    pub fn get_all_servers(&self) -> Vec<ServerConfig> {
        self.registry
            .get_all()
            .into_iter()
            .map(|mut config| {
                let connected = self
                    .supervisor
                    .get(&config.id)
                    .is_some_and(|c| c.is_connected());
                config.runtime.status = if connected {
                    RuntimeStatus::Connected
                } else {
                    RuntimeStatus::Disconnected
                };
                config.runtime.tool_count =
                    self.cache.get_tools(&config.id).map(|tools| tools.len());
                config
            })
            .collect()
    }

    /// Status snapshot for one server, cached for a few seconds
    pub async fn get_server_status(&self, id: &str) -> Result<ServerStatus> {
        if let Some(status) = self.cache.get_status(id) {
            return Ok(status);
        }
        let config = self
            .registry
            .get(id)
            .ok_or_else(|| McpError::ConfigInvalid(format!("unknown server: {id}")))?;

        let connected = self.supervisor.get(id).is_some_and(|c| c.is_connected());
        let status = ServerStatus {
            status: if connected {
                RuntimeStatus::Connected
            } else {
                RuntimeStatus::Disconnected
            },
            tool_count: self.cache.get_tools(id).map_or(0, |tools| tools.len()),
            version: config.version.clone(),
            last_connected: config.last_connected_at,
        };
        self.cache.put_status(id, status.clone());
        Ok(status)
    }

    /// Open an independent, ephemeral client and ping it. Never touches
    /// the supervised client map.
    pub async fn test_server_connection(&self, id: &str) -> bool {
        let Some(config) = self.registry.get(id) else {
            return false;
        };
        match self.supervisor.open_ephemeral(&config).await {
            Ok(client) => {
                let alive = client.ping().await.is_ok();
                client.close().await;
                alive
            }
            Err(e) => {
                debug!(server_id = %id, error = %e, "connection test failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    /// Discover one server's tools right now, refreshing the cache
    pub async fn discover_server_tools(&self, id: &str) -> Result<Vec<Tool>> {
        let config = self
            .registry
            .get(id)
            .ok_or_else(|| McpError::ConfigInvalid(format!("unknown server: {id}")))?;
        let client = self.supervisor.get_or_open(&config).await?;
        let tools = client.list_tools().await?;
        self.cache.put_tools(id, tools.clone());
        self.events.publish(
            McpEvent::server(McpEventKind::ToolDiscovered, id)
                .with_data(json!({"count": tools.len()})),
        );
        Ok(tools)
    }

    /// All currently known tools.
    ///
    /// Served from the cache when anything is cached; otherwise every
    /// enabled server is discovered in parallel, one server's failure
    /// never affecting the others.
    pub async fn get_all_tools(&self) -> Vec<Tool> {
        let cached = self.cache.all_tools();
        if !cached.is_empty() {
            return cached;
        }

        let enabled: Vec<ServerConfig> = self
            .registry
            .get_all()
            .into_iter()
            .filter(|c| c.is_enabled)
            .collect();

        let discoveries = enabled.iter().map(|config| async {
            let client = self.supervisor.get_or_open(config).await?;
            let tools = client.list_tools().await?;
            Ok::<(String, Vec<Tool>), McpError>((config.id.clone(), tools))
        });

        let mut all = Vec::new();
        for result in futures::future::join_all(discoveries).await {
            match result {
                Ok((server_id, tools)) => {
                    self.cache.put_tools(&server_id, tools.clone());
                    all.extend(tools);
                }
                Err(e) => debug!(error = %e, "tool discovery failed for one server"),
            }
        }
        all
    }

    /// Case-insensitive search over all known tools
    pub async fn search_tools(&self, query: &str) -> Vec<Tool> {
        self.get_all_tools()
            .await
            .into_iter()
            .filter(|t| t.matches_query(query))
            .collect()
    }

    /// Invoke a tool, consulting the idempotent-result cache first.
    ///
    /// Failures come back as `success=false` responses; this method
    /// never errors out of the facade.
    pub async fn call_tool(&self, request: ToolCallRequest) -> ToolCallResponse {
        let started = Instant::now();
        let key = ToolCache::call_key(&request.server_id, &request.tool_name, &request.arguments);

        if let Some(mut hit) = self.cache.get_call(&key) {
            debug!(
                server_id = %request.server_id,
                tool = %request.tool_name,
                "serving tool call from cache"
            );
            hit.call_id = request.call_id;
            hit.duration_ms = started.elapsed().as_millis() as u64;
            return hit;
        }

        let outcome: Result<Value> = async {
            let config = self.registry.get(&request.server_id).ok_or_else(|| {
                McpError::ConfigInvalid(format!("unknown server: {}", request.server_id))
            })?;
            let client = self.supervisor.get_or_open(&config).await?;
            client
                .call_tool(&request.tool_name, request.arguments.clone())
                .await
        }
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                let response = ToolCallResponse {
                    success: true,
                    result: Some(result),
                    error: None,
                    call_id: request.call_id.clone(),
                    duration_ms,
                };
                // The cached copy drops the caller's correlation id.
                self.cache.put_call(
                    key,
                    ToolCallResponse {
                        call_id: None,
                        ..response.clone()
                    },
                );
                self.cache
                    .record_usage(&request.server_id, &request.tool_name);
                self.events.publish(
                    McpEvent::server(McpEventKind::ToolCalled, &request.server_id).with_data(
                        json!({
                            "toolName": request.tool_name,
                            "durationMs": duration_ms,
                            "success": true,
                        }),
                    ),
                );
                response
            }
            Err(e) => {
                self.events.publish(
                    McpEvent::server(McpEventKind::ToolError, &request.server_id)
                        .with_data(json!({
                            "toolName": request.tool_name,
                            "durationMs": duration_ms,
                        }))
                        .with_error(e.to_string()),
                );
                ToolCallResponse {
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    call_id: request.call_id,
                    duration_ms,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Import / export / shutdown
    // ------------------------------------------------------------------

    /// Every config as pretty-printed JSON, runtime stripped
    pub fn export_configs(&self) -> Result<Vec<u8>> {
        Ok(self.registry.export_all()?)
    }

    /// Import configs into the user collection; returns how many landed
    pub async fn import_configs(&self, data: &[u8]) -> Result<usize> {
        Ok(self
            .registry
            .import(data, deechat_mcp_config::ServerCollection::User)
            .await?)
    }

    /// Drop invalid configs (system entries excepted)
    pub async fn cleanup(&self) -> Result<usize> {
        let removed = self.registry.cleanup().await?;
        if removed > 0 {
            info!(removed, "cleanup removed invalid configs");
        }
        Ok(removed)
    }

    /// Shut everything down: close clients, stop background tasks,
    /// clear caches.
    pub async fn destroy(&self) {
        self.supervisor.close_all().await;
        self.cache.destroy();
        info!("MCP runtime shut down");
    }
}

fn config_change_event(change: &ConfigChange) -> McpEvent {
    let (kind, config) = match change {
        ConfigChange::Added(c) => (McpEventKind::ConfigAdded, c),
        ConfigChange::Updated(c) => (McpEventKind::ConfigUpdated, c),
        ConfigChange::Removed(c) => (McpEventKind::ConfigRemoved, c),
    };
    McpEvent::server(kind, &config.id).with_data(json!({
        "name": config.name,
        "collection": config.collection.as_str(),
    }))
}
