//! The client supervisor: owns every live client, guarantees at most one
//! client and at most one in-flight connect per server id.
//!
//! Connect deduplication uses a shared future per server id: the first
//! caller installs it, everyone else awaits the same future. A failed
//! open removes the future (no negative caching) and the late arrivals
//! retry once from the top. The client map and the pending-open table
//! live under one lock.
//!
//! For configs whose execution mode is `inprocess`, the supervisor skips
//! the transport entirely and wraps a registered [`InprocessServer`] in
//! a faux client, so embedded and external servers share one interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use deechat_mcp_config::{ExecutionMode, ServerConfig, TransportKind};
use deechat_mcp_protocol::methods;
use deechat_mcp_transport::{TransportEvent, TransportFactory, TransportStats};

use crate::client::McpClient;
use crate::error::{McpError, Result};
use crate::events::{EventBus, McpEvent, McpEventKind};
use crate::inprocess::InprocessServer;
use crate::types::Tool;

/// Stdio child liveness check cadence
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// A live client: a real protocol client over a transport, or a faux
/// client delegating straight into an in-process server.
pub enum ServerClient {
    /// External server reached over a transport
    Remote(McpClient),
    /// Application-embedded server
    Inprocess {
        /// Server id
        server_id: String,
        /// Display name
        server_name: String,
        /// The embedded implementation
        server: Arc<dyn InprocessServer>,
    },
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(client) => f.debug_tuple("Remote").field(client).finish(),
            Self::Inprocess { server_id, .. } => {
                f.debug_struct("Inprocess").field("server_id", server_id).finish()
            }
        }
    }
}

impl ServerClient {
    /// Server id this client serves
    pub fn server_id(&self) -> &str {
        match self {
            Self::Remote(client) => client.server_id(),
            Self::Inprocess { server_id, .. } => server_id,
        }
    }

    /// Whether the client can take requests right now
    pub fn is_connected(&self) -> bool {
        match self {
            Self::Remote(client) => client.is_connected(),
            Self::Inprocess { .. } => true,
        }
    }

    /// Transport counters; in-process clients have no wire
    pub fn stats(&self) -> Option<TransportStats> {
        match self {
            Self::Remote(client) => Some(client.stats()),
            Self::Inprocess { .. } => None,
        }
    }

    /// Discover the tool catalog
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        match self {
            Self::Remote(client) => client.list_tools().await,
            Self::Inprocess {
                server_id,
                server_name,
                server,
            } => Ok(server
                .list_tools()
                .await?
                .into_iter()
                .map(|def| Tool::from_def(def, server_id, server_name))
                .collect()),
        }
    }

    /// Invoke one tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        match self {
            Self::Remote(client) => client.call_tool(name, arguments).await,
            Self::Inprocess { server, .. } => server.call_tool(name, arguments).await,
        }
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<()> {
        match self {
            Self::Remote(client) => client.ping().await,
            Self::Inprocess { server, .. } => server.ping().await,
        }
    }

    /// Tear the client down
    pub async fn close(&self) {
        if let Self::Remote(client) = self {
            client.close().await;
        }
    }
}

type OpenFuture = Shared<BoxFuture<'static, std::result::Result<Arc<ServerClient>, McpError>>>;

#[derive(Default)]
struct SupervisorState {
    clients: HashMap<String, Arc<ServerClient>>,
    pending: HashMap<String, OpenFuture>,
}

struct SupervisorInner {
    factory: TransportFactory,
    state: Mutex<SupervisorState>,
    inprocess: RwLock<HashMap<String, Arc<dyn InprocessServer>>>,
    events: Arc<EventBus>,
    watchdog: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Owner of every live client, keyed by server id
#[derive(Clone)]
pub struct ClientSupervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for ClientSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ClientSupervisor")
            .field("clients", &state.clients.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl ClientSupervisor {
    /// Create a supervisor publishing onto the given bus
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                factory: TransportFactory::new(),
                state: Mutex::new(SupervisorState::default()),
                inprocess: RwLock::new(HashMap::new()),
                events,
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Register an in-process server for a server id. Configs with
    /// `execution=inprocess` resolve to it instead of a transport.
    pub fn register_inprocess(&self, server_id: impl Into<String>, server: Arc<dyn InprocessServer>) {
        self.inner.inprocess.write().insert(server_id.into(), server);
    }

    /// The live client for `id`, if one exists
    pub fn get(&self, id: &str) -> Option<Arc<ServerClient>> {
        self.inner.state.lock().clients.get(id).cloned()
    }

    /// Ids with a live client
    pub fn connected_ids(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .clients
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Get the live client for a config, opening one if needed.
    ///
    /// Concurrent callers for the same id share a single connect; a
    /// failed shared connect is retried once from the top by waiters
    /// that did not own it.
    pub async fn get_or_open(&self, config: &ServerConfig) -> Result<Arc<ServerClient>> {
        for final_attempt in [false, true] {
            enum Plan {
                Await(OpenFuture),
                Own(OpenFuture),
            }

            let plan = {
                let mut state = self.inner.state.lock();
                if let Some(client) = state.clients.get(&config.id) {
                    if client.is_connected() {
                        return Ok(Arc::clone(client));
                    }
                    // Stale handle; drop it and open fresh.
                    state.clients.remove(&config.id);
                }
                if let Some(pending) = state.pending.get(&config.id) {
                    Plan::Await(pending.clone())
                } else {
                    let future = Self::open(Arc::clone(&self.inner), config.clone())
                        .boxed()
                        .shared();
                    state.pending.insert(config.id.clone(), future.clone());
                    Plan::Own(future)
                }
            };

            match plan {
                Plan::Own(future) => {
                    let result = future.await;
                    let mut state = self.inner.state.lock();
                    state.pending.remove(&config.id);
                    return match result {
                        Ok(client) => {
                            state.clients.insert(config.id.clone(), Arc::clone(&client));
                            drop(state);
                            self.inner.events.publish(McpEvent::server(
                                McpEventKind::ServerConnected,
                                &config.id,
                            ));
                            Ok(client)
                        }
                        Err(e) => {
                            drop(state);
                            self.inner.events.publish(
                                McpEvent::server(McpEventKind::ServerError, &config.id)
                                    .with_error(e.to_string()),
                            );
                            Err(e)
                        }
                    };
                }
                Plan::Await(future) => match future.await {
                    Ok(client) => return Ok(client),
                    Err(e) if final_attempt => return Err(e),
                    Err(_) => continue, // owner dropped the future; retry once
                },
            }
        }
        unreachable!("bounded loop above always returns")
    }

    /// The connect future shared by deduplicated callers
    async fn open(
        inner: Arc<SupervisorInner>,
        config: ServerConfig,
    ) -> std::result::Result<Arc<ServerClient>, McpError> {
        // In-process short-circuit: a registered embedded server wins
        // over any transport. In-memory configs without a registration
        // still go through the loopback transport.
        if config.execution_mode() == ExecutionMode::Inprocess {
            let registered = inner.inprocess.read().get(&config.id).cloned();
            match registered {
                Some(server) => {
                    info!(server_id = %config.id, "using in-process server");
                    return Ok(Arc::new(ServerClient::Inprocess {
                        server_id: config.id.clone(),
                        server_name: config.name.clone(),
                        server,
                    }));
                }
                None if config.transport != TransportKind::InMemory => {
                    return Err(McpError::TransportUnavailable(format!(
                        "no in-process server registered for '{}'",
                        config.id
                    )));
                }
                None => {}
            }
        }

        let transport = inner
            .factory
            .create(&config)
            .map_err(|e| McpError::from(e).with_server(&config.id))?;

        // Forward transport lifecycle into the bus for as long as the
        // transport lives.
        Self::spawn_event_forwarder(&inner, &config.id, transport.subscribe());

        let client = McpClient::new(&config.id, &config.name, transport);
        match client.connect().await {
            Ok(_) => Ok(Arc::new(ServerClient::Remote(client))),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Forward disconnects, errors and server messages onto the bus.
    /// Disconnects for ids we already dropped (an explicit close) stay
    /// silent.
    fn spawn_event_forwarder(
        inner: &Arc<SupervisorInner>,
        server_id: &str,
        mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    ) {
        let inner = Arc::clone(inner);
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Disconnected { reason }) => {
                        let still_owned = inner.state.lock().clients.contains_key(&server_id);
                        if still_owned {
                            inner.events.publish(
                                McpEvent::server(McpEventKind::ServerDisconnected, &server_id)
                                    .with_data(serde_json::json!({ "reason": reason })),
                            );
                        }
                    }
                    Ok(TransportEvent::Error { error }) => {
                        // Errors during an open are reported once by the
                        // open path itself; forward only runtime errors
                        // of installed clients.
                        let still_owned = inner.state.lock().clients.contains_key(&server_id);
                        if still_owned {
                            inner.events.publish(
                                McpEvent::server(McpEventKind::ServerError, &server_id)
                                    .with_error(error.to_string()),
                            );
                        }
                    }
                    Ok(TransportEvent::Message { message }) => {
                        if let Some(method) = message.method() {
                            let event =
                                McpEvent::server(McpEventKind::ServerMessage, &server_id)
                                    .with_data(serde_json::json!({
                                        "method": method,
                                        "params": match &message {
                                            deechat_mcp_protocol::JsonRpcMessage::Notification(n) => n.params.clone(),
                                            deechat_mcp_protocol::JsonRpcMessage::Request(r) => r.params.clone(),
                                            deechat_mcp_protocol::JsonRpcMessage::Response(_) => None,
                                        },
                                    }));
                            inner.events.publish(event);
                            if method == methods::TOOLS_LIST_CHANGED {
                                debug!(server_id = %server_id, "server announced a tool catalog change");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(server_id = %server_id, skipped, "event forwarder lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Close and drop the client for `id`, if any. The explicit close
    /// does not publish `serverDisconnected`; callers decide that.
    pub async fn close(&self, id: &str) {
        let client = self.inner.state.lock().clients.remove(id);
        if let Some(client) = client {
            client.close().await;
            debug!(server_id = %id, "client closed");
        }
    }

    /// Close every client (shutdown path)
    pub async fn close_all(&self) {
        let clients: Vec<Arc<ServerClient>> = {
            let mut state = self.inner.state.lock();
            state.pending.clear();
            state.clients.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.close().await;
        }
        if let Some(task) = self.inner.watchdog.lock().take() {
            task.abort();
        }
    }

    /// Open an ephemeral client outside the supervised map, for
    /// connection tests. The caller owns its lifecycle.
    pub async fn open_ephemeral(&self, config: &ServerConfig) -> Result<ServerClient> {
        if config.execution_mode() == ExecutionMode::Inprocess {
            if let Some(server) = self.inner.inprocess.read().get(&config.id).cloned() {
                return Ok(ServerClient::Inprocess {
                    server_id: config.id.clone(),
                    server_name: config.name.clone(),
                    server,
                });
            }
        }
        let transport = self
            .inner
            .factory
            .create(config)
            .map_err(|e| McpError::from(e).with_server(&config.id))?;
        let client = McpClient::new(&config.id, &config.name, transport);
        match client.connect().await {
            Ok(_) => Ok(ServerClient::Remote(client)),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Start the 30-second stdio watchdog: a remote stdio client whose
    /// transport is no longer connected is dropped from the map with a
    /// `serverDisconnected` event. Idempotent.
    pub fn start_watchdog(&self) {
        let mut guard = self.inner.watchdog.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(WATCHDOG_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;
            loop {
                timer.tick().await;

                let stale: Vec<String> = {
                    let state = inner.state.lock();
                    state
                        .clients
                        .iter()
                        .filter(|(_, client)| match client.as_ref() {
                            ServerClient::Remote(c) => {
                                c.transport().transport_type() == TransportKind::Stdio
                                    && !c.is_connected()
                            }
                            ServerClient::Inprocess { .. } => false,
                        })
                        .map(|(id, _)| id.clone())
                        .collect()
                };

                for id in stale {
                    warn!(server_id = %id, "watchdog dropping dead stdio client");
                    inner.state.lock().clients.remove(&id);
                    inner.events.publish(
                        McpEvent::server(McpEventKind::ServerDisconnected, &id)
                            .with_data(serde_json::json!({"reason": "health check failed"})),
                    );
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deechat_mcp_config::ServerConfig;
    use deechat_mcp_protocol::ToolDef;
    use serde_json::json;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inmemory_config(id: &str, channel: &str) -> ServerConfig {
        let mut config = ServerConfig::new(id, TransportKind::InMemory).with_channel(channel);
        config.id = id.to_string();
        config.self_handle = true;
        config
    }

    #[tokio::test]
    #[serial]
    async fn get_or_open_returns_one_client_for_concurrent_callers() {
        let supervisor = ClientSupervisor::new(Arc::new(EventBus::new()));
        let config = inmemory_config("sup-1", "sup-dedup");

        let (a, b, c) = tokio::join!(
            supervisor.get_or_open(&config),
            supervisor.get_or_open(&config),
            supervisor.get_or_open(&config),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));

        supervisor.close_all().await;
    }

    #[tokio::test]
    #[serial]
    async fn failed_open_leaves_no_negative_cache() {
        let supervisor = ClientSupervisor::new(Arc::new(EventBus::new()));
        // Points at nothing; connect() succeeds for in-memory, but a
        // stdio spawn failure is the realistic case.
        let mut config = ServerConfig::new("sup-2", TransportKind::Stdio)
            .with_command("definitely-not-a-real-binary-4242");
        config.id = "sup-2".into();

        assert!(supervisor.get_or_open(&config).await.is_err());
        assert!(supervisor.inner.state.lock().pending.is_empty());
        assert!(supervisor.inner.state.lock().clients.is_empty());

        // A subsequent open of a good config under the same id works.
        let good = inmemory_config("sup-2", "sup-recover");
        assert!(supervisor.get_or_open(&good).await.is_ok());
        supervisor.close_all().await;
    }

    #[tokio::test]
    #[serial]
    async fn open_failure_publishes_server_error() {
        let events = Arc::new(EventBus::new());
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        events.subscribe(Arc::new(move |event| {
            if event.kind == McpEventKind::ServerError {
                e.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let supervisor = ClientSupervisor::new(events);
        let mut config = ServerConfig::new("sup-3", TransportKind::Stdio)
            .with_command("definitely-not-a-real-binary-4242");
        config.id = "sup-3".into();

        let _ = supervisor.get_or_open(&config).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    struct FixedServer;

    #[async_trait]
    impl InprocessServer for FixedServer {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn list_tools(&self) -> Result<Vec<ToolDef>> {
            Ok(vec![ToolDef {
                name: "fixed_echo".into(),
                description: None,
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, _name: &str, arguments: Value) -> Result<Value> {
            Ok(json!({"echo": arguments}))
        }
    }

    #[tokio::test]
    #[serial]
    async fn inprocess_short_circuit_skips_the_transport() {
        let supervisor = ClientSupervisor::new(Arc::new(EventBus::new()));
        supervisor.register_inprocess("emb", Arc::new(FixedServer));

        // Stdio config tagged inprocess: no child process is spawned.
        let mut config = ServerConfig::new("embedded", TransportKind::Stdio)
            .with_command("unused-binary");
        config.id = "emb".into();
        config.tags.push("inprocess".into());

        let client = supervisor.get_or_open(&config).await.unwrap();
        assert!(matches!(client.as_ref(), ServerClient::Inprocess { .. }));
        assert!(client.stats().is_none());

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "fixed_echo");
        assert_eq!(tools[0].server_id, "emb");

        let result = client.call_tool("fixed_echo", json!({"a": 1})).await.unwrap();
        assert_eq!(result["echo"]["a"], 1);

        supervisor.close_all().await;
    }

    #[tokio::test]
    #[serial]
    async fn inprocess_mode_without_registration_errors_for_non_inmemory() {
        let supervisor = ClientSupervisor::new(Arc::new(EventBus::new()));
        let mut config = ServerConfig::new("ghost", TransportKind::Stdio).with_command("x");
        config.id = "ghost".into();
        config.execution = Some(ExecutionMode::Inprocess);

        let err = supervisor.get_or_open(&config).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransportUnavailable);
    }
}
