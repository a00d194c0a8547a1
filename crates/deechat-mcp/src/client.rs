//! The protocol-level client: a thin wrapper above one transport.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use deechat_mcp_protocol::{
    methods, CallToolParams, ClientCapabilities, Implementation, InitializeRequest,
    InitializeResult, ListResourcesResult, ListToolsResult, ReadResourceParams,
    ReadResourceResult, ResourceDef, PROTOCOL_VERSION,
};
use deechat_mcp_transport::{Transport, TransportError, TransportStats};

use crate::error::{McpError, Result};
use crate::types::Tool;

/// Client identity sent during the `initialize` handshake
const CLIENT_NAME: &str = "deechat";

/// One MCP client per server: `initialize`, `tools/list`, `tools/call`,
/// resources access and `ping`, all over a single [`Transport`].
pub struct McpClient {
    server_id: String,
    server_name: String,
    transport: Arc<dyn Transport>,
    init_result: RwLock<Option<InitializeResult>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server_id", &self.server_id)
            .field("connected", &self.transport.is_connected())
            .finish()
    }
}

impl McpClient {
    /// Wrap a transport for the given server
    pub fn new(
        server_id: impl Into<String>,
        server_name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            server_name: server_name.into(),
            transport,
            init_result: RwLock::new(None),
        }
    }

    /// Server id this client serves
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Transport counters
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Whether the transport is connected
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// What the server reported during `initialize`, once done
    pub fn server_info(&self) -> Option<Implementation> {
        self.init_result.read().as_ref().map(|r| r.server_info.clone())
    }

    /// Connect the transport and run the `initialize` handshake
    pub async fn connect(&self) -> Result<InitializeResult> {
        self.transport
            .connect()
            .await
            .map_err(|e| McpError::from(e).with_server(&self.server_id))?;
        self.initialize().await
    }

    /// Run the `initialize` handshake: send our capabilities, store the
    /// server's, then emit `notifications/initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let request = InitializeRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: CLIENT_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let value = self
            .transport
            .request(methods::INITIALIZE, Some(serde_json::to_value(&request)?))
            .await
            .map_err(|e| McpError::from(e).with_server(&self.server_id))?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("invalid initialize result: {e}")))?;

        self.transport
            .notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| McpError::from(e).with_server(&self.server_id))?;

        info!(
            server_id = %self.server_id,
            server = %result.server_info.name,
            version = %result.server_info.version,
            "MCP handshake complete"
        );
        *self.init_result.write() = Some(result.clone());
        Ok(result)
    }

    /// Discover the server's tool catalog
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let value = self
            .transport
            .request(methods::TOOLS_LIST, None)
            .await
            .map_err(|e| McpError::from(e).with_server(&self.server_id))?;
        let result: ListToolsResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("invalid tools/list result: {e}")))?;

        debug!(
            server_id = %self.server_id,
            count = result.tools.len(),
            "discovered tools"
        );
        Ok(result
            .tools
            .into_iter()
            .map(|def| Tool::from_def(def, &self.server_id, &self.server_name))
            .collect())
    }

    /// Invoke a tool. An RPC error object on this method is the server
    /// reporting a tool failure, so it surfaces as [`McpError::Tool`];
    /// the orchestrator folds those into `success=false` responses.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        };
        self.transport
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(&params)?))
            .await
            .map_err(|e| {
                let error = match e {
                    TransportError::Rpc { code, message, .. } => {
                        McpError::Tool(format!("{message} (code {code})"))
                    }
                    other => McpError::from(other),
                };
                error.with_server(&self.server_id)
            })
    }

    /// List the server's resources
    pub async fn list_resources(&self) -> Result<Vec<ResourceDef>> {
        let value = self
            .transport
            .request(methods::RESOURCES_LIST, None)
            .await
            .map_err(|e| McpError::from(e).with_server(&self.server_id))?;
        let result: ListResourcesResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("invalid resources/list result: {e}")))?;
        Ok(result.resources)
    }

    /// Read one resource by URI
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let value = self
            .transport
            .request(methods::RESOURCES_READ, Some(serde_json::to_value(&params)?))
            .await
            .map_err(|e| McpError::from(e).with_server(&self.server_id))?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("invalid resources/read result: {e}")))
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<()> {
        self.transport
            .request(methods::PING, None)
            .await
            .map_err(|e| McpError::from(e).with_server(&self.server_id))?;
        Ok(())
    }

    /// Close the transport, cancelling anything in flight
    pub async fn close(&self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!(server_id = %self.server_id, error = %e, "disconnect reported an error");
        }
    }
}
