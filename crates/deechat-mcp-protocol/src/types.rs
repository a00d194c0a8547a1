//! MCP method payload types.
//!
//! Parameter and result shapes for the methods the client issues:
//! `initialize`, `tools/list`, `tools/call`, `resources/list`,
//! `resources/read` and `ping`. Field names follow the MCP schema
//! (camelCase on the wire).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name/version pair identifying one side of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name
    pub name: String,
    /// Implementation version
    pub version: String,
}

/// Capabilities advertised by the client during `initialize`.
///
/// The DeeChat runtime is a pure tool consumer; it advertises no
/// sampling/roots/elicitation support, so this serializes as `{}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {}

/// Tools capability advertised by a server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Capabilities reported by a server during `initialize`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Tool support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    /// Resource support (shape not interpreted by this client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    /// Prompt support (shape not interpreted by this client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

/// `initialize` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    /// Protocol revision the client speaks
    pub protocol_version: String,
    /// Client capabilities
    pub capabilities: ClientCapabilities,
    /// Client identity
    pub client_info: Implementation,
}

/// `initialize` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision the server selected
    #[serde(default)]
    pub protocol_version: String,
    /// Server capabilities
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server identity
    pub server_info: Implementation,
}

/// A tool as reported by `tools/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    /// Tool name, unique within the owning server
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the tool's arguments
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object"})
}

/// `tools/list` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    /// Tool catalog
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    /// Pagination cursor (unused by this client; servers may send it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `tools/call` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name
    pub name: String,
    /// Tool arguments, validated server-side against the input schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// A resource as reported by `resources/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    /// Resource URI
    pub uri: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// `resources/list` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// Resource catalog
    #[serde(default)]
    pub resources: Vec<ResourceDef>,
}

/// `resources/read` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    /// URI of the resource to read
    pub uri: String,
}

/// `resources/read` response; content blocks are passed through untyped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Content blocks
    #[serde(default)]
    pub contents: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn initialize_request_uses_camel_case() {
        let request = InitializeRequest {
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "deechat".into(),
                version: "0.4.0".into(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["protocolVersion"], "2025-03-26");
        assert_eq!(value["capabilities"], json!({}));
        assert_eq!(value["clientInfo"]["name"], "deechat");
    }

    #[test]
    fn tool_def_defaults_input_schema() {
        let tool: ToolDef = serde_json::from_value(json!({"name": "read_file"})).unwrap();
        assert_eq!(tool.input_schema, json!({"type": "object"}));
        assert!(tool.description.is_none());
    }

    #[test]
    fn list_tools_result_tolerates_missing_fields() {
        let result: ListToolsResult = serde_json::from_value(json!({})).unwrap();
        assert!(result.tools.is_empty());

        let result: ListToolsResult = serde_json::from_value(json!({
            "tools": [{"name": "a", "inputSchema": {"type": "object"}}],
            "nextCursor": "page2"
        }))
        .unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.next_cursor.as_deref(), Some("page2"));
    }

    #[test]
    fn initialize_result_parses_server_info() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "files", "version": "1.2.0"}
        }))
        .unwrap();
        assert_eq!(result.server_info.name, "files");
        assert_eq!(result.capabilities.tools.unwrap().list_changed, Some(true));
    }
}
