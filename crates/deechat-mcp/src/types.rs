//! Caller-facing tool and call types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use deechat_mcp_config::RuntimeStatus;
use deechat_mcp_protocol::ToolDef;

/// A protocol-visible callable, enriched with ownership and usage data.
///
/// Copies live in the [`crate::ToolCache`]; the originating client may
/// discard them. Only `record_usage` mutates a tool after discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name, unique within its server
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments
    pub input_schema: Value,
    /// Owning server id
    pub server_id: String,
    /// Owning server display name
    pub server_name: String,
    /// Category derived from the tool name
    pub category: String,
    /// Derived tags for search and grouping
    #[serde(default)]
    pub tags: Vec<String>,
    /// How many times this tool has been called successfully
    #[serde(default)]
    pub usage_count: u64,
    /// When this tool was last called successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Tool {
    /// Enrich a wire-level tool definition with its owning server
    pub fn from_def(def: ToolDef, server_id: &str, server_name: &str) -> Self {
        let category = derive_category(&def.name);
        Self {
            name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            server_id: server_id.to_string(),
            server_name: server_name.to_string(),
            tags: vec![category.clone(), server_name.to_string()],
            category,
            usage_count: 0,
            last_used_at: None,
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

/// Category = the leading segment of the tool name (`file_read` → `file`),
/// or `general` when the name has no separator.
fn derive_category(name: &str) -> String {
    let head = name
        .split(['_', '-', '.', ':', '/'])
        .next()
        .unwrap_or_default();
    if head.is_empty() || head == name {
        "general".to_string()
    } else {
        head.to_lowercase()
    }
}

/// A request to invoke one tool on one server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    /// Target server id
    pub server_id: String,
    /// Tool to invoke
    pub tool_name: String,
    /// Tool arguments
    #[serde(default)]
    pub arguments: Value,
    /// Caller-supplied correlation id, echoed back in the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// The outcome of a tool call.
///
/// Tool failures are data, not exceptions: `success=false` with a
/// human-readable message, never a thrown error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    /// Whether the call succeeded
    pub success: bool,
    /// Tool result on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Echo of the request's `call_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Wall-clock duration of this call in milliseconds
    pub duration_ms: u64,
}

/// Point-in-time status of one configured server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Connection status
    pub status: RuntimeStatus,
    /// Tools currently known for this server
    pub tool_count: usize,
    /// Configured server version, when declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Last successful connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}
