//! In-process server seam.
//!
//! The application hosts some servers inside its own process (the
//! built-in file-operations server, for one). Those satisfy this trait
//! and get wrapped in a faux client by the supervisor, so the rest of
//! the runtime sees external and embedded servers through one interface.

use async_trait::async_trait;
use serde_json::Value;

use deechat_mcp_protocol::ToolDef;

use crate::error::Result;

/// A tool-exposing server living inside the application process
#[async_trait]
pub trait InprocessServer: Send + Sync {
    /// Display name for logs and tool attribution
    fn name(&self) -> &str;

    /// The server's tool catalog
    async fn list_tools(&self) -> Result<Vec<ToolDef>>;

    /// Invoke one tool
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    /// Liveness probe; in-process servers are alive by definition
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
