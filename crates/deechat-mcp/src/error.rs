//! The runtime error taxonomy.
//!
//! Every layer below surfaces typed errors; this enum is what callers
//! and the orchestrator's retry logic reason about. Errors are `Clone`
//! so a failure can fan out of a shared connect future to every
//! deduplicated waiter.

use thiserror::Error;

use deechat_mcp_config::ConfigError;
use deechat_mcp_transport::TransportError;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, McpError>;

/// Coarse error classification, used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Validation failed; never retried
    ConfigInvalid,
    /// Could not open the transport; subject to orchestrator retry
    TransportUnavailable,
    /// Malformed JSON-RPC or unexpected state; not retried
    Protocol,
    /// 401/403 or token failure; surfaced with a hint, not silently retried
    Auth,
    /// Request or connect exceeded its limit; retried per policy
    Timeout,
    /// Explicit cancellation or disconnect
    Canceled,
    /// Server-side tool failure; returned as `success=false`, never thrown
    Tool,
    /// Invariant violation
    Internal,
}

/// Typed runtime error
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// Validation failed
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Transport could not be opened (spawn failure, refused, DNS)
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Malformed JSON-RPC or unexpected protocol state
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failure
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Explicit cancellation or disconnect
    #[error("canceled: {0}")]
    Canceled(String),

    /// The server reported a tool-level error
    #[error("tool error: {0}")]
    Tool(String),

    /// Invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Canceled(_) => ErrorKind::Canceled,
            Self::Tool(_) => ErrorKind::Tool,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator's retry policy applies
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransportUnavailable | ErrorKind::Timeout
        )
    }

    /// Wrap with server context for logs and events
    pub fn with_server(self, server_id: &str) -> Self {
        match self {
            Self::ConfigInvalid(m) => Self::ConfigInvalid(format!("[{server_id}] {m}")),
            Self::TransportUnavailable(m) => {
                Self::TransportUnavailable(format!("[{server_id}] {m}"))
            }
            Self::Protocol(m) => Self::Protocol(format!("[{server_id}] {m}")),
            Self::Auth(m) => Self::Auth(format!("[{server_id}] {m}")),
            Self::Timeout(m) => Self::Timeout(format!("[{server_id}] {m}")),
            Self::Canceled(m) => Self::Canceled(format!("[{server_id}] {m}")),
            Self::Tool(m) => Self::Tool(format!("[{server_id}] {m}")),
            Self::Internal(m) => Self::Internal(format!("[{server_id}] {m}")),
        }
    }
}

impl From<TransportError> for McpError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::ConnectionFailed(m)
            | TransportError::ConnectionLost(m)
            | TransportError::NotAvailable(m)
            | TransportError::SendFailed(m) => Self::TransportUnavailable(m),
            TransportError::SerializationFailed(m) | TransportError::ProtocolError(m) => {
                Self::Protocol(m)
            }
            // An RPC error object is only a tool failure on the
            // `tools/call` path; the client maps that case itself.
            TransportError::Rpc { code, message, .. } => {
                Self::Protocol(format!("server returned error {code}: {message}"))
            }
            TransportError::Timeout => Self::Timeout("request timed out".to_string()),
            TransportError::Canceled(m) => Self::Canceled(m),
            TransportError::AuthenticationFailed(m) => {
                Self::Auth(format!("{m}; check the server's auth settings"))
            }
            TransportError::ConfigurationError(m) => Self::ConfigInvalid(m),
            TransportError::Internal(m) => Self::Internal(m),
        }
    }
}

impl From<ConfigError> for McpError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Io(e) => Self::Internal(format!("config I/O: {e}")),
            other => Self::ConfigInvalid(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(error: serde_json::Error) -> Self {
        Self::Protocol(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_taxonomy_kinds() {
        let unavailable: McpError =
            TransportError::ConnectionFailed("refused".into()).into();
        assert_eq!(unavailable.kind(), ErrorKind::TransportUnavailable);
        assert!(unavailable.is_retryable());

        let timeout: McpError = TransportError::Timeout.into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(timeout.is_retryable());

        let protocol: McpError = TransportError::ProtocolError("bad".into()).into();
        assert_eq!(protocol.kind(), ErrorKind::Protocol);
        assert!(!protocol.is_retryable());

        let auth: McpError = TransportError::AuthenticationFailed("401".into()).into();
        assert_eq!(auth.kind(), ErrorKind::Auth);
        assert!(auth.to_string().contains("auth settings"), "carries a hint");

        // Outside tools/call, an RPC error object is a protocol-level
        // failure, not a tool failure.
        let rpc: McpError = TransportError::Rpc {
            code: -32601,
            message: "method not found".into(),
            data: None,
        }
        .into();
        assert_eq!(rpc.kind(), ErrorKind::Protocol);
        assert!(!rpc.is_retryable());
    }

    #[test]
    fn server_context_wraps_the_message() {
        let err = McpError::Timeout("request timed out".into()).with_server("s1");
        assert_eq!(err.to_string(), "timed out: [s1] request timed out");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
