//! Configuration error types.

use thiserror::Error;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors produced by config validation and the registry
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config failed structural validation
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Lookup by id found nothing
    #[error("server config not found: {0}")]
    NotFound(String),

    /// `(collection, name)` uniqueness was violated
    #[error("duplicate server name '{name}' in collection '{collection}'")]
    DuplicateName {
        /// Conflicting name
        name: String,
        /// Collection in which the conflict occurred
        collection: String,
    },

    /// System-collection entries are immutable through the public remove path
    #[error("config '{0}' belongs to the system collection and cannot be removed")]
    SystemImmutable(String),

    /// Project collection requested but no project directory was configured
    #[error("no project directory is available for project-collection configs")]
    ProjectUnavailable,

    /// Filesystem failure
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("config serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ConfigError {
    /// Shorthand for a validation failure
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
