//! Error types for stockroom-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::remote::RemoteError;

/// Result type alias using stockroom-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stockroom-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record, operation or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote store failure
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Conflict could not be resolved in its current state
    #[error("Conflict resolution failed: {0}")]
    Resolution(String),
}
