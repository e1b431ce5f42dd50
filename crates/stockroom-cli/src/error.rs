use std::io;

use stockroom_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] stockroom_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Identifier cannot be empty")]
    EmptyIdentifier,
    #[error("No JSON data provided")]
    EmptyData,
    #[error("Expected a JSON object: {0}")]
    InvalidData(String),
    #[error("Pending operation not found for id/prefix: {0}")]
    OperationNotFound(String),
    #[error("Conflict not found for id/prefix: {0}")]
    ConflictNotFound(String),
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(String),
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error(
        "Remote store is not configured. Set STOCKROOM_REMOTE_URL and STOCKROOM_REMOTE_KEY to enable `stockroom sync`."
    )]
    RemoteNotConfigured,
    #[error("Remote store is unreachable; local changes stay queued")]
    Offline,
    #[error("Refusing to wipe local data without --yes")]
    WipeNotConfirmed,
}
