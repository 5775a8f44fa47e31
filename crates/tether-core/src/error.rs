use std::path::PathBuf;

use thiserror::Error;

/// A record or mutation that would break a registry invariant.
///
/// Rejected synchronously; nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("run id must not be blank")]
    BlankRunId,

    #[error("run {0:?} is already registered")]
    DuplicateRunId(String),

    #[error("run {run_id:?}: {field} set out of order ({detail})")]
    OutOfOrder {
        run_id: String,
        field: &'static str,
        detail: String,
    },

    #[error("run {0:?}: cleanupHandled requires cleanupCompletedAt")]
    MissingCleanupTimestamp(String),
}

/// Errors reading or writing the registry file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode registry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed registry document: {0}")]
    Malformed(String),

    #[error("unsupported registry version {0}")]
    UnsupportedVersion(u64),
}

/// Errors surfaced by the completion pipeline's public operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run {0:?} is not registered")]
    UnknownRun(String),
}
