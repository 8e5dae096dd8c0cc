use std::path::PathBuf;

use thiserror::Error;

use crate::types::RecordId;

/// Result type for volley operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading, dispatching or archiving batches.
#[derive(Debug, Error)]
pub enum Error {
    /// The batch source violates a schema-level invariant
    #[error("Invalid batch {batch}: {source}")]
    Structural {
        batch: String,
        #[source]
        source: BatchError,
    },

    /// Configuration cannot be resolved (including rate limits)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The output log could not be appended to
    #[error("Failed to write result log {path}: {source}")]
    Writer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors that reject a batch before any send happens.
    ///
    /// The pipeline skips such batches and leaves them in place; every other
    /// error is fatal to the drain in progress.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Structural { .. } | Error::Config(_))
    }
}

/// Schema-level problems found while reading a batch source.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    /// An entry could not be parsed
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    /// Two entries share the same id
    #[error("line {line}: duplicate record id {id}")]
    DuplicateId { line: usize, id: RecordId },

    /// An entry names a destination with no registered adapter
    #[error("line {line}: unknown destination '{destination}'")]
    UnknownDestination { line: usize, destination: String },
}
