//! Error types shared by the buffer, committer and editor

use serde::{Deserialize, Serialize};

/// Local buffer misuse. Raised synchronously, never after a network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Row index {index} out of bounds (buffer has {len} rows)")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Field '{field}' is computed by the server and cannot be edited")]
    ReadOnlyField { field: String },

    #[error("Field '{field}' must be a finite number")]
    NonFiniteNumber { field: String },

    #[error("Invalid buffer snapshot: {message}")]
    InvalidSnapshot { message: String },
}

/// Outcome of a single row that could not be committed.
///
/// Row errors are collected into the failure list and never abort the
/// surrounding commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RowError {
    #[error("Missing required field: {field}")]
    Validation { field: String },

    #[error("Timeout")]
    Timeout,

    #[error("{message}")]
    ServerRejection { message: String },
}

impl RowError {
    /// Whether re-sending the row unchanged can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RowError::Validation { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to serialize recovery entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {message}")]
    Storage { message: String },
}

/// Top-level editor errors. Each aborts the whole action it was raised from.
#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("A commit is already in progress")]
    AlreadyCommitting,

    #[error("New rows cannot be saved before the parent record exists")]
    MissingParent,

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Remote store error: {message}")]
    Remote { message: String },
}
