//! Error types for revision storage.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store could not take its write lock in time.
    #[error("store is busy")]
    Busy,

    /// The expected parent no longer matches the current revision.
    #[error("commit aborted for '{doc_id}': expected parent {expected}, found {actual}")]
    Aborted {
        /// Document being committed.
        doc_id: String,
        /// Parent the caller resolved against.
        expected: String,
        /// Revision actually current in the store.
        actual: String,
    },

    /// The log file is corrupted beyond the recoverable tail.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store directory.
    #[error("store at {path} is locked by another process")]
    Locked {
        /// Directory that could not be locked.
        path: PathBuf,
    },

    /// Document ids must be non-empty.
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),

    /// A revision id string did not parse.
    #[error("invalid revision id: {0:?}")]
    InvalidRevisionId(String),

    /// A log record failed to encode or decode.
    #[error("record encoding error: {0}")]
    Encoding(String),
}

impl StorageError {
    /// Returns true for errors caused by write contention, which a caller
    /// may retry.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Busy | Self::Aborted { .. })
    }
}
