//! Error types for docsync core.

use docsync_codec::CodecError;
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by document operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Delete or purge of a document that does not exist.
    #[error("document not found: {doc_id}")]
    NotFound {
        /// The document id.
        doc_id: String,
    },

    /// A `FailOnConflict` save or delete lost to a concurrent writer.
    #[error("conflict saving document {doc_id}")]
    Conflict {
        /// The document id.
        doc_id: String,
    },

    /// Write contention; the caller may retry a bounded number of times.
    #[error("database busy")]
    Busy,

    /// The operation is not valid in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the violated state.
        message: String,
    },

    /// A revision's generation does not follow its ancestry, or no child
    /// can be derived from it.
    #[error("invalid revision {rev_id} of {doc_id}: {reason}")]
    InvalidRevision {
        /// The document id.
        doc_id: String,
        /// The offending revision id.
        rev_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Document ids must be non-empty strings.
    #[error("invalid document id: {id:?}")]
    InvalidDocumentId {
        /// The rejected id.
        id: String,
    },

    /// Storage failure other than contention.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Body encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl CoreError {
    /// Creates a not found error.
    pub fn not_found(doc_id: impl Into<String>) -> Self {
        Self::NotFound {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an invalid revision error.
    pub fn invalid_revision(
        doc_id: impl Into<String>,
        rev_id: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidRevision {
            doc_id: doc_id.into(),
            rev_id: rev_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Busy | StorageError::Aborted { .. } => Self::Busy,
            StorageError::InvalidDocumentId(id) => Self::InvalidDocumentId { id },
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_maps_to_busy() {
        assert!(CoreError::from(StorageError::Busy).is_busy());
        let aborted = StorageError::Aborted {
            doc_id: "a".into(),
            expected: "1-a".into(),
            actual: "2-b".into(),
        };
        assert!(CoreError::from(aborted).is_busy());
    }

    #[test]
    fn other_storage_errors_pass_through() {
        let err = CoreError::from(StorageError::Corrupted("bad".into()));
        assert!(matches!(err, CoreError::Storage(_)));
        assert!(!err.is_busy());

        let err = CoreError::from(StorageError::InvalidDocumentId(String::new()));
        assert!(matches!(err, CoreError::InvalidDocumentId { .. }));
    }
}
