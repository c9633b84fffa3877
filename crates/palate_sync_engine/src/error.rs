//! Error taxonomy for sync operations.

use palate_core::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No response from the remote store.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// A remote call exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// The remote store rejected an update on a stale version precondition.
    #[error("version conflict for {id} in {collection}")]
    VersionConflict {
        /// Collection holding the record.
        collection: String,
        /// Record id.
        id: String,
    },

    /// The remote store rejected the request body (4xx other than a version
    /// conflict). Never retried.
    #[error("validation rejected (status {status}): {message}")]
    Validation {
        /// HTTP status code returned.
        status: u16,
        /// Server-provided diagnostic message.
        message: String,
    },

    /// The remote store no longer holds the record (404). Interpreted as a
    /// remote deletion, not a failure.
    #[error("{id} not found in {collection}")]
    NotFound {
        /// Collection searched.
        collection: String,
        /// Record id.
        id: String,
    },

    /// The remote store failed internally (5xx).
    #[error("server error: {message}")]
    Server {
        /// Server-provided diagnostic message.
        message: String,
    },

    /// Local store failure; fatal to the current cycle.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// A sync cycle is already in flight.
    #[error("a sync cycle is already in flight")]
    Busy,

    /// The online signal reports no connectivity; no cycle was started.
    #[error("client is offline")]
    Offline,

    /// The cycle was cancelled between remote calls.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a version-conflict error for a record.
    pub fn version_conflict(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::VersionConflict {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates a not-found error for a record.
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Returns true if the operation may be retried with backoff.
    ///
    /// Version conflicts are deliberately not retryable: they are routed to
    /// the conflict resolver instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network { .. } | SyncError::Timeout | SyncError::Server { .. }
        )
    }
}
