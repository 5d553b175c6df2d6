//! Error types for the sync engine.

use memora_sync_protocol::ConflictType;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Local store failure.
    #[error("storage error: {0}")]
    Storage(#[from] memora_storage::StorageError),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(#[from] memora_sync_protocol::ProtocolError),

    /// Review input was rejected before anything was stored.
    #[error("validation failed: {0}")]
    Validation(#[from] memora_scheduler::SchedulerError),

    /// Conflict that requires manual resolution.
    #[error("unresolved {conflict_type:?} conflict for {entity_id}")]
    Conflict {
        /// Entity ID.
        entity_id: String,
        /// Kind of conflict.
        conflict_type: ConflictType,
    },

    /// Server rejected the request.
    #[error("server error {status}: {message}")]
    ServerError {
        /// HTTP status.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The sync driver has stopped.
    #[error("sync driver shut down")]
    ShutDown,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            SyncError::Timeout => true,
            SyncError::ServerError { status, .. } => *status >= 500,
            SyncError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}
