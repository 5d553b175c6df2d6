//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A payload did not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A request failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] memora_scheduler::SchedulerError),
}

impl ProtocolError {
    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }
}
