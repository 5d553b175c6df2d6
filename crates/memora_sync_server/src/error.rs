//! Error types for the sync server.

use memora_sync_protocol::http::HttpResponse;
use memora_sync_protocol::{ConflictBody, ConflictResponse, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed body or headers.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Grade, study time or state failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] memora_scheduler::SchedulerError),

    /// No authenticated user on the request.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Unknown method or path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write was rejected against the stored version.
    #[error("conflict: {:?} (server {}, client {})", .0.conflict_type, .0.server_version, .0.client_version)]
    Conflict(Box<ConflictBody>),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Validation(inner) => ServerError::Validation(inner),
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}

impl ServerError {
    /// Returns the HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Validation(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotFound(_) => 404,
            ServerError::Conflict(_) => 409,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Renders the error as a response; conflicts carry `{"conflict": {...}}`.
    pub fn into_response(self) -> HttpResponse {
        let status = self.status_code();
        match self {
            ServerError::Conflict(conflict) => {
                let body = ConflictResponse {
                    conflict: *conflict,
                };
                HttpResponse::json(status, &body)
                    .unwrap_or_else(|e| HttpResponse::error(500, &e.to_string()))
            }
            other => HttpResponse::error(status, &other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memora_scheduler::SchedulerError;
    use memora_sync_protocol::ConflictType;
    use serde_json::json;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Validation(SchedulerError::InvalidGrade(7)).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert_eq!(ServerError::AuthenticationFailed("x".into()).status_code(), 401);
    }

    #[test]
    fn protocol_validation_maps_to_validation() {
        let err: ServerError = ProtocolError::Validation(SchedulerError::InvalidGrade(9)).into();
        assert!(matches!(err, ServerError::Validation(_)));
        let err: ServerError = ProtocolError::invalid_payload("cardId").into();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[test]
    fn conflict_response_body() {
        let err = ServerError::Conflict(Box::new(ConflictBody {
            conflict_type: ConflictType::Version,
            server_version: 5,
            client_version: 3,
            server_data: json!({"lastModified": "2024-01-01T00:00:00Z"}),
        }));
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('3'));

        let response = err.into_response();
        assert_eq!(response.status, 409);
        let body: ConflictResponse = response.decode().unwrap();
        assert_eq!(body.conflict.conflict_type, ConflictType::Version);
        assert_eq!(body.conflict.server_version, 5);
    }

    #[test]
    fn plain_error_body() {
        let response = ServerError::NotFound("/nope".into()).into_response();
        assert_eq!(response.status, 404);
        assert_eq!(response.error_message(), "not found: /nope");
    }
}
