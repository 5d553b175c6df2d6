//! HTTP contract of the remote progress service.
//!
//! Requests and responses are plain values so that both the client transport
//! and the reference service can share them without a network stack.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::RequestMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Progress endpoint: `POST` writes one card, `GET` lists all cards.
pub const PATH_PROGRESS: &str = "/progress";
/// Daily statistics endpoint.
pub const PATH_STATS: &str = "/stats";
/// Study sessions endpoint.
pub const PATH_SESSIONS: &str = "/sessions";

/// Device identifier header.
pub const HEADER_DEVICE_ID: &str = "X-Device-ID";
/// Operation identifier header.
pub const HEADER_OPERATION_ID: &str = "X-Operation-ID";
/// Client version header.
pub const HEADER_CLIENT_VERSION: &str = "X-Client-Version";
/// Authenticated user header.
pub const HEADER_USER_ID: &str = "X-User-ID";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Path, starting with `/`.
    pub path: String,
    /// Headers.
    pub headers: BTreeMap<String, String>,
    /// JSON body, empty for `GET`.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Creates a `POST` request with a JSON body.
    pub fn post_json<T: Serialize + ?Sized>(path: impl Into<String>, body: &T) -> ProtocolResult<Self> {
        Ok(Self {
            method: Method::Post,
            path: path.into(),
            headers: BTreeMap::new(),
            body: serde_json::to_vec(body)?,
        })
    }

    /// Adds the sync headers.
    pub fn with_meta(mut self, meta: &RequestMeta) -> Self {
        self.headers
            .insert(HEADER_DEVICE_ID.to_string(), meta.device_id.clone());
        self.headers
            .insert(HEADER_OPERATION_ID.to_string(), meta.operation_id.to_string());
        self.headers
            .insert(HEADER_CLIENT_VERSION.to_string(), meta.client_version.clone());
        if let Some(user_id) = &meta.user_id {
            self.headers.insert(HEADER_USER_ID.to_string(), user_id.clone());
        }
        self
    }

    /// Reads the sync headers.
    pub fn meta(&self) -> ProtocolResult<RequestMeta> {
        let header = |name: &str| {
            self.headers
                .get(name)
                .cloned()
                .ok_or_else(|| ProtocolError::invalid_payload(format!("missing header {name}")))
        };
        let operation_id = Uuid::parse_str(&header(HEADER_OPERATION_ID)?).map_err(|e| {
            ProtocolError::invalid_payload(format!("invalid {HEADER_OPERATION_ID}: {e}"))
        })?;
        Ok(RequestMeta {
            device_id: header(HEADER_DEVICE_ID)?,
            operation_id,
            client_version: header(HEADER_CLIENT_VERSION)?,
            user_id: self.headers.get(HEADER_USER_ID).cloned(),
        })
    }

    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// JSON body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a JSON body.
    pub fn json<T: Serialize + ?Sized>(status: u16, body: &T) -> ProtocolResult<Self> {
        Ok(Self {
            status,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Creates a `{"error": message}` response.
    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message });
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    /// Decodes the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Returns the `error` field of an error body, or the raw body.
    pub fn error_message(&self) -> String {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|value| value.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).into_owned())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
