//! The progress service front end.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, ReplayKey, RequestHandler};
use crate::store::ServerStore;
use chrono::{DateTime, Utc};
use memora_sync_protocol::http::{
    HttpRequest, HttpResponse, Method, HEADER_USER_ID, PATH_PROGRESS, PATH_SESSIONS, PATH_STATS,
};
use memora_sync_protocol::{ProgressRequest, StatsDelta, StudySession};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// The sync server.
///
/// Routes [`HttpRequest`]s to the handlers and renders every outcome,
/// errors included, as an [`HttpResponse`]. Writes are remembered by
/// `X-Operation-ID` and request body, so a retried request gets the
/// original answer instead of being applied twice.
///
/// # Example
///
/// ```
/// use memora_sync_server::{SyncServer, ServerConfig};
/// use memora_sync_protocol::http::{HttpRequest, PATH_PROGRESS};
/// use memora_sync_protocol::RequestMeta;
/// use uuid::Uuid;
///
/// let server = SyncServer::new(ServerConfig::default());
/// let meta = RequestMeta::new("device-1", Uuid::new_v4()).with_user("user-1");
/// let response = server.handle(&HttpRequest::get(PATH_PROGRESS).with_meta(&meta));
/// assert_eq!(response.status, 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server with an empty store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(ServerStore::new()))
    }

    /// Creates a sync server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<ServerStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the shared store.
    pub fn store(&self) -> &Arc<ServerStore> {
        &self.context.store
    }

    /// Handles a request at the current time.
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self.handle_at(request, Utc::now())
    }

    /// Handles a request as if received at `now`.
    pub fn handle_at(&self, request: &HttpRequest, now: DateTime<Utc>) -> HttpResponse {
        match self.dispatch(request, now) {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    tracing::error!(path = %request.path, error = %e, "request failed");
                } else {
                    tracing::debug!(path = %request.path, error = %e, "request rejected");
                }
                e.into_response()
            }
        }
    }

    fn dispatch(&self, request: &HttpRequest, now: DateTime<Utc>) -> ServerResult<HttpResponse> {
        let meta = request.meta()?;
        let user_id = meta
            .user_id
            .as_deref()
            .ok_or_else(|| ServerError::AuthenticationFailed(format!("missing {HEADER_USER_ID}")))?;

        if request.method == Method::Get {
            return match request.path.as_str() {
                PATH_PROGRESS => ok_json(&self.handler.handle_progress_list(user_id)?),
                other => Err(ServerError::NotFound(format!("GET {other}"))),
            };
        }

        let key = replay_key(meta.operation_id, request);
        if let Some(response) = self.context.replayed(&key) {
            tracing::debug!(operation_id = %meta.operation_id, "replaying response");
            return Ok(response);
        }

        let response = match self.write(user_id, request, now) {
            Ok(response) => response,
            Err(e) if e.is_client_error() => e.into_response(),
            Err(e) => return Err(e),
        };
        self.context.remember(key, response.clone());
        Ok(response)
    }

    fn write(
        &self,
        user_id: &str,
        request: &HttpRequest,
        now: DateTime<Utc>,
    ) -> ServerResult<HttpResponse> {
        match request.path.as_str() {
            PATH_PROGRESS => {
                let body: ProgressRequest = request.json()?;
                ok_json(&self.handler.handle_progress_write(user_id, &body, now)?)
            }
            PATH_STATS => {
                let deltas: Vec<StatsDelta> = request.json()?;
                let merged = self.handler.handle_stats(user_id, &deltas)?;
                ok_json(&serde_json::json!({ "merged": merged }))
            }
            PATH_SESSIONS => {
                let session: StudySession = request.json()?;
                let stored = self.handler.handle_session(user_id, session)?;
                ok_json(&serde_json::json!({ "stored": stored }))
            }
            other => Err(ServerError::NotFound(format!("POST {other}"))),
        }
    }

    /// Returns the number of stored progress rows.
    pub fn progress_count(&self) -> usize {
        self.context.store.progress_count()
    }

    /// Returns the number of stored sessions.
    pub fn session_count(&self) -> usize {
        self.context.store.session_count()
    }
}

fn ok_json<T: Serialize + ?Sized>(body: &T) -> ServerResult<HttpResponse> {
    HttpResponse::json(200, body).map_err(|e| ServerError::Internal(e.to_string()))
}

fn replay_key(operation_id: uuid::Uuid, request: &HttpRequest) -> ReplayKey {
    let mut hasher = Sha256::new();
    hasher.update(request.path.as_bytes());
    hasher.update([0]);
    hasher.update(&request.body);
    (operation_id, hasher.finalize().into())
}
