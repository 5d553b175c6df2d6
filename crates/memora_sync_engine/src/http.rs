//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, an in-process loopback, etc.).

use crate::error::{SyncError, SyncResult};
use crate::transport::RemoteProgressService;
use async_trait::async_trait;
use memora_sync_protocol::http::{
    HttpRequest, HttpResponse, PATH_PROGRESS, PATH_SESSIONS, PATH_STATS,
};
use memora_sync_protocol::{
    ConflictResponse, ProgressAccepted, ProgressRequest, RemoteReply, RequestMeta, StatsDelta,
    StudySession,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends `request` to `base_url` and returns the response.
    ///
    /// An `Err` means no response was received (DNS, connect, reset).
    async fn send(&self, base_url: &str, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based remote progress service.
///
/// Bodies are JSON. Status mapping:
///
/// | Status | Result |
/// |---|---|
/// | 2xx | decoded body |
/// | 409 on `POST /progress` | [`RemoteReply::Conflict`] |
/// | 408, 429 | retryable transport error |
/// | other 4xx | non-retryable transport error |
/// | 5xx | retryable [`SyncError::ServerError`] |
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the progress service (e.g., "https://api.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Connection state.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Stops sending requests until [`HttpTransport::reopen`] is called.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Allows requests again after [`HttpTransport::close`].
    pub fn reopen(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn exchange(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let response = self
            .client
            .send(&self.base_url, request)
            .await
            .map_err(|e| {
                *self.last_error.write() = Some(e.clone());
                SyncError::transport_retryable(e)
            })?;

        *self.last_error.write() = None;
        Ok(response)
    }

    fn check_status(response: &HttpResponse) -> SyncResult<()> {
        match response.status {
            200..=299 => Ok(()),
            408 | 429 => Err(SyncError::transport_retryable(format!(
                "{}: {}",
                response.status,
                response.error_message()
            ))),
            400..=499 => Err(SyncError::transport_fatal(format!(
                "{}: {}",
                response.status,
                response.error_message()
            ))),
            status => Err(SyncError::ServerError {
                status,
                message: response.error_message(),
            }),
        }
    }
}

#[async_trait]
impl<C: HttpClient> RemoteProgressService for HttpTransport<C> {
    async fn post_progress(
        &self,
        meta: &RequestMeta,
        request: &ProgressRequest,
    ) -> SyncResult<RemoteReply<ProgressAccepted>> {
        let http = HttpRequest::post_json(PATH_PROGRESS, request)?.with_meta(meta);
        let response = self.exchange(http).await?;

        if response.status == 409 {
            let body: ConflictResponse = response.decode()?;
            return Ok(RemoteReply::Conflict(body.conflict));
        }
        Self::check_status(&response)?;
        Ok(RemoteReply::Accepted(response.decode()?))
    }

    async fn get_progress(&self, meta: &RequestMeta) -> SyncResult<Vec<ProgressAccepted>> {
        let response = self
            .exchange(HttpRequest::get(PATH_PROGRESS).with_meta(meta))
            .await?;
        Self::check_status(&response)?;
        Ok(response.decode()?)
    }

    async fn post_stats(&self, meta: &RequestMeta, deltas: &[StatsDelta]) -> SyncResult<()> {
        let http = HttpRequest::post_json(PATH_STATS, deltas)?.with_meta(meta);
        let response = self.exchange(http).await?;
        Self::check_status(&response)
    }

    async fn post_session(&self, meta: &RequestMeta, session: &StudySession) -> SyncResult<()> {
        let http = HttpRequest::post_json(PATH_SESSIONS, session)?.with_meta(meta);
        let response = self.exchange(http).await?;
        Self::check_status(&response)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead. Toggling
/// [`LoopbackClient::set_online`] simulates losing the network.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    online: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    /// Simulates the network going up or down.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns the wrapped server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn send(&self, _base_url: &str, request: HttpRequest) -> Result<HttpResponse, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }
        Ok(self.server.handle(&request))
    }

    fn is_healthy(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use memora_scheduler::CardState;
    use memora_sync_protocol::http::Method;
    use memora_sync_protocol::ConflictType;
    use parking_lot::Mutex;
    use serde_json::json;
    use uuid::Uuid;

    struct TestServer {
        status: Mutex<u16>,
        body: Mutex<Vec<u8>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl TestServer {
        fn new(status: u16, body: serde_json::Value) -> Self {
            Self {
                status: Mutex::new(status),
                body: Mutex::new(body.to_string().into_bytes()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl LoopbackServer for TestServer {
        fn handle(&self, request: &HttpRequest) -> HttpResponse {
            self.seen.lock().push(request.clone());
            HttpResponse {
                status: *self.status.lock(),
                body: self.body.lock().clone(),
            }
        }
    }

    fn meta() -> RequestMeta {
        RequestMeta::new("device-1", Uuid::new_v4())
    }

    fn request() -> ProgressRequest {
        ProgressRequest {
            card_id: "card-1".into(),
            grade: 2,
            study_time_seconds: 4,
            session_id: None,
            checksum: None,
            last_modified: None,
            settings: None,
            version: 1,
            state: Some(CardState::new_card(2.5)),
        }
    }

    fn transport(status: u16, body: serde_json::Value) -> HttpTransport<LoopbackClient<TestServer>> {
        HttpTransport::new(
            "https://memora.test",
            LoopbackClient::new(TestServer::new(status, body)),
        )
    }

    #[tokio::test]
    async fn transport_creation() {
        let transport = transport(200, json!({}));
        assert_eq!(transport.base_url(), "https://memora.test");
        assert!(transport.is_connected());

        transport.close();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.get_progress(&meta()).await,
            Err(SyncError::NotConnected)
        ));
        transport.reopen();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn accepted_progress_is_decoded() {
        let accepted = ProgressAccepted::new(
            "card-1",
            CardState::new_card(2.5),
            2,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let transport = transport(200, serde_json::to_value(&accepted).unwrap());

        let meta = meta();
        let reply = transport.post_progress(&meta, &request()).await.unwrap();
        assert_eq!(reply, RemoteReply::Accepted(accepted));

        let seen = transport.client().server().seen.lock().clone();
        assert_eq!(seen[0].method, Method::Post);
        assert_eq!(seen[0].path, PATH_PROGRESS);
        assert_eq!(seen[0].meta().unwrap(), meta);
    }

    #[tokio::test]
    async fn conflict_is_a_reply_not_an_error() {
        let body = json!({
            "conflict": {
                "type": "concurrent",
                "serverVersion": 4,
                "clientVersion": 2,
                "serverData": {"lastModified": "2024-01-01T00:00:00Z"}
            }
        });
        let transport = transport(409, body);
        match transport.post_progress(&meta(), &request()).await.unwrap() {
            RemoteReply::Conflict(conflict) => {
                assert_eq!(conflict.conflict_type, ConflictType::Concurrent);
                assert_eq!(conflict.server_version, 4);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_mapping() {
        let err = transport(400, json!({"error": "grade must be 0-3"}))
            .post_progress(&meta(), &request())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("grade must be 0-3"));

        let err = transport(429, json!({"error": "slow down"}))
            .post_stats(&meta(), &[])
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let err = transport(503, json!({"error": "maintenance"}))
            .post_stats(&meta(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ServerError { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn offline_client_is_not_connected() {
        let transport = transport(200, json!([]));
        transport.client().set_online(false);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.get_progress(&meta()).await,
            Err(SyncError::NotConnected)
        ));

        transport.client().set_online(true);
        assert!(transport.get_progress(&meta()).await.unwrap().is_empty());
        assert_eq!(transport.last_error(), None);
    }
}
