//! Transport layer abstraction for the remote progress service.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use memora_sync_protocol::{
    ConflictBody, ProgressAccepted, ProgressRequest, RemoteReply, RequestMeta, StatsDelta,
    StudySession,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The authoritative store the sync engine talks to.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing).
#[async_trait]
pub trait RemoteProgressService: Send + Sync {
    /// `POST /progress`: writes one card. A 409 is returned as
    /// [`RemoteReply::Conflict`], not as an error.
    async fn post_progress(
        &self,
        meta: &RequestMeta,
        request: &ProgressRequest,
    ) -> SyncResult<RemoteReply<ProgressAccepted>>;

    /// `GET /progress`: all rows for the user, newest review first.
    async fn get_progress(&self, meta: &RequestMeta) -> SyncResult<Vec<ProgressAccepted>>;

    /// `POST /stats`: increments daily aggregates.
    async fn post_stats(&self, meta: &RequestMeta, deltas: &[StatsDelta]) -> SyncResult<()>;

    /// `POST /sessions`: stores a finished session.
    async fn post_session(&self, meta: &RequestMeta, session: &StudySession) -> SyncResult<()>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Scripted reply for [`MockTransport::post_progress`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Accept the request and echo its state at the request version.
    Accept,
    /// Accept with this canonical state.
    AcceptWith(ProgressAccepted),
    /// Reject with a conflict.
    Conflict(ConflictBody),
    /// Fail with a retryable transport error.
    Fail(String),
    /// Fail with a non-retryable transport error.
    Fatal(String),
}

/// A mock transport for testing.
///
/// Progress writes consume scripted replies in order and fall back to
/// [`MockReply::Accept`] once the script is empty. Every call is recorded.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    latency: Mutex<Duration>,
    replies: Mutex<VecDeque<MockReply>>,
    remote_rows: Mutex<Vec<ProgressAccepted>>,
    progress_sent: Mutex<Vec<(RequestMeta, ProgressRequest)>>,
    stats_sent: Mutex<Vec<StatsDelta>>,
    sessions_sent: Mutex<Vec<StudySession>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a new connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            replies: Mutex::new(VecDeque::new()),
            remote_rows: Mutex::new(Vec::new()),
            progress_sent: Mutex::new(Vec::new()),
            stats_sent: Mutex::new(Vec::new()),
            sessions_sent: Mutex::new(Vec::new()),
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Sets the simulated latency of every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Appends a scripted progress reply.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Sets the rows returned by `get_progress`.
    pub fn set_remote_rows(&self, rows: Vec<ProgressAccepted>) {
        *self.remote_rows.lock() = rows;
    }

    /// Progress requests received so far.
    pub fn progress_sent(&self) -> Vec<(RequestMeta, ProgressRequest)> {
        self.progress_sent.lock().clone()
    }

    /// Stats deltas received so far.
    pub fn stats_sent(&self) -> Vec<StatsDelta> {
        self.stats_sent.lock().clone()
    }

    /// Sessions received so far.
    pub fn sessions_sent(&self) -> Vec<StudySession> {
        self.sessions_sent.lock().clone()
    }

    async fn round_trip(&self) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteProgressService for MockTransport {
    async fn post_progress(
        &self,
        meta: &RequestMeta,
        request: &ProgressRequest,
    ) -> SyncResult<RemoteReply<ProgressAccepted>> {
        self.round_trip().await?;
        self.progress_sent
            .lock()
            .push((meta.clone(), request.clone()));

        let reply = self.replies.lock().pop_front().unwrap_or(MockReply::Accept);
        match reply {
            MockReply::Accept => {
                let state = request
                    .state
                    .clone()
                    .ok_or_else(|| SyncError::transport_fatal("request carries no state"))?;
                let accepted = ProgressAccepted::new(
                    request.card_id.clone(),
                    state,
                    request.version,
                    request.last_modified.unwrap_or_else(chrono::Utc::now),
                )?;
                Ok(RemoteReply::Accepted(accepted))
            }
            MockReply::AcceptWith(accepted) => Ok(RemoteReply::Accepted(accepted)),
            MockReply::Conflict(body) => Ok(RemoteReply::Conflict(body)),
            MockReply::Fail(message) => Err(SyncError::transport_retryable(message)),
            MockReply::Fatal(message) => Err(SyncError::transport_fatal(message)),
        }
    }

    async fn get_progress(&self, _meta: &RequestMeta) -> SyncResult<Vec<ProgressAccepted>> {
        self.round_trip().await?;
        Ok(self.remote_rows.lock().clone())
    }

    async fn post_stats(&self, _meta: &RequestMeta, deltas: &[StatsDelta]) -> SyncResult<()> {
        self.round_trip().await?;
        self.stats_sent.lock().extend_from_slice(deltas);
        Ok(())
    }

    async fn post_session(&self, _meta: &RequestMeta, session: &StudySession) -> SyncResult<()> {
        self.round_trip().await?;
        self.sessions_sent.lock().push(session.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
