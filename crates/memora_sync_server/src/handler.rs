//! Request handlers for the progress service endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::ServerStore;
use chrono::{DateTime, Utc};
use memora_sync_protocol::http::HttpResponse;
use memora_sync_protocol::{ProgressAccepted, ProgressRequest, StatsDelta, StudySession};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Operation ID plus a digest of the request it arrived with.
pub(crate) type ReplayKey = (Uuid, [u8; 32]);

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Server state (shared across all handlers).
    pub store: Arc<ServerStore>,
    replay: Mutex<ReplayCache>,
}

/// Bounded map of already answered writes, oldest evicted first.
struct ReplayCache {
    responses: HashMap<ReplayKey, HttpResponse>,
    order: VecDeque<ReplayKey>,
    capacity: usize,
}

impl ReplayCache {
    fn new(capacity: usize) -> Self {
        Self {
            responses: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, key: ReplayKey, response: HttpResponse) {
        if self.capacity == 0 {
            return;
        }
        if self.responses.insert(key, response).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.responses.remove(&oldest);
            }
        }
    }
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<ServerStore>) -> Self {
        let replay = Mutex::new(ReplayCache::new(config.replay_cache_size));
        Self {
            config,
            store,
            replay,
        }
    }

    /// Returns the response already sent for `key`, if any.
    pub(crate) fn replayed(&self, key: &ReplayKey) -> Option<HttpResponse> {
        self.replay.lock().responses.get(key).cloned()
    }

    /// Remembers the response sent for `key`.
    pub(crate) fn remember(&self, key: ReplayKey, response: HttpResponse) {
        self.replay.lock().insert(key, response);
    }

    /// Returns the number of remembered responses.
    pub fn replay_len(&self) -> usize {
        self.replay.lock().responses.len()
    }
}

/// Handler for progress service requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles `POST /progress`.
    pub fn handle_progress_write(
        &self,
        user_id: &str,
        request: &ProgressRequest,
        now: DateTime<Utc>,
    ) -> ServerResult<ProgressAccepted> {
        let write = self
            .context
            .store
            .write_progress(user_id, request, &self.context.config, now)?;
        Ok(write.into_accepted())
    }

    /// Handles `GET /progress`.
    pub fn handle_progress_list(&self, user_id: &str) -> ServerResult<Vec<ProgressAccepted>> {
        Ok(self
            .context
            .store
            .list_progress(user_id)
            .iter()
            .map(ProgressAccepted::from_record)
            .collect())
    }

    /// Handles `POST /stats`. Returns the number of deltas merged.
    pub fn handle_stats(&self, user_id: &str, deltas: &[StatsDelta]) -> ServerResult<usize> {
        let max = self.context.config.max_stats_batch;
        if deltas.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "stats batch of {} exceeds limit {max}",
                deltas.len()
            )));
        }
        let merged = self.context.store.merge_stats(user_id, deltas)?;
        tracing::debug!(user_id, merged, "stats merged");
        Ok(merged)
    }

    /// Handles `POST /sessions`. Returns true if the session was new.
    pub fn handle_session(&self, user_id: &str, session: StudySession) -> ServerResult<bool> {
        let session_id = session.id.clone();
        let stored = self.context.store.store_session(user_id, session)?;
        tracing::debug!(user_id, session_id = %session_id, stored, "session received");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use memora_scheduler::Grade;

    fn handler(config: ServerConfig) -> RequestHandler {
        let context = Arc::new(HandlerContext::new(config, Arc::new(ServerStore::new())));
        RequestHandler::new(context)
    }

    #[test]
    fn stats_batch_limit() {
        let handler = handler(ServerConfig::default().with_max_stats_batch(2));
        let day = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap().date_naive();
        let delta = StatsDelta::for_review(day, Grade::Good, 5, false, true);

        assert_eq!(handler.handle_stats("u1", &[delta.clone(), delta.clone()]).unwrap(), 2);
        let err = handler
            .handle_stats("u1", &[delta.clone(), delta.clone(), delta])
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
        assert_eq!(handler.handle_stats("u1", &[]).unwrap(), 0);
    }

    #[test]
    fn replay_cache_evicts_oldest() {
        let context = HandlerContext::new(
            ServerConfig::default().with_replay_cache_size(2),
            Arc::new(ServerStore::new()),
        );
        let keys: Vec<ReplayKey> = (0u8..3).map(|i| (Uuid::new_v4(), [i; 32])).collect();
        for key in &keys {
            context.remember(*key, HttpResponse::error(400, "x"));
        }
        assert_eq!(context.replay_len(), 2);
        assert!(context.replayed(&keys[0]).is_none());
        assert!(context.replayed(&keys[2]).is_some());
    }

    #[test]
    fn disabled_replay_cache() {
        let context = HandlerContext::new(
            ServerConfig::default().with_replay_cache_size(0),
            Arc::new(ServerStore::new()),
        );
        let key = (Uuid::new_v4(), [0; 32]);
        context.remember(key, HttpResponse::error(400, "x"));
        assert!(context.replayed(&key).is_none());
    }
}
