//! Durable, ordered, deduplicated queue of pending operations.

use crate::config::RetryConfig;
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use memora_storage::{StorageBackend, StorageResult};
use memora_sync_protocol::{EntityType, OperationType, Priority, SyncOperation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Persisted form of the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueDocument {
    #[serde(default)]
    active: Vec<SyncOperation>,
    #[serde(default)]
    parked: Vec<SyncOperation>,
}

impl QueueDocument {
    fn sort(&mut self) {
        self.active
            .sort_by(|a, b| a.priority.cmp(&b.priority).then(a.timestamp.cmp(&b.timestamp)));
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.active.iter().position(|op| op.id == id)
    }
}

/// What happened to an operation after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Rescheduled; the operation is not drained before `next_attempt_at`.
    Retry {
        /// Attempts so far.
        attempt: u32,
        /// Backoff applied.
        delay: Duration,
        /// Earliest next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry ceiling reached; moved to the conflict list.
    Parked,
    /// The operation is no longer queued.
    Missing,
}

/// Queue of pending sync operations for one user.
///
/// # Ordering
///
/// Stable sort by priority (`high < medium < low`), then by timestamp. The
/// same rule is applied after every insert and on load.
///
/// # Deduplication
///
/// An operation with the same `(entity_type, entity_id, op_type)` as a queued
/// one replaces that operation's payload and timestamp. Its ID and retry
/// count are kept.
///
/// # Durability
///
/// Every mutation is written to the backend under `queue/{user}`. If the
/// write fails the in-memory change is kept, the queue is marked dirty and
/// the error is returned; the next successful write catches up.
pub struct SyncQueue<B> {
    backend: B,
    key: String,
    document: Mutex<QueueDocument>,
    dirty: Mutex<bool>,
}

impl<B: StorageBackend> SyncQueue<B> {
    /// Loads the queue of `user_id`, or starts an empty one.
    pub fn load(backend: B, user_id: &str) -> StorageResult<Self> {
        let key = format!("queue/{user_id}");
        let mut document: QueueDocument = match backend.get(&key)? {
            Some(value) => serde_json::from_value(value)?,
            None => QueueDocument::default(),
        };
        document.sort();
        tracing::debug!(
            user_id,
            active = document.active.len(),
            parked = document.parked.len(),
            "loaded sync queue"
        );
        Ok(Self {
            backend,
            key,
            document: Mutex::new(document),
            dirty: Mutex::new(false),
        })
    }

    /// Writes the queue to the backend.
    pub fn persist(&self) -> StorageResult<()> {
        let document = self.document.lock().clone();
        self.write(&document)
    }

    fn write(&self, document: &QueueDocument) -> StorageResult<()> {
        let result = serde_json::to_value(document)
            .map_err(Into::into)
            .and_then(|value| self.backend.put(&self.key, value));
        let mut dirty = self.dirty.lock();
        match &result {
            Ok(()) => *dirty = false,
            Err(e) => {
                *dirty = true;
                tracing::warn!(key = %self.key, error = %e, "failed to persist sync queue");
            }
        }
        result
    }

    /// Applies `f` to the queue under the lock, then persists.
    fn mutate<T>(&self, f: impl FnOnce(&mut QueueDocument) -> T) -> StorageResult<T> {
        let (out, snapshot) = {
            let mut document = self.document.lock();
            let out = f(&mut document);
            (out, document.clone())
        };
        self.write(&snapshot)?;
        Ok(out)
    }

    /// Returns true if the last write failed.
    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock()
    }

    /// Enqueues `op`, deduplicating against queued operations.
    ///
    /// Returns the ID of the queued operation, which is the existing one's
    /// when deduplicated.
    pub fn enqueue(&self, op: SyncOperation) -> StorageResult<Uuid> {
        self.mutate(|document| {
            let existing = document
                .active
                .iter_mut()
                .find(|queued| queued.dedup_key() == op.dedup_key());
            let id = match existing {
                Some(queued) => {
                    queued.payload = op.payload;
                    queued.timestamp = op.timestamp;
                    queued.priority = queued.priority.min(op.priority);
                    queued.id
                }
                None => {
                    let id = op.id;
                    document.active.push(op);
                    id
                }
            };
            document.sort();
            id
        })
    }

    /// Atomically creates or rewrites the payload of the operation keyed by
    /// `(entity_type, entity_id, op_type)`.
    ///
    /// `f` receives the queued payload, if any, and returns the new one. If
    /// `f` fails the queue is unchanged.
    pub fn upsert_with(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        op_type: OperationType,
        priority: Priority,
        now: DateTime<Utc>,
        f: impl FnOnce(Option<&serde_json::Value>) -> SyncResult<serde_json::Value>,
    ) -> SyncResult<Uuid> {
        let mut document = self.document.lock();
        let index = document.active.iter().position(|queued| {
            queued.dedup_key() == (entity_type, entity_id, op_type)
        });
        let payload = f(index.map(|i| &document.active[i].payload))?;
        let id = match index {
            Some(i) => {
                let queued = &mut document.active[i];
                queued.payload = payload;
                queued.timestamp = now;
                queued.id
            }
            None => {
                let op = SyncOperation::new(op_type, entity_type, entity_id, payload, priority, now);
                let id = op.id;
                document.active.push(op);
                id
            }
        };
        document.sort();
        let snapshot = document.clone();
        drop(document);
        self.write(&snapshot)?;
        Ok(id)
    }

    /// Returns a queued (not parked) operation.
    pub fn find(&self, id: Uuid) -> Option<SyncOperation> {
        let document = self.document.lock();
        document.position(id).map(|i| document.active[i].clone())
    }

    /// Returns true if an operation with this key is queued.
    pub fn contains(&self, entity_type: EntityType, entity_id: &str, op_type: OperationType) -> bool {
        self.document
            .lock()
            .active
            .iter()
            .any(|op| op.dedup_key() == (entity_type, entity_id, op_type))
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.document.lock().active.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.document.lock().active.is_empty()
    }

    /// Queued operations in drain order.
    pub fn snapshot(&self) -> Vec<SyncOperation> {
        self.document.lock().active.clone()
    }

    /// Operations parked in the conflict state.
    pub fn conflicted(&self) -> Vec<SyncOperation> {
        self.document.lock().parked.clone()
    }

    /// Returns up to `limit` operations ready at `now`, in drain order.
    ///
    /// At most one operation per entity is returned, and an operation that
    /// is backing off blocks every later operation for the same entity.
    pub fn take_batch(&self, limit: usize, now: DateTime<Utc>) -> Vec<SyncOperation> {
        let document = self.document.lock();
        let mut blocked = HashSet::new();
        let mut batch = Vec::new();
        for op in &document.active {
            if batch.len() >= limit {
                break;
            }
            let entity = op.entity_key();
            if blocked.contains(&entity) {
                continue;
            }
            blocked.insert(entity);
            if op.is_ready(now) {
                batch.push(op.clone());
            }
        }
        batch
    }

    /// Earliest pending retry time, if any operation is backing off.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.document
            .lock()
            .active
            .iter()
            .filter_map(|op| op.next_attempt_at)
            .min()
    }

    /// Removes an operation after it was applied remotely.
    ///
    /// If the queued payload changed since `sent` was taken (a newer local
    /// mutation was deduplicated into it), the operation stays queued with
    /// its retry state cleared. Returns true if it was removed.
    pub fn complete(&self, sent: &SyncOperation) -> StorageResult<bool> {
        self.mutate(|document| match document.position(sent.id) {
            Some(i) if document.active[i].payload == sent.payload => {
                document.active.remove(i);
                true
            }
            Some(i) => {
                let queued = &mut document.active[i];
                queued.retry_count = 0;
                queued.next_attempt_at = None;
                queued.last_error = None;
                false
            }
            None => false,
        })
    }

    /// Like [`complete`](Self::complete), for payloads that accumulate.
    ///
    /// If the queued payload changed since `sent` was taken, `remaining`
    /// receives it and returns what is still unsent, or `None` when nothing
    /// is left. The check and the rewrite happen under one lock, so a fold
    /// racing the acknowledgement is never lost or sent twice.
    pub fn complete_with(
        &self,
        sent: &SyncOperation,
        remaining: impl FnOnce(&serde_json::Value) -> SyncResult<Option<serde_json::Value>>,
    ) -> SyncResult<bool> {
        let mut document = self.document.lock();
        let Some(i) = document.position(sent.id) else {
            return Ok(false);
        };
        let removed = if document.active[i].payload == sent.payload {
            document.active.remove(i);
            true
        } else {
            match remaining(&document.active[i].payload)? {
                Some(payload) => {
                    let queued = &mut document.active[i];
                    queued.payload = payload;
                    queued.retry_count = 0;
                    queued.next_attempt_at = None;
                    queued.last_error = None;
                    false
                }
                None => {
                    document.active.remove(i);
                    true
                }
            }
        };
        let snapshot = document.clone();
        drop(document);
        self.write(&snapshot)?;
        Ok(removed)
    }

    /// Removes an operation unconditionally.
    pub fn remove(&self, id: Uuid) -> StorageResult<bool> {
        self.mutate(|document| match document.position(id) {
            Some(i) => {
                document.active.remove(i);
                true
            }
            None => false,
        })
    }

    /// Replaces an operation's payload so the next attempt sends it.
    pub fn replace_payload(&self, id: Uuid, payload: serde_json::Value) -> StorageResult<bool> {
        self.mutate(|document| match document.position(id) {
            Some(i) => {
                let queued = &mut document.active[i];
                queued.payload = payload;
                queued.next_attempt_at = None;
                true
            }
            None => false,
        })
    }

    /// Records a failed attempt: backs off, or parks once the ceiling is reached.
    pub fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        retry: &RetryConfig,
    ) -> StorageResult<FailureOutcome> {
        self.mutate(|document| {
            let Some(i) = document.position(id) else {
                return FailureOutcome::Missing;
            };
            let queued = &mut document.active[i];
            queued.retry_count += 1;
            queued.last_error = Some(error.to_string());

            if queued.retry_count >= retry.max_attempts {
                let mut op = document.active.remove(i);
                op.next_attempt_at = None;
                document.parked.push(op);
                return FailureOutcome::Parked;
            }

            let delay = retry.delay_for_retry(queued.retry_count);
            let next_attempt_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            queued.next_attempt_at = Some(next_attempt_at);
            FailureOutcome::Retry {
                attempt: queued.retry_count,
                delay,
                next_attempt_at,
            }
        })
    }

    /// Moves an operation to the conflict list. Returns false if not queued.
    pub fn park(&self, id: Uuid, reason: &str) -> StorageResult<bool> {
        self.mutate(|document| match document.position(id) {
            Some(i) => {
                let mut op = document.active.remove(i);
                op.last_error = Some(reason.to_string());
                op.next_attempt_at = None;
                document.parked.push(op);
                true
            }
            None => false,
        })
    }

    /// Resolves a parked operation: `keep` re-queues it with a fresh retry
    /// budget, otherwise it is discarded. Returns false if not parked.
    pub fn resolve_parked(&self, id: Uuid, keep: bool) -> StorageResult<bool> {
        self.mutate(|document| {
            let Some(i) = document.parked.iter().position(|op| op.id == id) else {
                return false;
            };
            let mut op = document.parked.remove(i);
            if keep {
                op.retry_count = 0;
                op.next_attempt_at = None;
                op.last_error = None;
                document.active.push(op);
                document.sort();
            }
            true
        })
    }
}
