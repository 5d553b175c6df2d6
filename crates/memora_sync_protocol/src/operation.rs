//! Queued sync operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

/// Kind of entity an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// Per-card review progress.
    Progress,
    /// A finished study session.
    Session,
    /// Daily aggregate statistics.
    Stats,
}

/// Drain priority. `High` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Single-card progress updates.
    High,
    /// Session records.
    #[default]
    Medium,
    /// Batched analytics.
    Low,
}

/// A queued unit of work awaiting transmission.
///
/// # Lifecycle
///
/// created → enqueued (deduplicated by [`SyncOperation::dedup_key`]) →
/// attempted → removed on success, or rescheduled with backoff on failure →
/// parked as a conflict once the retry ceiling is exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Unique operation ID, sent as `X-Operation-ID`.
    pub id: Uuid,
    /// Mutation type.
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Target entity kind.
    pub entity_type: EntityType,
    /// Target entity ID.
    pub entity_id: String,
    /// Request body for the remote service.
    pub payload: serde_json::Value,
    /// Enqueue time; refreshed when a newer payload replaces this one.
    pub timestamp: DateTime<Utc>,
    /// Failed delivery attempts.
    pub retry_count: u32,
    /// Drain priority.
    pub priority: Priority,
    /// Earliest time of the next attempt, set after a failure.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Latest failure, if any.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Creates an operation with a fresh ID.
    pub fn new(
        op_type: OperationType,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type,
            entity_type,
            entity_id: entity_id.into(),
            payload,
            timestamp: now,
            retry_count: 0,
            priority,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Key under which operations are deduplicated.
    pub fn dedup_key(&self) -> (EntityType, &str, OperationType) {
        (self.entity_type, self.entity_id.as_str(), self.op_type)
    }

    /// Key identifying the target entity, used for per-entity ordering.
    pub fn entity_key(&self) -> (EntityType, &str) {
        (self.entity_type, self.entity_id.as_str())
    }

    /// Returns true if the operation may be attempted at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
