//! The local write path: grade a card, persist it, queue it for sync.

use crate::error::SyncResult;
use crate::queue::SyncQueue;
use chrono::{DateTime, Utc};
use memora_scheduler::{
    validate_study_time, CardStatus, Grade, PartialSettings, Scheduler, SchedulingResult,
};
use memora_storage::{ProgressStore, StorageBackend};
use memora_sync_protocol::{
    EntityType, OperationType, Priority, ProgressRecord, ProgressRequest, ProtocolError,
    StatsDelta, StudySession, SyncOperation,
};
use std::sync::Arc;
use uuid::Uuid;

/// Result of recording one review.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReview {
    /// The stored record, `pending`.
    pub record: ProgressRecord,
    /// Scheduler output.
    pub result: SchedulingResult,
    /// Queued progress operation.
    pub operation_id: Uuid,
}

/// Records reviews for one user.
///
/// Validation happens before anything is written. The progress record is
/// written before the operation is queued, so a failed enqueue leaves the
/// review stored locally and reported to the caller.
pub struct ReviewRecorder<B> {
    user_id: String,
    scheduler: Scheduler,
    settings: Option<PartialSettings>,
    store: Arc<ProgressStore<B>>,
    queue: Arc<SyncQueue<B>>,
}

impl<B: StorageBackend> ReviewRecorder<B> {
    /// Creates a recorder scheduling with `settings` (normalized).
    pub fn new(
        user_id: impl Into<String>,
        settings: PartialSettings,
        store: Arc<ProgressStore<B>>,
        queue: Arc<SyncQueue<B>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            scheduler: Scheduler::new(settings.normalize()),
            settings: Some(settings),
            store,
            queue,
        }
    }

    /// Returns the scheduler in use.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Grades `card_id` and queues the result.
    ///
    /// # Errors
    ///
    /// [`crate::SyncError::Validation`] for an out-of-range grade or study
    /// time, or a suspended card; nothing is written in that case.
    pub fn record_review(
        &self,
        card_id: &str,
        grade: i64,
        study_time_seconds: i64,
        session_id: Option<String>,
        now: DateTime<Utc>,
    ) -> SyncResult<RecordedReview> {
        let grade = Grade::from_i64(grade)?;
        let seconds = validate_study_time(study_time_seconds)?;
        if card_id.is_empty() {
            return Err(ProtocolError::invalid_payload("cardId must not be empty").into());
        }

        let previous = self.store.get(&self.user_id, card_id)?;
        let result = self
            .scheduler
            .review(previous.as_ref().map(|record| &record.state), grade, now)?;
        let record = self
            .store
            .apply_review(&self.user_id, card_id, &result.state, now)?;

        let op_type = if record.meta.version == 1
            || self
                .queue
                .contains(EntityType::Progress, card_id, OperationType::Create)
        {
            OperationType::Create
        } else {
            OperationType::Update
        };
        let request =
            ProgressRequest::from_record(&record, grade, seconds, session_id, self.settings.clone());
        let operation_id = self.queue.enqueue(SyncOperation::new(
            op_type,
            EntityType::Progress,
            card_id,
            serde_json::to_value(&request).map_err(ProtocolError::from)?,
            Priority::High,
            now,
        ))?;

        let was_review = result.previous.status == CardStatus::Review;
        let delta = StatsDelta::for_review(now.date_naive(), grade, seconds, result.was_new, was_review);
        self.add_stats(&delta, now)?;

        tracing::debug!(
            card_id,
            grade = grade.code(),
            version = record.meta.version,
            status = ?record.state.status,
            "review recorded"
        );
        Ok(RecordedReview {
            record,
            result,
            operation_id,
        })
    }

    /// Queues a finished session and counts it in the day's stats.
    pub fn finish_session(&self, session: StudySession, now: DateTime<Utc>) -> SyncResult<Uuid> {
        let session = session.sealed()?;
        let id = self.queue.enqueue(SyncOperation::new(
            OperationType::Create,
            EntityType::Session,
            session.id.as_str(),
            serde_json::to_value(&session).map_err(ProtocolError::from)?,
            Priority::Medium,
            now,
        ))?;

        let delta = StatsDelta {
            sessions_count: 1,
            ..StatsDelta::empty(session.ended_at.date_naive())
        };
        self.add_stats(&delta, now)?;
        tracing::debug!(session_id = %session.id, "session queued");
        Ok(id)
    }

    /// Folds `delta` into the queued stats operation for its date.
    fn add_stats(&self, delta: &StatsDelta, now: DateTime<Utc>) -> SyncResult<Uuid> {
        self.queue.upsert_with(
            EntityType::Stats,
            &delta.entity_id(),
            OperationType::Update,
            Priority::Low,
            now,
            |queued| {
                let mut total = match queued {
                    Some(payload) => serde_json::from_value::<StatsDelta>(payload.clone())
                        .map_err(ProtocolError::from)?,
                    None => StatsDelta::empty(delta.date),
                };
                total.merge(delta)?;
                Ok(serde_json::to_value(&total).map_err(ProtocolError::from)?)
            },
        )
    }
}
