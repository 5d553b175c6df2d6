//! Wire messages exchanged with the remote progress service.

use crate::checksum::checksum_of;
use crate::conflict::{ConflictType, EntitySnapshot};
use crate::entity::{progress_checksum, ProgressRecord};
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, NaiveDate, Utc};
use memora_scheduler::{validate_study_time, CardState, Grade, PartialSettings};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client version sent as `X-Client-Version`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-request metadata carried in headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Stable device identifier (`X-Device-ID`).
    pub device_id: String,
    /// Operation identifier (`X-Operation-ID`), used for idempotency.
    pub operation_id: Uuid,
    /// Client version (`X-Client-Version`).
    pub client_version: String,
    /// Authenticated user (`X-User-ID`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl RequestMeta {
    /// Creates metadata for one operation.
    pub fn new(device_id: impl Into<String>, operation_id: Uuid) -> Self {
        Self {
            device_id: device_id.into(),
            operation_id,
            client_version: CLIENT_VERSION.to_string(),
            user_id: None,
        }
    }

    /// Sets the user the request acts for.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Body of `POST /progress`.
///
/// `grade` and `study_time_seconds` are kept as raw integers so the service
/// can reject out-of-range values with a validation error instead of a
/// decoding error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    /// Card identifier.
    pub card_id: String,
    /// Review grade, 0 to 3.
    pub grade: i64,
    /// Time spent on the card, 0 to 86400.
    pub study_time_seconds: i64,
    /// Owning study session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Checksum of the client's copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Time of the client's latest mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Scheduler settings the client reviewed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<PartialSettings>,
    /// Version of the client's copy.
    #[serde(default)]
    pub version: u64,
    /// Client-computed state. When absent the service schedules the grade itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CardState>,
}

impl ProgressRequest {
    /// Builds a request from a local record and the grade that produced it.
    pub fn from_record(
        record: &ProgressRecord,
        grade: Grade,
        study_time_seconds: u32,
        session_id: Option<String>,
        settings: Option<PartialSettings>,
    ) -> Self {
        Self {
            card_id: record.card_id.clone(),
            grade: i64::from(grade.code()),
            study_time_seconds: i64::from(study_time_seconds),
            session_id,
            checksum: Some(record.meta.checksum.clone()),
            last_modified: Some(record.meta.last_modified),
            settings,
            version: record.meta.version,
            state: Some(record.state.clone()),
        }
    }

    /// Validates grade and study time.
    pub fn validate(&self) -> ProtocolResult<(Grade, u32)> {
        if self.card_id.is_empty() {
            return Err(ProtocolError::invalid_payload("cardId must not be empty"));
        }
        let grade = Grade::from_i64(self.grade)?;
        let seconds = validate_study_time(self.study_time_seconds)?;
        Ok((grade, seconds))
    }

    /// Returns the client side of a conflict, using `fields` as the entity data.
    pub fn snapshot(&self, fields: serde_json::Value, now: DateTime<Utc>) -> EntitySnapshot {
        EntitySnapshot {
            version: self.version,
            last_modified: self.last_modified.unwrap_or(now),
            checksum: self.checksum.clone(),
            data: fields,
        }
    }
}

/// Successful `POST /progress` response: the canonical server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressAccepted {
    /// Card identifier.
    pub card_id: String,
    /// Canonical card state.
    pub state: CardState,
    /// Canonical version.
    pub version: u64,
    /// Checksum of `card_id` and `state`.
    pub checksum: String,
    /// Server-side modification time.
    pub last_modified: DateTime<Utc>,
}

impl ProgressAccepted {
    /// Builds a response for `state`, computing its checksum.
    pub fn new(
        card_id: impl Into<String>,
        state: CardState,
        version: u64,
        last_modified: DateTime<Utc>,
    ) -> ProtocolResult<Self> {
        let card_id = card_id.into();
        let checksum = progress_checksum(&card_id, &state)?;
        Ok(Self {
            card_id,
            state,
            version,
            checksum,
            last_modified,
        })
    }

    /// Builds a response from a stored record.
    pub fn from_record(record: &ProgressRecord) -> Self {
        Self {
            card_id: record.card_id.clone(),
            state: record.state.clone(),
            version: record.meta.version,
            checksum: record.meta.checksum.clone(),
            last_modified: record.meta.last_modified,
        }
    }

    /// Returns true if `checksum` matches the canonical state.
    pub fn verify_checksum(&self) -> ProtocolResult<bool> {
        Ok(progress_checksum(&self.card_id, &self.state)? == self.checksum)
    }
}

/// Conflict details inside a 409 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    /// Kind of conflict.
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// Version held by the server.
    pub server_version: u64,
    /// Version the client sent.
    pub client_version: u64,
    /// Server copy of the entity.
    pub server_data: serde_json::Value,
}

impl ConflictBody {
    /// Returns the server side of the conflict.
    ///
    /// `server_data` must carry `lastModified`; `checksum` is optional.
    /// A `data` conflict on a card the server has never stored comes with
    /// version 0 and empty `server_data`; it maps to a snapshot older than
    /// any local edit.
    pub fn server_snapshot(&self) -> ProtocolResult<EntitySnapshot> {
        if self.is_without_server_copy() {
            return Ok(EntitySnapshot {
                version: 0,
                last_modified: DateTime::<Utc>::MIN_UTC,
                checksum: None,
                data: self.server_data.clone(),
            });
        }
        let last_modified = self
            .server_data
            .get("lastModified")
            .cloned()
            .ok_or_else(|| ProtocolError::invalid_payload("serverData.lastModified missing"))?;
        let last_modified: DateTime<Utc> = serde_json::from_value(last_modified)?;
        let checksum = self
            .server_data
            .get("checksum")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        Ok(EntitySnapshot {
            version: self.server_version,
            last_modified,
            checksum,
            data: self.server_data.clone(),
        })
    }

    /// A conflict reported before the server held any copy of the card.
    pub fn without_server_copy(conflict_type: ConflictType, client_version: u64) -> Self {
        Self {
            conflict_type,
            server_version: 0,
            client_version,
            server_data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    fn is_without_server_copy(&self) -> bool {
        self.server_version == 0
            && match &self.server_data {
                serde_json::Value::Null => true,
                serde_json::Value::Object(fields) => fields.is_empty(),
                _ => false,
            }
    }
}

/// Full 409 response body: `{"conflict": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResponse {
    /// Conflict details.
    pub conflict: ConflictBody,
}

/// Outcome of a write against the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteReply<T> {
    /// 200: the write was applied.
    Accepted(T),
    /// 409: the write was rejected.
    Conflict(ConflictBody),
}

/// Daily aggregate statistics delta for `POST /stats`.
///
/// Deltas are merged by adding counters, so replays of distinct deltas are
/// additive and the service stores one row per (user, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsDelta {
    /// Calendar day (UTC).
    pub date: NaiveDate,
    /// Cards reviewed.
    #[serde(default)]
    pub cards_studied: u32,
    /// Reviews graded hard or better.
    #[serde(default)]
    pub correct_answers: u32,
    /// Reviews graded again.
    #[serde(default)]
    pub incorrect_answers: u32,
    /// Seconds spent.
    #[serde(default)]
    pub study_time: u64,
    /// Finished sessions.
    #[serde(default)]
    pub sessions_count: u32,
    /// New cards seen for the first time.
    #[serde(default)]
    pub new_cards_learned: u32,
    /// Reviews of cards that were already in the review phase.
    #[serde(default)]
    pub reviews_completed: u32,
}

impl StatsDelta {
    /// An empty delta for `date`.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            cards_studied: 0,
            correct_answers: 0,
            incorrect_answers: 0,
            study_time: 0,
            sessions_count: 0,
            new_cards_learned: 0,
            reviews_completed: 0,
        }
    }

    /// Delta for a single review.
    pub fn for_review(
        date: NaiveDate,
        grade: Grade,
        study_time_seconds: u32,
        was_new: bool,
        was_review: bool,
    ) -> Self {
        let correct = grade != Grade::Again;
        Self {
            cards_studied: 1,
            correct_answers: u32::from(correct),
            incorrect_answers: u32::from(!correct),
            study_time: u64::from(study_time_seconds),
            new_cards_learned: u32::from(was_new),
            reviews_completed: u32::from(was_review),
            ..Self::empty(date)
        }
    }

    /// Adds `other`'s counters into `self`. Dates must match.
    pub fn merge(&mut self, other: &StatsDelta) -> ProtocolResult<()> {
        if self.date != other.date {
            return Err(ProtocolError::invalid_payload(format!(
                "cannot merge stats for {} into {}",
                other.date, self.date
            )));
        }
        self.cards_studied = self.cards_studied.saturating_add(other.cards_studied);
        self.correct_answers = self.correct_answers.saturating_add(other.correct_answers);
        self.incorrect_answers = self
            .incorrect_answers
            .saturating_add(other.incorrect_answers);
        self.study_time = self.study_time.saturating_add(other.study_time);
        self.sessions_count = self.sessions_count.saturating_add(other.sessions_count);
        self.new_cards_learned = self
            .new_cards_learned
            .saturating_add(other.new_cards_learned);
        self.reviews_completed = self
            .reviews_completed
            .saturating_add(other.reviews_completed);
        Ok(())
    }

    /// Removes `other`'s counters from `self`, stopping at zero. Dates must match.
    pub fn subtract(&mut self, other: &StatsDelta) -> ProtocolResult<()> {
        if self.date != other.date {
            return Err(ProtocolError::invalid_payload(format!(
                "cannot subtract stats for {} from {}",
                other.date, self.date
            )));
        }
        self.cards_studied = self.cards_studied.saturating_sub(other.cards_studied);
        self.correct_answers = self.correct_answers.saturating_sub(other.correct_answers);
        self.incorrect_answers = self
            .incorrect_answers
            .saturating_sub(other.incorrect_answers);
        self.study_time = self.study_time.saturating_sub(other.study_time);
        self.sessions_count = self.sessions_count.saturating_sub(other.sessions_count);
        self.new_cards_learned = self
            .new_cards_learned
            .saturating_sub(other.new_cards_learned);
        self.reviews_completed = self
            .reviews_completed
            .saturating_sub(other.reviews_completed);
        Ok(())
    }

    /// Returns true if every counter is zero.
    pub fn is_empty(&self) -> bool {
        *self == Self::empty(self.date)
    }

    /// Entity ID used for queueing: one stats entity per day.
    pub fn entity_id(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// A finished study session, sent with `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySession {
    /// Session identifier.
    pub id: String,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end.
    pub ended_at: DateTime<Utc>,
    /// Cards reviewed.
    pub cards_studied: u32,
    /// Reviews graded hard or better.
    pub correct_answers: u32,
    /// Seconds spent.
    pub study_time_seconds: u64,
    /// Checksum of the fields above.
    #[serde(default)]
    pub checksum: Option<String>,
}

impl StudySession {
    /// Computes the checksum over every field except `checksum`.
    pub fn compute_checksum(&self) -> ProtocolResult<String> {
        checksum_of(&(
            &self.id,
            self.started_at,
            self.ended_at,
            self.cards_studied,
            self.correct_answers,
            self.study_time_seconds,
        ))
    }

    /// Returns the session with its checksum filled in.
    pub fn sealed(mut self) -> ProtocolResult<Self> {
        self.checksum = Some(self.compute_checksum()?);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 5, 9, 30, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 5).unwrap()
    }

    #[test]
    fn request_validation() {
        let record =
            ProgressRecord::create("user-1", "card-1", CardState::new_card(2.5), now()).unwrap();
        let mut request = ProgressRequest::from_record(&record, Grade::Good, 12, None, None);
        assert_eq!(request.validate().unwrap(), (Grade::Good, 12));

        request.grade = 4;
        assert!(matches!(
            request.validate(),
            Err(ProtocolError::Validation(_))
        ));

        request.grade = 2;
        request.study_time_seconds = 86_401;
        assert!(request.validate().is_err());

        request.study_time_seconds = 0;
        request.card_id.clear();
        assert!(matches!(
            request.validate(),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn request_omits_absent_optionals() {
        let request = ProgressRequest {
            card_id: "card-1".into(),
            grade: 2,
            study_time_seconds: 5,
            session_id: None,
            checksum: None,
            last_modified: None,
            settings: None,
            version: 1,
            state: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"cardId": "card-1", "grade": 2, "studyTimeSeconds": 5, "version": 1})
        );
    }

    #[test]
    fn accepted_checksum_verification() {
        let record =
            ProgressRecord::create("user-1", "card-1", CardState::new_card(2.5), now()).unwrap();
        let mut accepted = ProgressAccepted::from_record(&record);
        assert!(accepted.verify_checksum().unwrap());

        accepted.state.interval = 99.0;
        assert!(!accepted.verify_checksum().unwrap());
    }

    #[test]
    fn conflict_response_shape() {
        let body = json!({
            "conflict": {
                "type": "version",
                "serverVersion": 7,
                "clientVersion": 3,
                "serverData": {"lastModified": "2024-05-05T09:00:00Z", "checksum": "abc"}
            }
        });
        let response: ConflictResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.conflict.conflict_type, ConflictType::Version);

        let snapshot = response.conflict.server_snapshot().unwrap();
        assert_eq!(snapshot.version, 7);
        assert_eq!(snapshot.checksum.as_deref(), Some("abc"));
        assert_eq!(
            snapshot.last_modified,
            Utc.with_ymd_and_hms(2024, 5, 5, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn server_snapshot_requires_last_modified() {
        let body = ConflictBody {
            conflict_type: ConflictType::Data,
            server_version: 1,
            client_version: 1,
            server_data: json!({}),
        };
        assert!(body.server_snapshot().is_err());
    }

    #[test]
    fn conflict_without_server_copy_is_older_than_any_edit() {
        let body = ConflictBody::without_server_copy(ConflictType::Data, 1);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["serverVersion"], 0);
        assert_eq!(json["serverData"], json!({}));

        let server = body.server_snapshot().unwrap();
        assert_eq!(server.version, 0);
        assert!(server.last_modified < now());
        assert_eq!(server.checksum, None);
    }

    #[test]
    fn stats_merge_adds_counters() {
        let mut total = StatsDelta::for_review(day(), Grade::Good, 10, true, false);
        total
            .merge(&StatsDelta::for_review(day(), Grade::Again, 20, false, true))
            .unwrap();

        assert_eq!(total.cards_studied, 2);
        assert_eq!(total.correct_answers, 1);
        assert_eq!(total.incorrect_answers, 1);
        assert_eq!(total.study_time, 30);
        assert_eq!(total.new_cards_learned, 1);
        assert_eq!(total.reviews_completed, 1);
        assert_eq!(total.entity_id(), "2024-05-05");
    }

    #[test]
    fn stats_merge_rejects_other_days() {
        let mut total = StatsDelta::empty(day());
        let other = StatsDelta::empty(day().succ_opt().unwrap());
        assert!(total.merge(&other).is_err());
    }

    #[test]
    fn stats_subtract_leaves_the_unsent_part() {
        let sent = StatsDelta::for_review(day(), Grade::Good, 10, true, false);
        let later = StatsDelta::for_review(day(), Grade::Again, 20, false, true);
        let mut queued = sent.clone();
        queued.merge(&later).unwrap();

        queued.subtract(&sent).unwrap();
        assert_eq!(queued, later);
        queued.subtract(&later).unwrap();
        assert!(queued.is_empty());
        assert!(queued.subtract(&StatsDelta::empty(day().succ_opt().unwrap())).is_err());
    }

    #[test]
    fn sealed_session_checksum() {
        let session = StudySession {
            id: "session-1".into(),
            started_at: now(),
            ended_at: now(),
            cards_studied: 3,
            correct_answers: 2,
            study_time_seconds: 90,
            checksum: None,
        }
        .sealed()
        .unwrap();
        assert_eq!(
            session.checksum.as_deref(),
            Some(session.compute_checksum().unwrap().as_str())
        );
    }
}
