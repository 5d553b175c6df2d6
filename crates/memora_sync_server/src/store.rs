//! Server-side state: progress rows, daily stats and sessions.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, NaiveDate, Utc};
use memora_scheduler::{CardState, Scheduler};
use memora_sync_protocol::{
    ConflictBody, ConflictType, EntitySnapshot, ProgressAccepted, ProgressRecord, ProgressRequest,
    StatsDelta, StudySession, SyncMeta, SyncStatus,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Outcome of an accepted progress write.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressWrite {
    /// A new version was stored.
    Stored(ProgressAccepted),
    /// The write matched the stored version; nothing changed.
    Unchanged(ProgressAccepted),
}

impl ProgressWrite {
    /// Returns the canonical state sent back to the client.
    pub fn accepted(&self) -> &ProgressAccepted {
        match self {
            ProgressWrite::Stored(accepted) | ProgressWrite::Unchanged(accepted) => accepted,
        }
    }

    /// Consumes the outcome, returning the canonical state.
    pub fn into_accepted(self) -> ProgressAccepted {
        match self {
            ProgressWrite::Stored(accepted) | ProgressWrite::Unchanged(accepted) => accepted,
        }
    }
}

type UserKey = (String, String);

/// In-memory server state shared across requests.
///
/// Every table is keyed by user first, so one user's writes never touch
/// another user's rows.
#[derive(Default)]
pub struct ServerStore {
    progress: RwLock<HashMap<UserKey, ProgressRecord>>,
    stats: RwLock<BTreeMap<(String, NaiveDate), StatsDelta>>,
    sessions: RwLock<HashMap<UserKey, StudySession>>,
}

impl ServerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a progress write under the version rules.
    ///
    /// The check and the write happen under one lock, so two writes for the
    /// same card cannot both be accepted at the same version.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Validation`] for a bad grade or study time, or a
    ///   suspended card when the server schedules
    /// - [`ServerError::Conflict`] when the write is behind or diverges, or
    ///   as a `data` conflict when the checksum does not match the sent state
    pub fn write_progress(
        &self,
        user_id: &str,
        request: &ProgressRequest,
        config: &ServerConfig,
        now: DateTime<Utc>,
    ) -> ServerResult<ProgressWrite> {
        let (grade, _) = request.validate()?;
        let mut intact = true;
        let client_checksum = match &request.state {
            Some(state) => {
                let computed = state_checksum(&request.card_id, state, now)?;
                intact = request.checksum.as_ref().map_or(true, |sent| sent == &computed);
                Some(computed)
            }
            None => request.checksum.clone(),
        };

        let key = (user_id.to_string(), request.card_id.clone());
        let mut progress = self.progress.write();
        let stored = progress.get(&key);

        if !intact {
            tracing::debug!(
                user_id,
                card_id = %request.card_id,
                client_version = request.version,
                "checksum does not match sent state"
            );
            return Err(match stored {
                Some(stored) => conflict(ConflictType::Data, stored, request.version),
                None => ServerError::Conflict(Box::new(ConflictBody::without_server_copy(
                    ConflictType::Data,
                    request.version,
                ))),
            });
        }

        let version = match stored {
            None => request.version.max(1),
            Some(stored) if request.version == 0 => stored.meta.version + 1,
            Some(stored) => {
                let client = EntitySnapshot {
                    version: request.version,
                    last_modified: request.last_modified.unwrap_or(now),
                    checksum: client_checksum,
                    data: serde_json::Value::Null,
                };
                let server = EntitySnapshot {
                    version: stored.meta.version,
                    last_modified: stored.meta.last_modified,
                    checksum: Some(stored.meta.checksum.clone()),
                    data: serde_json::Value::Null,
                };
                match ConflictType::classify(&client, &server, config.concurrent_window) {
                    Some(conflict_type) => {
                        tracing::debug!(
                            user_id,
                            card_id = %request.card_id,
                            ?conflict_type,
                            server_version = stored.meta.version,
                            client_version = request.version,
                            "progress write rejected"
                        );
                        return Err(conflict(conflict_type, stored, request.version));
                    }
                    None if request.version == stored.meta.version => {
                        return Ok(ProgressWrite::Unchanged(ProgressAccepted::from_record(stored)));
                    }
                    None => request.version,
                }
            }
        };

        let (state, last_modified) = match &request.state {
            Some(state) => (state.clone(), request.last_modified.unwrap_or(now)),
            None => {
                let settings = request
                    .settings
                    .as_ref()
                    .unwrap_or(&config.default_settings)
                    .normalize();
                let result = Scheduler::new(settings).review(
                    stored.map(|record| &record.state),
                    grade,
                    now,
                )?;
                (result.state, now)
            }
        };

        let accepted = ProgressAccepted::new(&request.card_id, state, version, last_modified)?;
        let record = ProgressRecord {
            user_id: user_id.to_string(),
            card_id: accepted.card_id.clone(),
            state: accepted.state.clone(),
            meta: SyncMeta {
                version,
                last_modified,
                sync_status: SyncStatus::Synced,
                checksum: accepted.checksum.clone(),
            },
            last_synced: Some(now),
        };
        progress.insert(key, record);
        tracing::debug!(user_id, card_id = %accepted.card_id, version, "progress stored");
        Ok(ProgressWrite::Stored(accepted))
    }

    /// Inserts or replaces a row as-is, bypassing the version rules.
    ///
    /// Used to import data and to stand in for writes from other services.
    pub fn put_progress(&self, record: ProgressRecord) {
        let key = (record.user_id.clone(), record.card_id.clone());
        self.progress.write().insert(key, record);
    }

    /// Returns one progress row.
    pub fn progress(&self, user_id: &str, card_id: &str) -> Option<ProgressRecord> {
        self.progress
            .read()
            .get(&(user_id.to_string(), card_id.to_string()))
            .cloned()
    }

    /// Returns a user's progress, most recently reviewed first.
    pub fn list_progress(&self, user_id: &str) -> Vec<ProgressRecord> {
        let mut rows: Vec<ProgressRecord> = self
            .progress
            .read()
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.state
                .last_reviewed
                .cmp(&a.state.last_reviewed)
                .then_with(|| a.card_id.cmp(&b.card_id))
        });
        rows
    }

    /// Returns the number of progress rows across all users.
    pub fn progress_count(&self) -> usize {
        self.progress.read().len()
    }

    /// Adds `deltas` to the stored daily rows.
    ///
    /// All deltas are merged or none are.
    pub fn merge_stats(&self, user_id: &str, deltas: &[StatsDelta]) -> ServerResult<usize> {
        let mut stats = self.stats.write();
        let mut merged: BTreeMap<NaiveDate, StatsDelta> = BTreeMap::new();
        for delta in deltas {
            let row = merged.entry(delta.date).or_insert_with(|| {
                stats
                    .get(&(user_id.to_string(), delta.date))
                    .cloned()
                    .unwrap_or_else(|| StatsDelta::empty(delta.date))
            });
            row.merge(delta)?;
        }
        for (date, row) in merged {
            stats.insert((user_id.to_string(), date), row);
        }
        Ok(deltas.len())
    }

    /// Returns a user's stats for `date`.
    pub fn stats(&self, user_id: &str, date: NaiveDate) -> Option<StatsDelta> {
        self.stats.read().get(&(user_id.to_string(), date)).cloned()
    }

    /// Stores a session unless one with the same ID exists.
    ///
    /// Returns true if the session was new.
    pub fn store_session(&self, user_id: &str, session: StudySession) -> ServerResult<bool> {
        if session.ended_at < session.started_at {
            return Err(ServerError::InvalidRequest(
                "session ends before it starts".into(),
            ));
        }
        if let Some(sent) = &session.checksum {
            if sent != &session.compute_checksum()? {
                return Err(ServerError::InvalidRequest(
                    "session checksum does not match".into(),
                ));
            }
        }
        let key = (user_id.to_string(), session.id.clone());
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&key) {
            return Ok(false);
        }
        sessions.insert(key, session);
        Ok(true)
    }

    /// Returns a stored session.
    pub fn session(&self, user_id: &str, session_id: &str) -> Option<StudySession> {
        self.sessions
            .read()
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
    }

    /// Returns the number of stored sessions across all users.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

fn state_checksum(card_id: &str, state: &CardState, now: DateTime<Utc>) -> ServerResult<String> {
    Ok(ProgressAccepted::new(card_id, state.clone(), 0, now)?.checksum)
}

fn conflict(conflict_type: ConflictType, stored: &ProgressRecord, client_version: u64) -> ServerError {
    match serde_json::to_value(stored) {
        Ok(server_data) => ServerError::Conflict(Box::new(ConflictBody {
            conflict_type,
            server_version: stored.meta.version,
            client_version,
            server_data,
        })),
        Err(e) => ServerError::Internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use memora_scheduler::{CardStatus, Grade};
    use memora_sync_protocol::SyncableEntity;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn request(card_id: &str, version: u64, state: CardState, at: DateTime<Utc>) -> ProgressRequest {
        let record = ProgressRecord {
            user_id: "u1".into(),
            card_id: card_id.into(),
            state: state.clone(),
            meta: SyncMeta {
                version,
                last_modified: at,
                sync_status: SyncStatus::Pending,
                checksum: String::new(),
            },
            last_synced: None,
        };
        let checksum = record.compute_checksum().unwrap();
        ProgressRequest {
            checksum: Some(checksum),
            ..ProgressRequest::from_record(&record, Grade::Good, 10, None, None)
        }
    }

    fn reviewed(grade: Grade, at: DateTime<Utc>) -> CardState {
        Scheduler::default().review(None, grade, at).unwrap().state
    }

    fn unversioned(card_id: &str, grade: i64) -> ProgressRequest {
        ProgressRequest {
            card_id: card_id.into(),
            grade,
            study_time_seconds: 30,
            session_id: None,
            checksum: None,
            last_modified: None,
            settings: None,
            version: 0,
            state: None,
        }
    }

    #[test]
    fn first_write_is_stored() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        let state = reviewed(Grade::Good, t0());
        let write = store
            .write_progress("u1", &request("c1", 1, state.clone(), t0()), &config, t0())
            .unwrap();

        assert!(matches!(write, ProgressWrite::Stored(_)));
        let accepted = write.into_accepted();
        assert_eq!(accepted.version, 1);
        assert_eq!(accepted.state, state);
        assert!(accepted.verify_checksum().unwrap());

        let row = store.progress("u1", "c1").unwrap();
        assert_eq!(row.meta.sync_status, SyncStatus::Synced);
        assert_eq!(row.last_synced, Some(t0()));
        assert!(row.verify_checksum().unwrap());
    }

    #[test]
    fn newer_version_replaces_older() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        store
            .write_progress("u1", &request("c1", 1, reviewed(Grade::Good, t0()), t0()), &config, t0())
            .unwrap();
        let later = t0() + Duration::minutes(5);
        let state = reviewed(Grade::Easy, later);
        let accepted = store
            .write_progress("u1", &request("c1", 3, state.clone(), later), &config, later)
            .unwrap()
            .into_accepted();
        assert_eq!(accepted.version, 3);
        assert_eq!(store.progress("u1", "c1").unwrap().state, state);
    }

    #[test]
    fn same_version_same_checksum_is_unchanged() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        let write = request("c1", 2, reviewed(Grade::Good, t0()), t0());
        store.write_progress("u1", &write, &config, t0()).unwrap();
        let again = store
            .write_progress("u1", &write, &config, t0() + Duration::hours(1))
            .unwrap();
        assert!(matches!(again, ProgressWrite::Unchanged(_)));
        assert_eq!(store.progress("u1", "c1").unwrap().last_synced, Some(t0()));
    }

    #[test]
    fn same_version_different_checksum_is_data_conflict() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        store
            .write_progress("u1", &request("c1", 2, reviewed(Grade::Good, t0()), t0()), &config, t0())
            .unwrap();
        let err = store
            .write_progress("u1", &request("c1", 2, reviewed(Grade::Easy, t0()), t0()), &config, t0())
            .unwrap_err();
        match err {
            ServerError::Conflict(body) => {
                assert_eq!(body.conflict_type, ConflictType::Data);
                assert_eq!(body.server_version, 2);
                assert_eq!(body.client_version, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn older_version_conflicts_by_time_gap() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        store
            .write_progress("u1", &request("c1", 5, reviewed(Grade::Good, t0()), t0()), &config, t0())
            .unwrap();

        let close = t0() + Duration::seconds(10);
        let err = store
            .write_progress("u1", &request("c1", 3, reviewed(Grade::Hard, close), close), &config, close)
            .unwrap_err();
        assert!(matches!(&err, ServerError::Conflict(body) if body.conflict_type == ConflictType::Concurrent));

        let far = t0() - Duration::hours(2);
        let err = store
            .write_progress("u1", &request("c1", 3, reviewed(Grade::Hard, far), far), &config, t0())
            .unwrap_err();
        match err {
            ServerError::Conflict(body) => {
                assert_eq!(body.conflict_type, ConflictType::Version);
                let snapshot = body.server_snapshot().unwrap();
                assert_eq!(snapshot.version, 5);
                assert_eq!(snapshot.last_modified, t0());
                let state: CardState = serde_json::from_value(body.server_data).unwrap();
                assert_eq!(state.status, CardStatus::Learning);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tampered_checksum_is_a_data_conflict() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        let mut write = request("c1", 1, reviewed(Grade::Good, t0()), t0());
        write.checksum = Some("0".repeat(64));
        let err = store.write_progress("u1", &write, &config, t0()).unwrap_err();
        match err {
            ServerError::Conflict(body) => {
                assert_eq!(body.conflict_type, ConflictType::Data);
                assert_eq!(body.server_version, 0);
                assert_eq!(body.server_snapshot().unwrap().version, 0);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
        assert_eq!(store.progress_count(), 0);

        let stored = request("c1", 1, reviewed(Grade::Good, t0()), t0());
        store.write_progress("u1", &stored, &config, t0()).unwrap();
        let mut tampered = request("c1", 2, reviewed(Grade::Easy, t0()), t0() + Duration::minutes(1));
        tampered.checksum = Some("0".repeat(64));
        let err = store
            .write_progress("u1", &tampered, &config, t0() + Duration::minutes(1))
            .unwrap_err();
        match err {
            ServerError::Conflict(body) => {
                assert_eq!(body.conflict_type, ConflictType::Data);
                assert_eq!(body.server_version, 1);
                assert_eq!(body.server_data["cardId"], "c1");
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
        assert_eq!(store.progress("u1", "c1").unwrap().meta.version, 1);
    }

    #[test]
    fn unversioned_write_is_scheduled_by_server() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        let first = store
            .write_progress("u1", &unversioned("c1", 2), &config, t0())
            .unwrap()
            .into_accepted();
        assert_eq!(first.version, 1);
        assert_eq!(first.state.status, CardStatus::Learning);
        assert_eq!(first.last_modified, t0());

        let second = store
            .write_progress("u1", &unversioned("c1", 2), &config, t0() + Duration::minutes(1))
            .unwrap()
            .into_accepted();
        assert_eq!(second.version, 2);
        assert_eq!(second.state.step_index, 1);
    }

    #[test]
    fn invalid_grade_is_validation_error() {
        let store = ServerStore::new();
        let err = store
            .write_progress("u1", &unversioned("c1", 5), &ServerConfig::default(), t0())
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn users_are_isolated() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        store.write_progress("u1", &unversioned("c1", 2), &config, t0()).unwrap();
        store.write_progress("u2", &unversioned("c1", 3), &config, t0()).unwrap();

        assert_eq!(store.progress_count(), 2);
        assert_eq!(store.list_progress("u1").len(), 1);
        assert_eq!(store.progress("u1", "c1").unwrap().meta.version, 1);
        assert_eq!(store.progress("u2", "c1").unwrap().meta.version, 1);
    }

    #[test]
    fn list_is_most_recent_first() {
        let store = ServerStore::new();
        let config = ServerConfig::default();
        store.write_progress("u1", &unversioned("old", 2), &config, t0()).unwrap();
        store
            .write_progress("u1", &unversioned("new", 2), &config, t0() + Duration::hours(1))
            .unwrap();
        let ids: Vec<_> = store
            .list_progress("u1")
            .into_iter()
            .map(|record| record.card_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn stats_are_added_per_day() {
        let store = ServerStore::new();
        let day = t0().date_naive();
        let review = StatsDelta::for_review(day, Grade::Good, 20, true, false);
        assert_eq!(store.merge_stats("u1", &[review.clone(), review.clone()]).unwrap(), 2);
        store.merge_stats("u1", &[review]).unwrap();

        let row = store.stats("u1", day).unwrap();
        assert_eq!(row.cards_studied, 3);
        assert_eq!(row.study_time, 60);
        assert_eq!(row.new_cards_learned, 3);
        assert!(store.stats("u2", day).is_none());
    }

    #[test]
    fn sessions_are_stored_once() {
        let store = ServerStore::new();
        let session = StudySession {
            id: "s1".into(),
            started_at: t0(),
            ended_at: t0() + Duration::minutes(15),
            cards_studied: 12,
            correct_answers: 10,
            study_time_seconds: 900,
            checksum: None,
        }
        .sealed()
        .unwrap();

        assert!(store.store_session("u1", session.clone()).unwrap());
        assert!(!store.store_session("u1", session.clone()).unwrap());
        assert_eq!(store.session_count(), 1);

        let tampered = StudySession {
            cards_studied: 99,
            ..session
        };
        assert!(matches!(
            store.store_session("u1", tampered),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    proptest! {
        #[test]
        fn stored_version_never_decreases(versions in proptest::collection::vec(1u64..8, 1..20)) {
            let store = ServerStore::new();
            let config = ServerConfig::default();
            let mut highest = 0;
            for (i, version) in versions.into_iter().enumerate() {
                let at = t0() + Duration::minutes(i as i64);
                let write = request("c1", version, reviewed(Grade::Good, at), at);
                match store.write_progress("u1", &write, &config, at) {
                    Ok(_) => {
                        prop_assert!(version > highest);
                        highest = version;
                    }
                    Err(ServerError::Conflict(_)) => prop_assert!(version <= highest),
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
                prop_assert_eq!(store.progress("u1", "c1").unwrap().meta.version, highest);
            }
        }
    }
}
