//! Local progress store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use memora_scheduler::CardState;
use memora_sync_protocol::{ProgressAccepted, ProgressRecord, SyncStatus};
use serde_json::Value;

/// Result of committing a server acknowledgement locally.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The record now mirrors the server copy and is `synced`.
    Committed(ProgressRecord),
    /// The record changed locally after the request was sent; it stays
    /// `pending` and only `last_synced` is updated.
    Superseded(ProgressRecord),
    /// No local record exists.
    Missing,
}

/// Durable per-(user, card) progress records.
///
/// Records are stored as JSON objects under `progress/{user}/{card}`. Writes
/// merge into the stored object so fields unknown to this build survive.
/// Every mutation goes through [`StorageBackend::update`], so a retry racing
/// with a fresh review cannot interleave inside a read-modify-write.
#[derive(Debug)]
pub struct ProgressStore<B> {
    backend: B,
}

impl<B: StorageBackend> ProgressStore<B> {
    /// Creates a store on top of `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn key(user_id: &str, card_id: &str) -> String {
        format!("progress/{user_id}/{card_id}")
    }

    fn prefix(user_id: &str) -> String {
        format!("progress/{user_id}/")
    }

    /// Reads one record.
    pub fn get(&self, user_id: &str, card_id: &str) -> StorageResult<Option<ProgressRecord>> {
        self.backend
            .get(&Self::key(user_id, card_id))?
            .map(decode)
            .transpose()
    }

    /// Writes `record`, merging it over any stored document.
    pub fn upsert(&self, record: &ProgressRecord) -> StorageResult<ProgressRecord> {
        let incoming = serde_json::to_value(record)?;
        let stored = self.backend.update(
            &Self::key(&record.user_id, &record.card_id),
            &mut |current| Ok(overlay(current, &incoming)),
        )?;
        decode(stored)
    }

    /// Records a locally computed state.
    ///
    /// Creates a version-1 record for an unseen card, otherwise bumps the
    /// version. Either way the checksum is recomputed and the record is
    /// `pending`.
    pub fn apply_review(
        &self,
        user_id: &str,
        card_id: &str,
        state: &CardState,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord> {
        let stored = self
            .backend
            .update(&Self::key(user_id, card_id), &mut |current| {
                let record = match &current {
                    Some(existing) => {
                        let mut record = decode(existing.clone())?;
                        record.apply_local(state.clone(), now)?;
                        record
                    }
                    None => ProgressRecord::create(user_id, card_id, state.clone(), now)?,
                };
                Ok(overlay(current, &serde_json::to_value(&record)?))
            })?;
        decode(stored)
    }

    /// Lists a user's records in card order.
    pub fn scan(&self, user_id: &str) -> StorageResult<Vec<ProgressRecord>> {
        self.backend
            .scan_prefix(&Self::prefix(user_id))?
            .into_iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Lists a user's records that are not yet `synced`.
    pub fn pending_records(&self, user_id: &str) -> StorageResult<Vec<ProgressRecord>> {
        Ok(self
            .scan(user_id)?
            .into_iter()
            .filter(|record| record.meta.sync_status != SyncStatus::Synced)
            .collect())
    }

    /// Sets the sync status of a record. Returns false if it does not exist.
    pub fn mark_status(
        &self,
        user_id: &str,
        card_id: &str,
        status: SyncStatus,
    ) -> StorageResult<bool> {
        let updated = self.modify(user_id, card_id, |mut record| {
            record.meta.sync_status = status;
            Ok(record)
        })?;
        Ok(updated.is_some())
    }

    /// Commits a server acknowledgement for a request sent at `sent_version`.
    pub fn commit_synced(
        &self,
        user_id: &str,
        accepted: &ProgressAccepted,
        sent_version: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<CommitOutcome> {
        let mut superseded = false;
        let updated = self.modify(user_id, &accepted.card_id, |mut record| {
            superseded = record.meta.version != sent_version;
            if superseded {
                record.last_synced = Some(now);
            } else {
                record.state = accepted.state.clone();
                record.meta.version = accepted.version;
                record.meta.checksum = accepted.checksum.clone();
                record.meta.last_modified = accepted.last_modified;
                record.meta.sync_status = SyncStatus::Synced;
                record.last_synced = Some(now);
            }
            Ok(record)
        })?;

        Ok(match updated {
            None => CommitOutcome::Missing,
            Some(record) if superseded => CommitOutcome::Superseded(record),
            Some(record) => CommitOutcome::Committed(record),
        })
    }

    /// Replaces the local record with the server copy, discarding local changes.
    pub fn adopt_remote(
        &self,
        user_id: &str,
        remote: &ProgressAccepted,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord> {
        let record = synced_copy(user_id, remote, now)?;
        self.upsert(&record)
    }

    /// Adopts the server copy only if it is newer and there are no local
    /// changes. Returns true if the record was replaced.
    pub fn adopt_if_newer(
        &self,
        user_id: &str,
        remote: &ProgressAccepted,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let incoming = serde_json::to_value(synced_copy(user_id, remote, now)?)?;
        let mut adopted = false;
        self.backend
            .update(&Self::key(user_id, &remote.card_id), &mut |current| {
                let keep_local = match &current {
                    Some(existing) => {
                        let local = decode(existing.clone())?;
                        local.has_local_changes() || local.meta.version >= remote.version
                    }
                    None => false,
                };
                adopted = !keep_local;
                Ok(match current {
                    Some(existing) if keep_local => existing,
                    current => overlay(current, &incoming),
                })
            })?;
        Ok(adopted)
    }

    fn modify(
        &self,
        user_id: &str,
        card_id: &str,
        mut f: impl FnMut(ProgressRecord) -> StorageResult<ProgressRecord>,
    ) -> StorageResult<Option<ProgressRecord>> {
        let key = Self::key(user_id, card_id);
        if self.backend.get(&key)?.is_none() {
            return Ok(None);
        }
        let stored = self.backend.update(&key, &mut |current| {
            let existing = current.ok_or_else(|| {
                StorageError::Corrupted(format!("{key} removed during update"))
            })?;
            let record = f(decode(existing.clone())?)?;
            Ok(overlay(Some(existing), &serde_json::to_value(&record)?))
        })?;
        decode(stored).map(Some)
    }
}

fn synced_copy(
    user_id: &str,
    remote: &ProgressAccepted,
    now: DateTime<Utc>,
) -> StorageResult<ProgressRecord> {
    let mut record = ProgressRecord::create(
        user_id,
        remote.card_id.as_str(),
        remote.state.clone(),
        remote.last_modified,
    )?;
    record.meta.version = remote.version;
    record.meta.sync_status = SyncStatus::Synced;
    record.last_synced = Some(now);
    Ok(record)
}

fn decode(value: Value) -> StorageResult<ProgressRecord> {
    Ok(serde_json::from_value(value)?)
}

/// Top-level object merge: fields of `incoming` replace those in `current`.
fn overlay(current: Option<Value>, incoming: &Value) -> Value {
    match (current, incoming) {
        (Some(Value::Object(mut base)), Value::Object(fields)) => {
            for (key, value) in fields {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        _ => incoming.clone(),
    }
}
