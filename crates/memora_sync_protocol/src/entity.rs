//! Versioned, checksummed entities.

use crate::checksum::checksum_of;
use crate::error::ProtocolResult;
use crate::operation::EntityType;
use chrono::{DateTime, Utc};
use memora_scheduler::CardState;
use serde::{Deserialize, Serialize};

/// Sync lifecycle of a local record.
///
/// Transitions: `pending → syncing → synced | conflict`. Any local mutation
/// puts the record back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local changes not yet acknowledged by the server.
    #[default]
    Pending,
    /// Currently in flight.
    Syncing,
    /// Matches the server copy.
    Synced,
    /// Needs user attention; automatic sync stopped.
    Conflict,
}

/// Sync metadata carried by every synced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Version counter, starting at 1 and increasing by one per accepted mutation.
    pub version: u64,
    /// Time of the latest mutation.
    pub last_modified: DateTime<Utc>,
    /// Sync lifecycle.
    pub sync_status: SyncStatus,
    /// Digest of the checksummed fields.
    pub checksum: String,
}

impl SyncMeta {
    /// Metadata for a freshly created record.
    pub fn initial(checksum: String, now: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            last_modified: now,
            sync_status: SyncStatus::Pending,
            checksum,
        }
    }

    /// Records a local mutation: bumps the version and resets status to pending.
    pub fn bump(&mut self, checksum: String, now: DateTime<Utc>) {
        self.version += 1;
        self.last_modified = now;
        self.sync_status = SyncStatus::Pending;
        self.checksum = checksum;
    }
}

/// A record that can be synchronized with the remote service.
pub trait SyncableEntity {
    /// Kind of entity, used for queue keys and routing.
    const ENTITY_TYPE: EntityType;

    /// Stable identifier.
    fn entity_id(&self) -> &str;

    /// Sync metadata.
    fn meta(&self) -> &SyncMeta;

    /// Recomputes the checksum from the checksummed fields.
    fn compute_checksum(&self) -> ProtocolResult<String>;

    /// Returns true if the stored checksum matches the content.
    fn verify_checksum(&self) -> ProtocolResult<bool> {
        Ok(self.compute_checksum()? == self.meta().checksum)
    }
}

/// Per-(user, card) progress: the card state plus sync metadata.
///
/// Persisted locally and exchanged with the remote service. The checksum
/// covers `card_id` and every [`CardState`] field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    /// Owning user.
    pub user_id: String,
    /// Card identifier.
    pub card_id: String,
    /// Scheduling state.
    #[serde(flatten)]
    pub state: CardState,
    /// Sync metadata.
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Time of the latest server acknowledgement.
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// Creates a version-1 pending record.
    pub fn create(
        user_id: impl Into<String>,
        card_id: impl Into<String>,
        state: CardState,
        now: DateTime<Utc>,
    ) -> ProtocolResult<Self> {
        let card_id = card_id.into();
        let checksum = progress_checksum(&card_id, &state)?;
        Ok(Self {
            user_id: user_id.into(),
            card_id,
            state,
            meta: SyncMeta::initial(checksum, now),
            last_synced: None,
        })
    }

    /// Applies a new local state: bumps the version and recomputes the checksum.
    pub fn apply_local(&mut self, state: CardState, now: DateTime<Utc>) -> ProtocolResult<()> {
        let checksum = progress_checksum(&self.card_id, &state)?;
        self.state = state;
        self.meta.bump(checksum, now);
        Ok(())
    }

    /// Returns true if local changes have not been acknowledged.
    pub fn has_local_changes(&self) -> bool {
        matches!(
            self.meta.sync_status,
            SyncStatus::Pending | SyncStatus::Syncing | SyncStatus::Conflict
        )
    }
}

impl SyncableEntity for ProgressRecord {
    const ENTITY_TYPE: EntityType = EntityType::Progress;

    fn entity_id(&self) -> &str {
        &self.card_id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn compute_checksum(&self) -> ProtocolResult<String> {
        progress_checksum(&self.card_id, &self.state)
    }
}

/// Checksum of the canonical progress fields.
pub(crate) fn progress_checksum(card_id: &str, state: &CardState) -> ProtocolResult<String> {
    checksum_of(&(card_id, state))
}
