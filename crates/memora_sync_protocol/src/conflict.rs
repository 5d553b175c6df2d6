//! Conflict detection and resolution.

use crate::operation::EntityType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default window, in seconds, within which two edits count as concurrent.
pub const DEFAULT_CONCURRENT_WINDOW_SECS: i64 = 30;

/// Kind of conflict reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// The local version is behind the server version.
    Version,
    /// Two devices edited within the concurrent window.
    Concurrent,
    /// Checksums disagree with no clear version ordering.
    Data,
}

impl ConflictType {
    /// Classifies a write of `local_version` against a stored `server_version`.
    ///
    /// Returns `None` when the write may be accepted, i.e. the local version
    /// is ahead, or versions and checksums both match.
    pub fn classify(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        window: Duration,
    ) -> Option<ConflictType> {
        if local.version > server.version {
            return None;
        }
        if local.version == server.version {
            return match (&local.checksum, &server.checksum) {
                (Some(l), Some(s)) if l != s => Some(ConflictType::Data),
                _ => None,
            };
        }
        let gap = (local.last_modified - server.last_modified).abs();
        if gap <= window {
            Some(ConflictType::Concurrent)
        } else {
            Some(ConflictType::Version)
        }
    }
}

/// A rejected operation, as reported by the remote service.
///
/// Lives for the current sync session only, unless left unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Entity ID.
    pub entity_id: String,
    /// Entity kind.
    pub entity_type: EntityType,
    /// Version the client sent.
    pub local_version: u64,
    /// Version the server holds.
    pub server_version: u64,
    /// Kind of conflict.
    pub conflict_type: ConflictType,
    /// When the conflict was observed.
    pub timestamp: DateTime<Utc>,
}

/// One side of a conflict: version metadata plus the entity fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    /// Version counter.
    pub version: u64,
    /// Time of the latest mutation.
    pub last_modified: DateTime<Utc>,
    /// Checksum, if known.
    pub checksum: Option<String>,
    /// Entity fields as a JSON object.
    pub data: serde_json::Value,
}

/// What to do with a conflicted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-send with this snapshot as the new payload.
    Retry(EntitySnapshot),
    /// Discard the local change and adopt the server copy.
    AcceptServer(EntitySnapshot),
    /// Stop retrying and surface to the user. The local copy is kept.
    Manual {
        /// Why automatic resolution was not possible.
        reason: String,
    },
}

/// Resolves conflicts reported by the remote service.
///
/// | Kind | Rule |
/// |---|---|
/// | `version` | strictly newer local `last_modified` re-issues at `max + 1`; otherwise the server wins |
/// | `concurrent` | server fields as base, local fields override, `max + 1`, `last_modified = now` |
/// | `data` | local wins when strictly newer; otherwise manual |
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    concurrent_window: Duration,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_CONCURRENT_WINDOW_SECS))
    }
}

impl ConflictResolver {
    /// Creates a resolver with the given concurrent-edit window.
    pub fn new(concurrent_window: Duration) -> Self {
        Self { concurrent_window }
    }

    /// Returns the concurrent-edit window.
    pub fn concurrent_window(&self) -> Duration {
        self.concurrent_window
    }

    /// Classifies a conflict between two snapshots using this resolver's window.
    pub fn classify(&self, local: &EntitySnapshot, server: &EntitySnapshot) -> Option<ConflictType> {
        ConflictType::classify(local, server, self.concurrent_window)
    }

    /// Resolves a conflict.
    pub fn resolve(
        &self,
        conflict_type: ConflictType,
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        now: DateTime<Utc>,
    ) -> Resolution {
        let next_version = local.version.max(server.version) + 1;

        match conflict_type {
            ConflictType::Version => {
                if local.last_modified > server.last_modified {
                    Resolution::Retry(EntitySnapshot {
                        version: next_version,
                        ..local.clone()
                    })
                } else {
                    Resolution::AcceptServer(server.clone())
                }
            }
            ConflictType::Concurrent => {
                let mut data = server.data.clone();
                merge_fields(&mut data, &local.data);
                Resolution::Retry(EntitySnapshot {
                    version: next_version,
                    last_modified: now,
                    checksum: None,
                    data,
                })
            }
            ConflictType::Data => {
                if local.last_modified > server.last_modified {
                    Resolution::Retry(EntitySnapshot {
                        version: next_version,
                        ..local.clone()
                    })
                } else {
                    Resolution::Manual {
                        reason: format!(
                            "checksum mismatch at version {} with no newer local edit",
                            server.version
                        ),
                    }
                }
            }
        }
    }
}

/// Overlays `overlay` onto `base`, field by field. Nested objects merge
/// recursively; any other overlay value replaces the base value.
pub(crate) fn merge_fields(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_fields(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
