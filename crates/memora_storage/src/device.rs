//! Per-install device identity.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEVICE_KEY: &str = "device/identity";

/// Stable identifier of this install, sent as `X-Device-ID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Device ID (UUID v4).
    pub id: String,
    /// When the identity was first created.
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Loads the stored identity, creating and persisting one on first use.
    pub fn load_or_create<B: StorageBackend + ?Sized>(backend: &B) -> StorageResult<Self> {
        let stored = backend.update(DEVICE_KEY, &mut |current| match current {
            Some(existing) => Ok(existing),
            None => {
                let identity = DeviceIdentity {
                    id: Uuid::new_v4().to_string(),
                    created_at: Utc::now(),
                };
                tracing::info!(device_id = %identity.id, "created device identity");
                Ok(serde_json::to_value(identity)?)
            }
        })?;
        Ok(serde_json::from_value(stored)?)
    }
}
