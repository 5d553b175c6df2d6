//! Sync health metrics.

use crate::config::NetworkQuality;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// A recorded sync failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorEntry {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Operation involved, if any.
    pub operation_id: Option<uuid::Uuid>,
    /// Error text.
    pub message: String,
}

/// Snapshot of sync health, exposed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    /// Operations waiting in the queue.
    pub pending_operations: usize,
    /// Operations parked for manual resolution.
    pub conflicts: usize,
    /// End of the latest cycle that drained without failures.
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Most recent errors, oldest first.
    pub errors: VecDeque<SyncErrorEntry>,
    /// Round-trip time of the latest request, in milliseconds.
    pub last_latency_ms: Option<u64>,
    /// Duration of the latest cycle, in milliseconds.
    pub last_cycle_ms: Option<u64>,
    /// Cycles run to completion.
    pub cycles_completed: u64,
    /// Operations acknowledged by the server.
    pub operations_synced: u64,
    /// Current link quality.
    pub network_quality: NetworkQuality,
    #[serde(skip)]
    max_errors: usize,
}

impl SyncMetrics {
    /// Creates empty metrics keeping at most `max_errors` errors.
    pub fn new(max_errors: usize) -> Self {
        Self {
            pending_operations: 0,
            conflicts: 0,
            last_successful_sync: None,
            errors: VecDeque::new(),
            last_latency_ms: None,
            last_cycle_ms: None,
            cycles_completed: 0,
            operations_synced: 0,
            network_quality: NetworkQuality::default(),
            max_errors,
        }
    }

    /// Records an error, evicting the oldest beyond the bound.
    pub fn record_error(
        &mut self,
        at: DateTime<Utc>,
        operation_id: Option<uuid::Uuid>,
        message: impl Into<String>,
    ) {
        if self.max_errors == 0 {
            return;
        }
        while self.errors.len() >= self.max_errors {
            self.errors.pop_front();
        }
        self.errors.push_back(SyncErrorEntry {
            at,
            operation_id,
            message: message.into(),
        });
    }

    /// Records the latency of one request.
    pub fn record_latency(&mut self, latency: Duration) {
        self.last_latency_ms = Some(latency.as_millis() as u64);
    }

    /// Records a finished cycle.
    pub fn record_cycle(&mut self, duration: Duration, clean: bool, finished_at: DateTime<Utc>) {
        self.cycles_completed += 1;
        self.last_cycle_ms = Some(duration.as_millis() as u64);
        if clean {
            self.last_successful_sync = Some(finished_at);
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn error_history_is_bounded() {
        let mut metrics = SyncMetrics::new(3);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for n in 0..5 {
            metrics.record_error(at, None, format!("error {n}"));
        }
        let messages: Vec<&str> = metrics.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["error 2", "error 3", "error 4"]);
    }

    #[test]
    fn successful_sync_only_on_clean_cycle() {
        let mut metrics = SyncMetrics::default();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        metrics.record_cycle(Duration::from_millis(40), false, at);
        assert_eq!(metrics.cycles_completed, 1);
        assert_eq!(metrics.last_successful_sync, None);

        metrics.record_cycle(Duration::from_millis(25), true, at);
        assert_eq!(metrics.last_successful_sync, Some(at));
        assert_eq!(metrics.last_cycle_ms, Some(25));
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(SyncMetrics::default()).unwrap();
        assert_eq!(value["pendingOperations"], 0);
        assert_eq!(value["networkQuality"], "good");
        assert!(value.get("maxErrors").is_none());
    }
}
