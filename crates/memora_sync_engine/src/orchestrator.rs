//! Sync cycles: draining the queue against the remote progress service.
//!
//! One cycle pulls a batch sized for the current link quality, groups it by
//! entity type and processes each group in order:
//!
//! ```text
//! progress ─ mark syncing ─ POST /progress ─┬─ 200 ─ verify ─ commit ─ dequeue
//!                                           ├─ 409 ─ resolve ─ retry | adopt | park
//!                                           └─ err ─ backoff | park
//! sessions ─ POST /sessions (one per op)
//! stats    ─ POST /stats (one request for the group)
//! ```
//!
//! Only one cycle runs at a time. A trigger that arrives while a cycle is
//! running is a no-op.

use crate::config::{NetworkQuality, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::queue::{FailureOutcome, SyncQueue};
use crate::transport::RemoteProgressService;
use chrono::{DateTime, Utc};
use memora_scheduler::CardState;
use memora_storage::{CommitOutcome, ProgressStore, StorageBackend};
use memora_sync_protocol::{
    ConflictResolver, ConflictType, EntitySnapshot, EntityType, ProgressAccepted, ProgressRequest,
    ProgressRecord, ProtocolError, RemoteReply, RequestMeta, Resolution, StatsDelta, StudySession,
    SyncOperation, SyncStatus, SyncableEntity,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No cycle running, nothing waiting on a retry.
    Idle,
    /// A cycle is running.
    Syncing,
    /// The last cycle left operations waiting on a retry.
    Backoff,
}

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle holds the sync lock.
    AlreadySyncing,
    /// The host reported the network down, or the transport is disconnected.
    Offline,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Set when the cycle did not run.
    pub skipped: Option<SkipReason>,
    /// Operations acknowledged by the server.
    pub succeeded: usize,
    /// Conflicts resolved automatically.
    pub conflicts_resolved: usize,
    /// Operations moved to the conflict list.
    pub parked: usize,
    /// Operations rescheduled after a failure.
    pub failed: usize,
    /// Earliest scheduled retry, if any.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Wall time spent in the cycle.
    pub duration: Duration,
}

impl CycleReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Returns true if the cycle ran and nothing failed.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_none() && self.failed == 0 && self.parked == 0
    }

    fn schedule_retry(&mut self, at: DateTime<Utc>) {
        self.failed += 1;
        self.next_retry_at = Some(self.next_retry_at.map_or(at, |current| current.min(at)));
    }
}

#[derive(Debug, Clone, Copy)]
struct NetworkStatus {
    online: bool,
    reported: Option<NetworkQuality>,
    observed: NetworkQuality,
}

/// Drives sync cycles for one user.
pub struct SyncOrchestrator<B, T> {
    config: SyncConfig,
    store: Arc<ProgressStore<B>>,
    queue: Arc<SyncQueue<B>>,
    transport: Arc<T>,
    resolver: ConflictResolver,
    sync_lock: tokio::sync::Mutex<()>,
    state: RwLock<SyncState>,
    network: RwLock<NetworkStatus>,
    metrics: Mutex<SyncMetrics>,
}

impl<B, T> SyncOrchestrator<B, T>
where
    B: StorageBackend,
    T: RemoteProgressService,
{
    /// Creates an orchestrator. The network is assumed online until the
    /// host reports otherwise.
    pub fn new(
        config: SyncConfig,
        store: Arc<ProgressStore<B>>,
        queue: Arc<SyncQueue<B>>,
        transport: Arc<T>,
    ) -> Self {
        let resolver = ConflictResolver::new(config.concurrent_window);
        let metrics = SyncMetrics::new(config.max_error_history);
        Self {
            config,
            store,
            queue,
            transport,
            resolver,
            sync_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(SyncState::Idle),
            network: RwLock::new(NetworkStatus {
                online: true,
                reported: None,
                observed: NetworkQuality::default(),
            }),
            metrics: Mutex::new(metrics),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the local progress store.
    pub fn store(&self) -> &Arc<ProgressStore<B>> {
        &self.store
    }

    /// Returns the operation queue.
    pub fn queue(&self) -> &Arc<SyncQueue<B>> {
        &self.queue
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Records a connectivity change reported by the host.
    ///
    /// `quality` overrides the latency-derived quality; `None` goes back to
    /// deriving it.
    pub fn set_network(&self, online: bool, quality: Option<NetworkQuality>) {
        let mut network = self.network.write();
        network.online = online;
        network.reported = quality;
    }

    /// Returns true if the host reports the network up and the transport is
    /// connected.
    pub fn is_online(&self) -> bool {
        self.network.read().online && self.transport.is_connected()
    }

    /// Effective link quality.
    pub fn network_quality(&self) -> NetworkQuality {
        let network = self.network.read();
        network.reported.unwrap_or(network.observed)
    }

    /// Metrics snapshot.
    pub fn metrics(&self) -> SyncMetrics {
        let mut metrics = self.metrics.lock().clone();
        metrics.pending_operations = self.queue.len();
        metrics.conflicts = self.queue.conflicted().len();
        metrics.network_quality = self.network_quality();
        metrics
    }

    /// Earliest time a backed-off operation becomes ready.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.queue.next_attempt_at()
    }

    /// Runs one sync cycle now.
    pub async fn sync_now(&self) -> SyncResult<CycleReport> {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            tracing::debug!("sync already in progress");
            return Ok(CycleReport::skipped(SkipReason::AlreadySyncing));
        };
        if !self.is_online() {
            tracing::debug!("offline, skipping sync");
            return Ok(CycleReport::skipped(SkipReason::Offline));
        }

        *self.state.write() = SyncState::Syncing;
        let started = Instant::now();
        let mut report = CycleReport::default();

        let result = self.run_cycle(&mut report).await;

        report.duration = started.elapsed();
        let finished_at = Utc::now();
        let next = if self.queue.next_attempt_at().is_some() {
            SyncState::Backoff
        } else {
            SyncState::Idle
        };
        *self.state.write() = next;

        {
            let mut metrics = self.metrics.lock();
            if let Err(e) = &result {
                metrics.record_error(finished_at, None, e.to_string());
            }
            metrics.record_cycle(report.duration, result.is_ok() && report.is_clean(), finished_at);
        }

        tracing::info!(
            succeeded = report.succeeded,
            conflicts_resolved = report.conflicts_resolved,
            parked = report.parked,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "sync cycle finished"
        );
        result.map(|()| report)
    }

    async fn run_cycle(&self, report: &mut CycleReport) -> SyncResult<()> {
        if self.queue.is_dirty() {
            self.queue.persist()?;
        }

        let limit = self.config.batch_size(self.network_quality());
        let batch = self.queue.take_batch(limit, Utc::now());
        if batch.is_empty() {
            return Ok(());
        }
        tracing::debug!(operations = batch.len(), limit, "sync cycle started");

        let mut groups: BTreeMap<EntityType, Vec<SyncOperation>> = BTreeMap::new();
        for op in batch {
            groups.entry(op.entity_type).or_default().push(op);
        }

        for (entity_type, ops) in groups {
            match entity_type {
                EntityType::Progress => {
                    for op in ops {
                        self.process_progress(op, report).await?;
                    }
                }
                EntityType::Session => {
                    for op in ops {
                        self.process_session(op, report).await?;
                    }
                }
                EntityType::Stats => self.process_stats(ops, report).await?,
            }
        }
        Ok(())
    }

    fn meta(&self, op: &SyncOperation) -> RequestMeta {
        let mut meta = RequestMeta::new(self.config.user.device_id.clone(), op.id)
            .with_user(self.config.user.user_id.clone());
        meta.client_version = self.config.client_version.clone();
        meta
    }

    /// Runs a transport call under the request timeout and records its latency.
    async fn call<R>(&self, request: impl Future<Output = SyncResult<R>>) -> SyncResult<R> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, request)
            .await
            .map_err(|_| SyncError::Timeout)?;
        let latency = started.elapsed();

        self.metrics.lock().record_latency(latency);
        self.network.write().observed = NetworkQuality::from_latency(latency);
        result
    }

    async fn process_progress(&self, op: SyncOperation, report: &mut CycleReport) -> SyncResult<()> {
        let user_id = self.config.user.user_id.as_str();
        let request: ProgressRequest = match serde_json::from_value(op.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                return self.park(&op, &format!("undecodable payload: {e}"), report);
            }
        };

        self.store
            .mark_status(user_id, &op.entity_id, SyncStatus::Syncing)?;
        let reply = self
            .call(self.transport.post_progress(&self.meta(&op), &request))
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => return self.fail(&op, e, report),
        };
        match self.apply_reply(&op, &request, reply, report) {
            Err(SyncError::Storage(e)) => Err(SyncError::Storage(e)),
            Err(e) => {
                tracing::warn!(card_id = %op.entity_id, error = %e, "unusable server reply");
                self.fail(
                    &op,
                    SyncError::transport_retryable(format!("unusable reply: {e}")),
                    report,
                )
            }
            Ok(()) => Ok(()),
        }
    }

    /// Commits or resolves one reply. Only storage errors are fatal to the
    /// cycle; any other error is charged to `op` by the caller.
    fn apply_reply(
        &self,
        op: &SyncOperation,
        request: &ProgressRequest,
        reply: RemoteReply<ProgressAccepted>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        match reply {
            RemoteReply::Accepted(accepted) => {
                if !accepted.verify_checksum()? {
                    tracing::warn!(
                        card_id = %op.entity_id,
                        "server state failed checksum verification"
                    );
                    let server = EntitySnapshot {
                        version: accepted.version,
                        last_modified: accepted.last_modified,
                        checksum: Some(accepted.checksum.clone()),
                        data: serde_json::to_value(&accepted.state).map_err(ProtocolError::from)?,
                    };
                    return self.resolve(op, request, ConflictType::Data, server, report);
                }
                self.commit(op, request, &accepted, report)
            }
            RemoteReply::Conflict(body) => {
                let server = body.server_snapshot()?;
                self.resolve(op, request, body.conflict_type, server, report)
            }
        }
    }

    fn commit(
        &self,
        op: &SyncOperation,
        request: &ProgressRequest,
        accepted: &ProgressAccepted,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let user_id = self.config.user.user_id.as_str();
        let outcome = self
            .store
            .commit_synced(user_id, accepted, request.version, Utc::now())?;
        if let CommitOutcome::Superseded(_) = outcome {
            tracing::debug!(card_id = %op.entity_id, "local record changed while in flight");
        }
        self.queue.complete(op)?;
        self.acknowledge(op, report);
        Ok(())
    }

    fn acknowledge(&self, op: &SyncOperation, report: &mut CycleReport) {
        report.succeeded += 1;
        self.metrics.lock().operations_synced += 1;
        tracing::debug!(
            operation_id = %op.id,
            entity_type = ?op.entity_type,
            entity_id = %op.entity_id,
            "operation synced"
        );
    }

    /// Returns true if a newer local mutation was folded into `op` after it
    /// was sent.
    fn superseded(&self, op: &SyncOperation) -> bool {
        self.queue
            .find(op.id)
            .map_or(true, |queued| queued.payload != op.payload)
    }

    fn resolve(
        &self,
        op: &SyncOperation,
        request: &ProgressRequest,
        conflict_type: ConflictType,
        server: EntitySnapshot,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let user_id = self.config.user.user_id.as_str();
        let now = Utc::now();
        if self.superseded(op) {
            tracing::debug!(
                card_id = %op.entity_id,
                "conflict on a superseded payload, resending latest"
            );
            self.store
                .mark_status(user_id, &op.entity_id, SyncStatus::Pending)?;
            return Ok(());
        }

        let local_record = self.store.get(user_id, &op.entity_id)?;
        let local_fields = match &local_record {
            Some(record) => serde_json::to_value(record),
            None => serde_json::to_value(&request.state),
        }
        .map_err(ProtocolError::from)?;
        let local = request.snapshot(local_fields, now);

        match self.resolver.resolve(conflict_type, &local, &server, now) {
            Resolution::Retry(winner) => {
                let state: CardState =
                    serde_json::from_value(winner.data.clone()).map_err(ProtocolError::from)?;
                let mut record = match local_record {
                    Some(record) => record,
                    None => ProgressRecord::create(
                        user_id,
                        op.entity_id.as_str(),
                        state.clone(),
                        winner.last_modified,
                    )?,
                };
                record.state = state.clone();
                record.meta.version = winner.version;
                record.meta.last_modified = winner.last_modified;
                record.meta.checksum = record.compute_checksum()?;
                record.meta.sync_status = SyncStatus::Pending;
                self.store.upsert(&record)?;

                let retry = ProgressRequest {
                    state: Some(state),
                    version: winner.version,
                    checksum: Some(record.meta.checksum.clone()),
                    last_modified: Some(winner.last_modified),
                    ..request.clone()
                };
                self.queue.replace_payload(
                    op.id,
                    serde_json::to_value(&retry).map_err(ProtocolError::from)?,
                )?;
                report.conflicts_resolved += 1;
                tracing::info!(
                    card_id = %op.entity_id,
                    ?conflict_type,
                    version = winner.version,
                    "conflict resolved, re-sending local state"
                );
            }
            Resolution::AcceptServer(winner) => {
                let state: CardState =
                    serde_json::from_value(winner.data.clone()).map_err(ProtocolError::from)?;
                let remote = ProgressAccepted::new(
                    op.entity_id.as_str(),
                    state,
                    winner.version,
                    winner.last_modified,
                )?;
                self.store.adopt_remote(user_id, &remote, now)?;
                self.queue.remove(op.id)?;
                report.conflicts_resolved += 1;
                tracing::info!(
                    card_id = %op.entity_id,
                    ?conflict_type,
                    version = winner.version,
                    "conflict resolved, adopted server state"
                );
            }
            Resolution::Manual { reason } => {
                self.store
                    .mark_status(user_id, &op.entity_id, SyncStatus::Conflict)?;
                self.park(op, &reason, report)?;
                tracing::warn!(
                    card_id = %op.entity_id,
                    ?conflict_type,
                    %reason,
                    "conflict needs manual resolution"
                );
            }
        }
        Ok(())
    }

    fn park(&self, op: &SyncOperation, reason: &str, report: &mut CycleReport) -> SyncResult<()> {
        self.queue.park(op.id, reason)?;
        report.parked += 1;
        self.metrics
            .lock()
            .record_error(Utc::now(), Some(op.id), reason.to_string());
        tracing::warn!(operation_id = %op.id, entity_id = %op.entity_id, reason, "operation parked");
        Ok(())
    }

    fn fail(&self, op: &SyncOperation, error: SyncError, report: &mut CycleReport) -> SyncResult<()> {
        let user_id = self.config.user.user_id.as_str();
        let now = Utc::now();
        let message = error.to_string();
        self.metrics
            .lock()
            .record_error(now, Some(op.id), message.clone());

        let parked = if error.is_retryable() {
            match self
                .queue
                .record_failure(op.id, &message, now, &self.config.retry)?
            {
                FailureOutcome::Retry {
                    attempt,
                    delay,
                    next_attempt_at,
                } => {
                    report.schedule_retry(next_attempt_at);
                    tracing::warn!(
                        operation_id = %op.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "operation failed, retry scheduled"
                    );
                    false
                }
                FailureOutcome::Parked => {
                    report.parked += 1;
                    tracing::warn!(
                        operation_id = %op.id,
                        error = %message,
                        "retry limit reached, operation parked"
                    );
                    true
                }
                FailureOutcome::Missing => false,
            }
        } else {
            self.queue.park(op.id, &message)?;
            report.parked += 1;
            tracing::warn!(operation_id = %op.id, error = %message, "operation rejected, parked");
            true
        };

        if op.entity_type == EntityType::Progress {
            let status = if parked {
                SyncStatus::Conflict
            } else {
                SyncStatus::Pending
            };
            self.store.mark_status(user_id, &op.entity_id, status)?;
        }
        Ok(())
    }

    async fn process_session(&self, op: SyncOperation, report: &mut CycleReport) -> SyncResult<()> {
        let session: StudySession = match serde_json::from_value(op.payload.clone()) {
            Ok(session) => session,
            Err(e) => return self.park(&op, &format!("undecodable payload: {e}"), report),
        };
        match self
            .call(self.transport.post_session(&self.meta(&op), &session))
            .await
        {
            Ok(()) => {
                self.queue.complete(&op)?;
                self.acknowledge(&op, report);
                Ok(())
            }
            Err(e) => self.fail(&op, e, report),
        }
    }

    async fn process_stats(&self, ops: Vec<SyncOperation>, report: &mut CycleReport) -> SyncResult<()> {
        let mut deltas = Vec::with_capacity(ops.len());
        let mut sendable = Vec::with_capacity(ops.len());
        for op in ops {
            match serde_json::from_value::<StatsDelta>(op.payload.clone()) {
                Ok(delta) => {
                    deltas.push(delta);
                    sendable.push(op);
                }
                Err(e) => self.park(&op, &format!("undecodable payload: {e}"), report)?,
            }
        }
        let Some(first) = sendable.first() else {
            return Ok(());
        };

        match self
            .call(self.transport.post_stats(&self.meta(first), &deltas))
            .await
        {
            Ok(()) => {
                for (op, sent) in sendable.iter().zip(&deltas) {
                    if let Err(e) = self.settle_stats(op, sent) {
                        if matches!(e, SyncError::Storage(_)) {
                            return Err(e);
                        }
                        self.park(op, &format!("unmergeable stats: {e}"), report)?;
                        continue;
                    }
                    self.acknowledge(op, report);
                }
                Ok(())
            }
            Err(e) => {
                for op in &sendable {
                    let error = if e.is_retryable() {
                        SyncError::transport_retryable(e.to_string())
                    } else {
                        SyncError::transport_fatal(e.to_string())
                    };
                    self.fail(op, error, report)?;
                }
                Ok(())
            }
        }
    }

    /// Dequeues an acknowledged stats operation.
    ///
    /// Reviews recorded while the request was in flight were folded into the
    /// queued payload; only that remainder stays queued.
    fn settle_stats(&self, op: &SyncOperation, sent: &StatsDelta) -> SyncResult<bool> {
        self.queue.complete_with(op, |queued| {
            let mut remaining: StatsDelta =
                serde_json::from_value(queued.clone()).map_err(ProtocolError::from)?;
            remaining.subtract(sent)?;
            if remaining.is_empty() {
                return Ok(None);
            }
            Ok(Some(serde_json::to_value(&remaining).map_err(ProtocolError::from)?))
        })
    }

    /// Fetches every remote row and adopts those newer than the local copy.
    ///
    /// Records with unacknowledged local changes are left alone. Rows that
    /// fail checksum verification are skipped. Returns the number adopted.
    pub async fn pull_remote(&self) -> SyncResult<usize> {
        let _guard = self.sync_lock.lock().await;
        if !self.is_online() {
            return Err(SyncError::NotConnected);
        }
        let user_id = self.config.user.user_id.as_str();
        let meta = RequestMeta::new(self.config.user.device_id.clone(), Uuid::new_v4())
            .with_user(user_id);
        let rows = self.call(self.transport.get_progress(&meta)).await?;

        let now = Utc::now();
        let mut adopted = 0;
        for row in &rows {
            if !row.verify_checksum().unwrap_or(false) {
                tracing::warn!(card_id = %row.card_id, "skipping remote row with bad checksum");
                continue;
            }
            if self.store.adopt_if_newer(user_id, row, now)? {
                adopted += 1;
            }
        }
        tracing::info!(rows = rows.len(), adopted, "pulled remote progress");
        Ok(adopted)
    }

    /// Best-effort flush before the host goes away.
    ///
    /// Sends every ready operation once. Successes are committed; failures
    /// are left queued without touching their retry state. Returns the
    /// number of operations acknowledged.
    pub async fn flush_on_unload(&self) -> usize {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            return 0;
        };
        if !self.is_online() {
            return 0;
        }
        let user_id = self.config.user.user_id.as_str();
        let batch = self.queue.take_batch(usize::MAX, Utc::now());
        let mut flushed = 0;

        for op in batch {
            let sent = match op.entity_type {
                EntityType::Progress => {
                    let Ok(request) = serde_json::from_value::<ProgressRequest>(op.payload.clone())
                    else {
                        continue;
                    };
                    match self.transport.post_progress(&self.meta(&op), &request).await {
                        Ok(RemoteReply::Accepted(accepted))
                            if accepted.verify_checksum().unwrap_or(false) =>
                        {
                            self.store
                                .commit_synced(user_id, &accepted, request.version, Utc::now())
                                .is_ok()
                        }
                        _ => false,
                    }
                }
                EntityType::Session => match serde_json::from_value::<StudySession>(op.payload.clone()) {
                    Ok(session) => self
                        .transport
                        .post_session(&self.meta(&op), &session)
                        .await
                        .is_ok(),
                    Err(_) => false,
                },
                EntityType::Stats => {
                    let Ok(delta) = serde_json::from_value::<StatsDelta>(op.payload.clone()) else {
                        continue;
                    };
                    let posted = self
                        .transport
                        .post_stats(&self.meta(&op), std::slice::from_ref(&delta))
                        .await
                        .is_ok();
                    if posted && self.settle_stats(&op, &delta).is_ok() {
                        flushed += 1;
                    }
                    continue;
                }
            };
            if sent && self.queue.complete(&op).is_ok() {
                flushed += 1;
            }
        }
        tracing::info!(flushed, "flushed on unload");
        flushed
    }

    /// Resolves a parked operation: `keep` re-queues it, otherwise it is
    /// discarded. Returns false if no such operation is parked.
    pub fn resolve_conflict(&self, op_id: Uuid, keep: bool) -> SyncResult<bool> {
        let parked = self.queue.conflicted().into_iter().find(|op| op.id == op_id);
        let Some(op) = parked else {
            return Ok(false);
        };
        self.queue.resolve_parked(op_id, keep)?;
        if keep && op.entity_type == EntityType::Progress {
            self.store.mark_status(
                &self.config.user.user_id,
                &op.entity_id,
                SyncStatus::Pending,
            )?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, UserContext};
    use crate::transport::{MockReply, MockTransport};
    use chrono::Duration as ChronoDuration;
    use memora_scheduler::{Grade, Scheduler};
    use memora_storage::InMemoryBackend;
    use memora_sync_protocol::{ConflictBody, OperationType, Priority};
    use serde_json::json;

    type Orchestrator = SyncOrchestrator<Arc<InMemoryBackend>, MockTransport>;

    fn config() -> SyncConfig {
        SyncConfig::new(UserContext::new("u1", "d1"), "https://memora.test")
            .with_retry(RetryConfig::default().with_jitter(false))
    }

    fn setup_with(config: SyncConfig) -> Orchestrator {
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(ProgressStore::new(Arc::clone(&backend)));
        let queue = Arc::new(SyncQueue::load(backend, "u1").unwrap());
        SyncOrchestrator::new(config, store, queue, Arc::new(MockTransport::new()))
    }

    fn setup() -> Orchestrator {
        setup_with(config())
    }

    /// Reviews `card_id` as Good and queues the update like the recorder does.
    fn review(orchestrator: &Orchestrator, card_id: &str, at: DateTime<Utc>) -> ProgressRecord {
        let previous = orchestrator.store().get("u1", card_id).unwrap();
        let result = Scheduler::default()
            .review(previous.as_ref().map(|r| &r.state), Grade::Good, at)
            .unwrap();
        let record = orchestrator
            .store()
            .apply_review("u1", card_id, &result.state, at)
            .unwrap();
        let request = ProgressRequest::from_record(&record, Grade::Good, 5, None, None);
        orchestrator
            .queue()
            .enqueue(SyncOperation::new(
                OperationType::Update,
                EntityType::Progress,
                card_id,
                serde_json::to_value(&request).unwrap(),
                Priority::High,
                at,
            ))
            .unwrap();
        record
    }

    fn conflict(conflict_type: ConflictType, server_version: u64, last_modified: DateTime<Utc>) -> ConflictBody {
        let mut state = CardState::new_card(2.5);
        state.interval = 42.0;
        state.status = memora_scheduler::CardStatus::Review;
        let mut data = serde_json::to_value(&state).unwrap();
        data["lastModified"] = json!(last_modified);
        ConflictBody {
            conflict_type,
            server_version,
            client_version: 1,
            server_data: data,
        }
    }

    #[tokio::test]
    async fn accepted_operation_is_committed_and_dequeued() {
        let orchestrator = setup();
        review(&orchestrator, "c1", Utc::now());

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(report.is_clean());
        assert!(orchestrator.queue().is_empty());

        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.sync_status, SyncStatus::Synced);
        assert!(record.last_synced.is_some());
        assert_eq!(orchestrator.state(), SyncState::Idle);

        let metrics = orchestrator.metrics();
        assert_eq!(metrics.operations_synced, 1);
        assert!(metrics.last_successful_sync.is_some());
        assert_eq!(metrics.pending_operations, 0);
    }

    #[tokio::test]
    async fn offline_cycle_is_skipped() {
        let orchestrator = setup();
        review(&orchestrator, "c1", Utc::now());
        orchestrator.set_network(false, None);

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        assert_eq!(orchestrator.queue().len(), 1);
        assert!(orchestrator.transport().progress_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_trigger_is_a_no_op() {
        let orchestrator = Arc::new(setup());
        orchestrator
            .transport()
            .set_latency(std::time::Duration::from_millis(500));
        review(&orchestrator, "c1", Utc::now());

        let background = Arc::clone(&orchestrator);
        let first = tokio::spawn(async move { background.sync_now().await });
        tokio::task::yield_now().await;

        let second = orchestrator.sync_now().await.unwrap();
        assert_eq!(second.skipped, Some(SkipReason::AlreadySyncing));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(orchestrator.transport().progress_sent().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_backs_off() {
        let orchestrator = setup();
        review(&orchestrator, "c1", Utc::now());
        orchestrator
            .transport()
            .push_reply(MockReply::Fail("connection reset".into()));

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.next_retry_at.is_some());
        assert_eq!(orchestrator.state(), SyncState::Backoff);

        let queued = orchestrator.queue().snapshot();
        assert_eq!(queued[0].retry_count, 1);
        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.sync_status, SyncStatus::Pending);

        // Not ready yet: the next cycle sends nothing.
        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(orchestrator.transport().progress_sent().len(), 1);
        assert_eq!(orchestrator.metrics().errors.len(), 1);
    }

    #[tokio::test]
    async fn fatal_failure_parks_immediately() {
        let orchestrator = setup();
        review(&orchestrator, "c1", Utc::now());
        orchestrator
            .transport()
            .push_reply(MockReply::Fatal("400: grade must be 0-3".into()));

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.parked, 1);
        assert!(orchestrator.queue().is_empty());
        assert_eq!(orchestrator.queue().conflicted().len(), 1);
        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.sync_status, SyncStatus::Conflict);
        assert_eq!(orchestrator.metrics().conflicts, 1);
    }

    #[tokio::test]
    async fn stale_version_conflict_adopts_server_state() {
        let orchestrator = setup();
        let now = Utc::now();
        review(&orchestrator, "c1", now - ChronoDuration::minutes(10));
        orchestrator.transport().push_reply(MockReply::Conflict(conflict(
            ConflictType::Version,
            7,
            now,
        )));

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.conflicts_resolved, 1);
        assert!(orchestrator.queue().is_empty());

        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.version, 7);
        assert_eq!(record.state.interval, 42.0);
        assert_eq!(record.meta.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn newer_local_version_conflict_is_resent() {
        let orchestrator = setup();
        let now = Utc::now();
        let local = review(&orchestrator, "c1", now);
        orchestrator.transport().push_reply(MockReply::Conflict(conflict(
            ConflictType::Version,
            4,
            now - ChronoDuration::hours(1),
        )));

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(orchestrator.queue().len(), 1);

        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.version, 5);
        assert_eq!(record.state, local.state);
        assert_eq!(record.meta.sync_status, SyncStatus::Pending);

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 1);
        let sent = orchestrator.transport().progress_sent();
        assert_eq!(sent[1].1.version, 5);
        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn concurrent_conflict_merges_with_local_fields_winning() {
        let orchestrator = setup();
        let now = Utc::now();
        let local = review(&orchestrator, "c1", now);
        orchestrator.transport().push_reply(MockReply::Conflict(conflict(
            ConflictType::Concurrent,
            3,
            now,
        )));

        orchestrator.sync_now().await.unwrap();
        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.version, 4);
        assert_eq!(record.state.interval, local.state.interval);
        assert_eq!(record.state.status, local.state.status);
        assert!(record.verify_checksum().unwrap());
    }

    #[tokio::test]
    async fn data_conflict_without_newer_local_is_parked() {
        let orchestrator = setup();
        let now = Utc::now();
        review(&orchestrator, "c1", now - ChronoDuration::minutes(5));
        orchestrator
            .transport()
            .push_reply(MockReply::Conflict(conflict(ConflictType::Data, 1, now)));

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.parked, 1);
        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.sync_status, SyncStatus::Conflict);

        let parked = orchestrator.queue().conflicted();
        assert!(orchestrator.resolve_conflict(parked[0].id, true).unwrap());
        assert_eq!(orchestrator.queue().len(), 1);
        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn tampered_acknowledgement_is_a_data_conflict() {
        let orchestrator = setup();
        let now = Utc::now();
        review(&orchestrator, "c1", now - ChronoDuration::minutes(5));
        let mut accepted =
            ProgressAccepted::new("c1", CardState::new_card(2.5), 1, now).unwrap();
        accepted.checksum = "0".repeat(64);
        orchestrator
            .transport()
            .push_reply(MockReply::AcceptWith(accepted));

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.parked, 1);
        let record = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(record.meta.sync_status, SyncStatus::Conflict);
    }

    #[tokio::test]
    async fn batch_size_follows_network_quality() {
        let orchestrator = setup();
        let now = Utc::now();
        for n in 0..6 {
            review(&orchestrator, &format!("c{n}"), now);
        }
        orchestrator.set_network(true, Some(NetworkQuality::Poor));

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(orchestrator.queue().len(), 4);
        assert_eq!(orchestrator.metrics().network_quality, NetworkQuality::Poor);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_link_is_observed_as_poor() {
        let orchestrator = setup();
        orchestrator
            .transport()
            .set_latency(std::time::Duration::from_millis(1500));
        review(&orchestrator, "c1", Utc::now());

        orchestrator.sync_now().await.unwrap();
        assert_eq!(orchestrator.network_quality(), NetworkQuality::Poor);
        assert!(orchestrator.metrics().last_latency_ms.unwrap() >= 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_is_retryable() {
        let orchestrator =
            setup_with(config().with_timeout(std::time::Duration::from_millis(100)));
        orchestrator
            .transport()
            .set_latency(std::time::Duration::from_secs(1));
        review(&orchestrator, "c1", Utc::now());

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        let queued = orchestrator.queue().snapshot();
        assert_eq!(queued[0].last_error.as_deref(), Some("operation timed out"));
    }

    #[tokio::test]
    async fn stats_are_sent_in_one_request() {
        let orchestrator = setup();
        let now = Utc::now();
        for day in 1..=2 {
            let delta = StatsDelta::for_review(
                chrono::NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
                Grade::Good,
                10,
                true,
                false,
            );
            orchestrator
                .queue()
                .enqueue(SyncOperation::new(
                    OperationType::Update,
                    EntityType::Stats,
                    delta.entity_id(),
                    serde_json::to_value(&delta).unwrap(),
                    Priority::Low,
                    now,
                ))
                .unwrap();
        }

        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(orchestrator.transport().stats_sent().len(), 2);
        assert!(orchestrator.queue().is_empty());
    }

    #[tokio::test]
    async fn pull_adopts_newer_rows_only() {
        let orchestrator = setup();
        let now = Utc::now();
        review(&orchestrator, "local-edit", now);

        let mut state = CardState::new_card(2.5);
        state.interval = 9.0;
        orchestrator.transport().set_remote_rows(vec![
            ProgressAccepted::new("remote-only", state.clone(), 3, now).unwrap(),
            ProgressAccepted::new("local-edit", state, 9, now).unwrap(),
        ]);

        assert_eq!(orchestrator.pull_remote().await.unwrap(), 1);
        let adopted = orchestrator.store().get("u1", "remote-only").unwrap().unwrap();
        assert_eq!(adopted.meta.version, 3);
        let kept = orchestrator.store().get("u1", "local-edit").unwrap().unwrap();
        assert_eq!(kept.meta.version, 1);
    }

    #[tokio::test]
    async fn unload_flush_leaves_failures_untouched() {
        let orchestrator = setup();
        let now = Utc::now();
        review(&orchestrator, "c1", now);
        review(&orchestrator, "c2", now);
        orchestrator
            .transport()
            .push_reply(MockReply::Fail("reset".into()));

        assert_eq!(orchestrator.flush_on_unload().await, 1);
        let queued = orchestrator.queue().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].entity_id, "c1");
        assert_eq!(queued[0].retry_count, 0);
    }

    /// Folds `delta` into the queued stats like the recorder does.
    fn add_stats(orchestrator: &Orchestrator, delta: &StatsDelta) {
        orchestrator
            .queue()
            .upsert_with(
                EntityType::Stats,
                &delta.entity_id(),
                OperationType::Update,
                Priority::Low,
                Utc::now(),
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
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stats_recorded_during_upload_are_sent_once() {
        let orchestrator = Arc::new(setup());
        orchestrator
            .transport()
            .set_latency(std::time::Duration::from_millis(500));
        let delta = StatsDelta::for_review(Utc::now().date_naive(), Grade::Good, 10, false, true);
        add_stats(&orchestrator, &delta);

        let background = Arc::clone(&orchestrator);
        let cycle = tokio::spawn(async move { background.sync_now().await });
        tokio::task::yield_now().await;
        add_stats(&orchestrator, &delta);

        let first = cycle.await.unwrap().unwrap();
        assert_eq!(first.succeeded, 1);
        let queued = orchestrator.queue().snapshot();
        assert_eq!(queued.len(), 1);
        let remaining: StatsDelta = serde_json::from_value(queued[0].payload.clone()).unwrap();
        assert_eq!(remaining, delta);

        orchestrator.sync_now().await.unwrap();
        let sent = orchestrator.transport().stats_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent.iter().map(|d| d.cards_studied).sum::<u32>(), 2);
        assert_eq!(sent.iter().map(|d| d.study_time).sum::<u64>(), 20);
        assert!(orchestrator.queue().is_empty());
    }

    #[tokio::test]
    async fn malformed_conflict_reply_backs_off_then_parks() {
        let retry = RetryConfig::default()
            .with_jitter(false)
            .with_base_delay(std::time::Duration::ZERO);
        let orchestrator = setup_with(config().with_retry(retry));
        let now = Utc::now();
        review(&orchestrator, "c1", now);
        review(&orchestrator, "c2", now + ChronoDuration::seconds(1));

        let mut body = conflict(ConflictType::Version, 4, now);
        body.server_data
            .as_object_mut()
            .unwrap()
            .remove("lastModified");
        orchestrator
            .transport()
            .push_reply(MockReply::Conflict(body.clone()));

        // The bad reply is charged to c1 alone; c2 still goes through.
        let report = orchestrator.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        let queued = orchestrator.queue().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].entity_id, "c1");
        assert_eq!(queued[0].retry_count, 1);
        let c1 = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(c1.meta.sync_status, SyncStatus::Pending);
        let c2 = orchestrator.store().get("u1", "c2").unwrap().unwrap();
        assert_eq!(c2.meta.sync_status, SyncStatus::Synced);

        for _ in 0..4 {
            orchestrator
                .transport()
                .push_reply(MockReply::Conflict(body.clone()));
            orchestrator.sync_now().await.unwrap();
        }
        assert!(orchestrator.queue().is_empty());
        assert_eq!(orchestrator.queue().conflicted().len(), 1);
        let c1 = orchestrator.store().get("u1", "c1").unwrap().unwrap();
        assert_eq!(c1.meta.sync_status, SyncStatus::Conflict);
    }
}
