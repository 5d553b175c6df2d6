//! Event-driven sync driver.
//!
//! The host forwards connectivity, timer, user and lifecycle events to a
//! [`SyncDriver`]. Events become [`DriverCommand`]s in a single inbox owned
//! by one task, which decides when to run a cycle. Cycles therefore never
//! overlap, and the periodic timer, the visibility debounce and retry
//! timers all live in that task.

use crate::config::NetworkQuality;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{CycleReport, SyncOrchestrator};
use crate::tasks::{TaskId, TaskScheduler};
use crate::transport::RemoteProgressService;
use chrono::Utc;
use memora_storage::StorageBackend;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Page or app lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The app started: pull remote state, then sync.
    Load,
    /// The app is going away: best-effort flush, then cancel retries.
    Unload,
    /// Visibility changed; a sync runs once the change settles.
    VisibilityChanged {
        /// Whether the app is now visible.
        visible: bool,
    },
    /// The app regained focus.
    Focus,
}

/// Messages accepted by the driver task.
#[derive(Debug)]
pub enum DriverCommand {
    /// Connectivity changed. Going online triggers a sync; going offline
    /// cancels pending retries.
    NetworkChanged {
        /// Whether the network is up.
        online: bool,
        /// Reported quality, if the host knows it.
        quality: Option<NetworkQuality>,
    },
    /// External timer tick.
    TimerTick,
    /// The user asked for a sync.
    UserAction,
    /// Lifecycle event.
    Lifecycle(LifecycleEvent),
    /// A backed-off operation became ready.
    RetryDue,
    /// The study session ended; pending retries are cancelled.
    EndSession,
    /// Stop the driver.
    Shutdown,
}

const INBOX_CAPACITY: usize = 64;

/// Handle to a running driver task.
pub struct SyncDriver {
    sender: mpsc::Sender<DriverCommand>,
    reports: watch::Receiver<Option<CycleReport>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncDriver {
    /// Spawns the driver task. Must be called inside a tokio runtime.
    pub fn spawn<B, T>(orchestrator: Arc<SyncOrchestrator<B, T>>) -> Self
    where
        B: StorageBackend + 'static,
        T: RemoteProgressService + 'static,
    {
        let (sender, receiver) = mpsc::channel(INBOX_CAPACITY);
        let (report_tx, reports) = watch::channel(None);
        let weak = sender.downgrade();
        let task = tokio::spawn(async move {
            DriverLoop {
                orchestrator,
                retry_sender: weak,
                reports: report_tx,
                tasks: TaskScheduler::new(),
                retry_task: None,
            }
            .run(receiver)
            .await;
        });
        Self {
            sender,
            reports,
            task: Mutex::new(Some(task)),
        }
    }

    fn send(&self, command: DriverCommand) -> SyncResult<()> {
        match self.sender.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(command)) => {
                tracing::debug!(?command, "driver inbox full, dropping trigger");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::ShutDown),
        }
    }

    /// Reports a connectivity change.
    pub fn on_network_change(&self, online: bool, quality: Option<NetworkQuality>) -> SyncResult<()> {
        self.send(DriverCommand::NetworkChanged { online, quality })
    }

    /// Reports an external timer tick.
    pub fn on_timer_tick(&self) -> SyncResult<()> {
        self.send(DriverCommand::TimerTick)
    }

    /// Requests an immediate sync.
    pub fn on_user_action(&self) -> SyncResult<()> {
        self.send(DriverCommand::UserAction)
    }

    /// Reports a lifecycle event.
    pub fn on_lifecycle(&self, event: LifecycleEvent) -> SyncResult<()> {
        self.send(DriverCommand::Lifecycle(event))
    }

    /// Cancels pending retries for the ending session.
    pub fn end_session(&self) -> SyncResult<()> {
        self.send(DriverCommand::EndSession)
    }

    /// Watches the report of the latest cycle.
    pub fn reports(&self) -> watch::Receiver<Option<CycleReport>> {
        self.reports.clone()
    }

    /// Stops the driver and waits for it to exit.
    pub async fn shutdown(&self) -> SyncResult<()> {
        // A closed inbox means the task already exited.
        let _ = self.sender.send(DriverCommand::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|_| SyncError::Cancelled)?;
        }
        Ok(())
    }
}

struct DriverLoop<B, T> {
    orchestrator: Arc<SyncOrchestrator<B, T>>,
    retry_sender: mpsc::WeakSender<DriverCommand>,
    reports: watch::Sender<Option<CycleReport>>,
    tasks: TaskScheduler,
    retry_task: Option<TaskId>,
}

impl<B, T> DriverLoop<B, T>
where
    B: StorageBackend + 'static,
    T: RemoteProgressService + 'static,
{
    fn interval(&self) -> Duration {
        let orchestrator = &self.orchestrator;
        orchestrator
            .config()
            .sync_interval(orchestrator.network_quality())
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<DriverCommand>) {
        tracing::info!("sync driver started");
        let mut next_periodic = Instant::now() + self.interval();
        let mut visibility_deadline: Option<Instant> = None;

        loop {
            let pending_debounce = visibility_deadline;
            let debounce = async move {
                match pending_debounce {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = inbox.recv() => {
                    let Some(command) = command else { break };
                    tracing::debug!(?command, "driver command");
                    match command {
                        DriverCommand::NetworkChanged { online, quality } => {
                            self.orchestrator.set_network(online, quality);
                            if online {
                                self.cycle().await;
                            } else {
                                self.cancel_retries();
                            }
                        }
                        DriverCommand::TimerTick
                        | DriverCommand::UserAction
                        | DriverCommand::RetryDue
                        | DriverCommand::Lifecycle(LifecycleEvent::Focus) => self.cycle().await,
                        DriverCommand::Lifecycle(LifecycleEvent::Load) => {
                            if let Err(e) = self.orchestrator.pull_remote().await {
                                tracing::warn!(error = %e, "initial pull failed");
                            }
                            self.cycle().await;
                        }
                        DriverCommand::Lifecycle(LifecycleEvent::VisibilityChanged { .. }) => {
                            let debounce = self.orchestrator.config().visibility_debounce;
                            visibility_deadline = Some(Instant::now() + debounce);
                            continue;
                        }
                        DriverCommand::Lifecycle(LifecycleEvent::Unload) => {
                            self.orchestrator.flush_on_unload().await;
                            self.cancel_retries();
                            continue;
                        }
                        DriverCommand::EndSession => {
                            self.cancel_retries();
                            continue;
                        }
                        DriverCommand::Shutdown => break,
                    }
                }
                _ = tokio::time::sleep_until(next_periodic) => self.cycle().await,
                _ = debounce => {
                    visibility_deadline = None;
                    self.cycle().await;
                }
            }
            next_periodic = Instant::now() + self.interval();
        }

        self.cancel_retries();
        tracing::info!("sync driver stopped");
    }

    fn cancel_retries(&mut self) {
        let cancelled = self.tasks.cancel_all();
        self.retry_task = None;
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled pending retries");
        }
    }

    async fn cycle(&mut self) {
        match self.orchestrator.sync_now().await {
            Ok(report) => {
                self.reports.send_replace(Some(report));
            }
            Err(e) => tracing::warn!(error = %e, "sync cycle failed"),
        }
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if let Some(task) = self.retry_task.take() {
            self.tasks.cancel(task);
        }
        let Some(at) = self.orchestrator.next_retry_at() else {
            return;
        };
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let sender = self.retry_sender.clone();
        self.retry_task = Some(self.tasks.schedule(delay, async move {
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(DriverCommand::RetryDue).await;
            }
        }));
        tracing::debug!(delay_ms = delay.as_millis() as u64, "retry timer set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncConfig, UserContext};
    use crate::queue::SyncQueue;
    use crate::transport::{MockReply, MockTransport};
    use memora_scheduler::CardState;
    use memora_storage::{InMemoryBackend, ProgressStore};
    use memora_sync_protocol::{EntityType, OperationType, Priority, ProgressRequest, SyncOperation};
    use serde_json::json;

    type Orchestrator = SyncOrchestrator<Arc<InMemoryBackend>, MockTransport>;

    fn orchestrator(retry: RetryConfig) -> Arc<Orchestrator> {
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(ProgressStore::new(Arc::clone(&backend)));
        let queue = Arc::new(SyncQueue::load(backend, "u1").unwrap());
        let config = SyncConfig::new(UserContext::new("u1", "d1"), "https://memora.test")
            .with_retry(retry);
        Arc::new(SyncOrchestrator::new(
            config,
            store,
            queue,
            Arc::new(MockTransport::new()),
        ))
    }

    fn enqueue_session(orchestrator: &Orchestrator, id: &str) {
        let now = Utc::now();
        let session = json!({
            "id": id,
            "startedAt": now,
            "endedAt": now,
            "cardsStudied": 3,
            "correctAnswers": 2,
            "studyTimeSeconds": 40
        });
        orchestrator
            .queue()
            .enqueue(SyncOperation::new(
                OperationType::Create,
                EntityType::Session,
                id,
                session,
                Priority::Medium,
                now,
            ))
            .unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn user_action_runs_a_cycle() {
        let orchestrator = orchestrator(RetryConfig::default());
        enqueue_session(&orchestrator, "s1");
        let driver = SyncDriver::spawn(Arc::clone(&orchestrator));
        let mut reports = driver.reports();

        driver.on_user_action().unwrap();
        reports.changed().await.unwrap();
        let report = reports.borrow().clone().unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(orchestrator.transport().sessions_sent().len(), 1);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_follows_network_quality() {
        let orchestrator = orchestrator(RetryConfig::default());
        let driver = SyncDriver::spawn(Arc::clone(&orchestrator));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(orchestrator.metrics().cycles_completed, 1);

        driver
            .on_network_change(true, Some(NetworkQuality::Poor))
            .unwrap();
        settle().await;
        assert_eq!(orchestrator.metrics().cycles_completed, 2);

        // Poor links tick every 120s.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(orchestrator.metrics().cycles_completed, 2);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(orchestrator.metrics().cycles_completed, 3);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_changes_are_debounced() {
        let orchestrator = orchestrator(RetryConfig::default());
        let driver = SyncDriver::spawn(Arc::clone(&orchestrator));

        for visible in [false, true, false, true] {
            driver
                .on_lifecycle(LifecycleEvent::VisibilityChanged { visible })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(orchestrator.metrics().cycles_completed, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orchestrator.metrics().cycles_completed, 1);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_operation_is_retried_by_timer() {
        let retry = RetryConfig::default()
            .with_base_delay(Duration::ZERO)
            .with_jitter(false);
        let orchestrator = orchestrator(retry);
        let request = ProgressRequest {
            card_id: "c1".into(),
            grade: 2,
            study_time_seconds: 8,
            session_id: None,
            checksum: None,
            last_modified: None,
            settings: None,
            version: 1,
            state: Some(CardState::new_card(2.5)),
        };
        orchestrator
            .queue()
            .enqueue(SyncOperation::new(
                OperationType::Create,
                EntityType::Progress,
                "c1",
                serde_json::to_value(&request).unwrap(),
                Priority::High,
                Utc::now(),
            ))
            .unwrap();
        orchestrator
            .transport()
            .push_reply(MockReply::Fail("connection reset".into()));
        let driver = SyncDriver::spawn(Arc::clone(&orchestrator));

        driver.on_user_action().unwrap();
        settle().await;

        assert_eq!(orchestrator.transport().progress_sent().len(), 2);
        assert!(orchestrator.queue().is_empty());
        assert_eq!(orchestrator.metrics().cycles_completed, 2);
        driver.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn offline_events_skip_cycles() {
        let orchestrator = orchestrator(RetryConfig::default());
        enqueue_session(&orchestrator, "s1");
        let driver = SyncDriver::spawn(Arc::clone(&orchestrator));

        driver.on_network_change(false, None).unwrap();
        driver.on_user_action().unwrap();
        settle().await;
        assert_eq!(orchestrator.queue().len(), 1);

        driver.on_network_change(true, None).unwrap();
        settle().await;
        assert!(orchestrator.queue().is_empty());

        driver.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unload_flushes_pending_work() {
        let orchestrator = orchestrator(RetryConfig::default());
        enqueue_session(&orchestrator, "s1");
        enqueue_session(&orchestrator, "s2");
        let driver = SyncDriver::spawn(Arc::clone(&orchestrator));

        driver.on_lifecycle(LifecycleEvent::Unload).unwrap();
        settle().await;
        assert!(orchestrator.queue().is_empty());
        assert_eq!(orchestrator.metrics().cycles_completed, 0);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn commands_after_shutdown_fail() {
        let orchestrator = orchestrator(RetryConfig::default());
        let driver = SyncDriver::spawn(orchestrator);
        driver.shutdown().await.unwrap();

        assert!(matches!(driver.on_user_action(), Err(SyncError::ShutDown)));
        driver.shutdown().await.unwrap();
    }
}
