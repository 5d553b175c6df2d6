//! Cancellable delayed tasks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Runs futures after a delay and tracks them so they can be cancelled.
///
/// Finished tasks remove themselves. Dropping the scheduler aborts every
/// task still pending.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
}

impl TaskScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay`. Must be called inside a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tasks = Arc::clone(&self.tasks);
        // Hold the lock across spawn so a zero-delay task cannot finish
        // before its handle is registered.
        let mut guard = self.tasks.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
            tasks.lock().remove(&id);
        });
        guard.insert(id, handle);
        id
    }

    /// Cancels a pending task. Returns false if it already ran or was cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.tasks.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending task and returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for (_, handle) in &drained {
            handle.abort();
        }
        drained.len()
    }

    /// Number of tasks not yet finished.
    pub fn active(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
