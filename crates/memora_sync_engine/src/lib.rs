//! # Memora Sync Engine
//!
//! Offline-first synchronization for Memora.
//!
//! This crate provides:
//! - [`ReviewRecorder`], the local write path (schedule, persist, enqueue)
//! - [`SyncQueue`], a durable, ordered, deduplicated operation queue
//! - [`SyncOrchestrator`], which drains the queue in batches and resolves conflicts
//! - [`SyncDriver`], an actor turning host events into sync cycles
//! - Retry with exponential backoff and jitter, cancellable via [`TaskScheduler`]
//! - Transport abstraction with HTTP mapping and an in-process loopback
//!
//! ## Architecture
//!
//! Reviews are committed locally first and confirmed remotely later:
//! 1. The recorder writes the new state as `pending` and queues an operation
//! 2. A cycle marks the record `syncing` and sends it
//! 3. On acknowledgement the record becomes `synced`; on conflict the
//!    resolver retries, adopts the server copy, or marks it `conflict`
//!
//! ## Key Invariants
//!
//! - At most one sync cycle runs at a time
//! - Within one entity, operations reach the server in enqueue order
//! - A failed write never drops the local change
//! - Retries stop at the retry ceiling and the operation is parked

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod driver;
mod error;
mod http;
mod metrics;
mod orchestrator;
mod queue;
mod recorder;
mod tasks;
mod transport;

pub use config::{NetworkQuality, RetryConfig, SyncConfig, UserContext};
pub use driver::{DriverCommand, LifecycleEvent, SyncDriver};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use metrics::{SyncErrorEntry, SyncMetrics};
pub use orchestrator::{CycleReport, SkipReason, SyncOrchestrator, SyncState};
pub use queue::{FailureOutcome, SyncQueue};
pub use recorder::{RecordedReview, ReviewRecorder};
pub use tasks::{TaskId, TaskScheduler};
pub use transport::{MockReply, MockTransport, RemoteProgressService};
