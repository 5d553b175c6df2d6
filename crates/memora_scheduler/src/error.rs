//! Error types for scheduling.

use thiserror::Error;

/// Result type for scheduling operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised before any card state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Grade outside `0..=3`.
    #[error("invalid grade {0}: expected 0 (again) to 3 (easy)")]
    InvalidGrade(i64),

    /// Study time outside `0..=86400` seconds.
    #[error("invalid study time {0}s: expected 0 to 86400 seconds")]
    InvalidStudyTime(i64),

    /// Suspended cards must be unsuspended before they can be graded.
    #[error("card is suspended")]
    CardSuspended,
}
