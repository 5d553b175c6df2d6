//! Card review state and grades.

use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Review quality supplied by the learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Grade {
    /// Failed recall.
    Again = 0,
    /// Recalled with serious difficulty.
    Hard = 1,
    /// Recalled after hesitation.
    Good = 2,
    /// Recalled effortlessly.
    Easy = 3,
}

impl Grade {
    /// All grades in ascending order.
    pub const ALL: [Grade; 4] = [Grade::Again, Grade::Hard, Grade::Good, Grade::Easy];

    /// Validates an untrusted numeric grade.
    pub fn from_i64(value: i64) -> Result<Self, SchedulerError> {
        match value {
            0 => Ok(Grade::Again),
            1 => Ok(Grade::Hard),
            2 => Ok(Grade::Good),
            3 => Ok(Grade::Easy),
            other => Err(SchedulerError::InvalidGrade(other)),
        }
    }

    /// Returns the numeric code.
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for Grade {
    type Error = SchedulerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Grade::from_i64(i64::from(value))
    }
}

impl From<Grade> for u8 {
    fn from(grade: Grade) -> Self {
        grade.code()
    }
}

/// Lifecycle status of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    /// Never reviewed.
    #[default]
    New,
    /// Walking the learning steps.
    Learning,
    /// Scheduled in days.
    Review,
    /// Walking the relearning steps after a lapse.
    Relearning,
    /// Removed from scheduling.
    Suspended,
}

impl CardStatus {
    /// Returns true for statuses driven by minute-scale steps.
    pub fn is_stepped(&self) -> bool {
        matches!(
            self,
            CardStatus::New | CardStatus::Learning | CardStatus::Relearning
        )
    }
}

/// Review state of one card for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardState {
    /// Interval growth multiplier. Never below 1.3.
    pub ease_factor: f64,
    /// Current interval in days.
    pub interval: f64,
    /// Successful reviews.
    pub repetitions: u32,
    /// Lifecycle status.
    pub status: CardStatus,
    /// Index into the active step list.
    pub step_index: u32,
    /// Failed recalls from the review state.
    pub lapses: u32,
    /// Interval in days before the latest transition.
    pub previous_interval: f64,
    /// Set once lapses reach the leech threshold.
    pub is_leech: bool,
    /// Time of the latest review.
    pub last_reviewed: Option<DateTime<Utc>>,
    /// Time the card is due. `None` means the card is not scheduled.
    pub next_review: Option<DateTime<Utc>>,
}

impl CardState {
    /// Creates the state of a card that has never been reviewed.
    pub fn new_card(starting_ease: f64) -> Self {
        Self {
            ease_factor: starting_ease,
            interval: 0.0,
            repetitions: 0,
            status: CardStatus::New,
            step_index: 0,
            lapses: 0,
            previous_interval: 0.0,
            is_leech: false,
            last_reviewed: None,
            next_review: None,
        }
    }

    /// Returns true if the card should be shown at `now`.
    ///
    /// New cards are always due; suspended cards never are.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            CardStatus::Suspended => false,
            CardStatus::New => true,
            _ => self.next_review.map_or(true, |due| due <= now),
        }
    }

    /// Returns true if the card is suspended.
    pub fn is_suspended(&self) -> bool {
        self.status == CardStatus::Suspended
    }
}
