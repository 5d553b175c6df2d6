//! The scheduling state machine.
//!
//! [`Scheduler::review`] maps `(previous state, grade, now)` to a new
//! [`CardState`]. It reads no clock and keeps no state between calls.

use crate::card::{CardState, CardStatus, Grade};
use crate::error::{SchedulerError, SchedulerResult};
use crate::settings::{round2, AnkiSettings, LeechAction, MIN_EASE_FACTOR};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on study time reported for a single review.
pub const MAX_STUDY_TIME_SECONDS: i64 = 86_400;

const AGAIN_EASE_PENALTY: f64 = 0.2;
const HARD_EASE_PENALTY: f64 = 0.15;
const EASY_EASE_BONUS: f64 = 0.15;

/// Validates a reported study time and returns it as seconds.
pub fn validate_study_time(seconds: i64) -> SchedulerResult<u32> {
    if (0..=MAX_STUDY_TIME_SECONDS).contains(&seconds) {
        Ok(seconds as u32)
    } else {
        Err(SchedulerError::InvalidStudyTime(seconds))
    }
}

/// Outcome of grading one card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingResult {
    /// State after the transition.
    pub state: CardState,
    /// State before the transition.
    pub previous: CardState,
    /// When the card is next due; `None` for suspended cards.
    pub next_review: Option<DateTime<Utc>>,
    /// The grade that drove the transition.
    pub action: Grade,
    /// True if a review card was forgotten.
    pub is_lapse: bool,
    /// True if the card moved from a step list into review.
    pub graduated: bool,
    /// True if the card had never been reviewed.
    pub was_new: bool,
    /// True if this call crossed the leech threshold.
    pub became_leech: bool,
}

/// Spaced-repetition scheduler bound to one set of settings.
///
/// # Example
///
/// ```rust
/// use memora_scheduler::{AnkiSettings, CardStatus, Grade, Scheduler};
/// use chrono::Utc;
///
/// let scheduler = Scheduler::new(AnkiSettings::default());
/// let result = scheduler.review(None, Grade::Good, Utc::now()).unwrap();
/// assert_eq!(result.state.status, CardStatus::Learning);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    settings: AnkiSettings,
}

/// How the next due time is expressed.
enum Due {
    Minutes(f64),
    Days(f64),
    Never,
}

impl Scheduler {
    /// Creates a scheduler. The settings are re-normalized.
    pub fn new(settings: AnkiSettings) -> Self {
        Self {
            settings: settings.normalized(),
        }
    }

    /// Returns the active settings.
    pub fn settings(&self) -> &AnkiSettings {
        &self.settings
    }

    /// Grades a card.
    ///
    /// `previous = None` is treated as a new card created with the
    /// configured starting ease.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::CardSuspended`] for suspended cards.
    pub fn review(
        &self,
        previous: Option<&CardState>,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> SchedulerResult<SchedulingResult> {
        let previous = previous
            .cloned()
            .unwrap_or_else(|| CardState::new_card(self.settings.starting_ease));

        let mut outcome = match previous.status {
            CardStatus::Suspended => return Err(SchedulerError::CardSuspended),
            CardStatus::New | CardStatus::Learning => self.step(&previous, grade, false),
            CardStatus::Relearning => self.step(&previous, grade, true),
            CardStatus::Review => self.review_card(&previous, grade),
        };

        let state = &mut outcome.state;
        state.ease_factor = state.ease_factor.max(MIN_EASE_FACTOR);
        state.interval = self.settings.clamp_interval(state.interval);
        state.previous_interval = previous.interval;
        state.last_reviewed = Some(now);

        let mut became_leech = false;
        if outcome.is_lapse && state.lapses >= self.settings.leech_threshold {
            became_leech = !state.is_leech;
            state.is_leech = true;
            if self.settings.leech_action == LeechAction::Suspend {
                state.status = CardStatus::Suspended;
                outcome.due = Due::Never;
            }
        }

        let next_review = match outcome.due {
            Due::Minutes(minutes) => Some(now + minutes_to_duration(minutes)),
            Due::Days(days) => Some(now + days_to_duration(self.settings.clamp_interval(days))),
            Due::Never => None,
        };
        state.next_review = next_review;

        Ok(SchedulingResult {
            was_new: previous.status == CardStatus::New,
            state: outcome.state,
            previous,
            next_review,
            action: grade,
            is_lapse: outcome.is_lapse,
            graduated: outcome.graduated,
            became_leech,
        })
    }

    /// Returns the due time each grade would produce, indexed by grade code.
    pub fn preview(
        &self,
        previous: Option<&CardState>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<[Option<DateTime<Utc>>; 4]> {
        let mut due = [None; 4];
        for grade in Grade::ALL {
            due[grade.code() as usize] = self.review(previous, grade, now)?.next_review;
        }
        Ok(due)
    }

    /// Returns a suspended card to review, due immediately.
    pub fn unsuspend(&self, state: &CardState, now: DateTime<Utc>) -> CardState {
        let mut state = state.clone();
        if state.status == CardStatus::Suspended {
            state.status = CardStatus::Review;
            state.step_index = 0;
            state.interval = self.settings.clamp_interval(state.interval);
            state.next_review = Some(now);
        }
        state
    }

    /// Transitions for cards on a step list (new, learning, relearning).
    fn step(&self, card: &CardState, grade: Grade, relearning: bool) -> Outcome {
        let steps = if relearning {
            &self.settings.relearning_steps
        } else {
            &self.settings.learning_steps
        };
        let stepped_status = if relearning {
            CardStatus::Relearning
        } else {
            CardStatus::Learning
        };
        let mut state = card.clone();

        // Relearning with no steps configured (settings changed mid-lapse).
        if steps.is_empty() {
            state.status = CardStatus::Review;
            state.step_index = 0;
            state.repetitions += 1;
            return Outcome::graduated(state, Due::Days(card.interval));
        }

        let entering = card.status == CardStatus::New;
        let current = if entering {
            0
        } else {
            (card.step_index as usize).min(steps.len() - 1)
        };

        match grade {
            Grade::Again => {
                state.status = stepped_status;
                state.step_index = 0;
                Outcome::stepped(state, steps[0])
            }
            Grade::Hard => {
                state.status = stepped_status;
                state.step_index = current as u32;
                let delay = steps[current] * self.settings.learning_hard_interval_multiplier;
                Outcome::stepped(state, delay)
            }
            Grade::Good if entering => {
                state.status = stepped_status;
                state.step_index = 0;
                Outcome::stepped(state, steps[0])
            }
            Grade::Good if current + 1 < steps.len() => {
                state.status = stepped_status;
                state.step_index = (current + 1) as u32;
                Outcome::stepped(state, steps[current + 1])
            }
            Grade::Good => {
                let interval = self.settings.graduating_interval * self.settings.interval_modifier;
                state.status = CardStatus::Review;
                state.step_index = 0;
                state.repetitions += 1;
                state.interval = interval;
                Outcome::graduated(state, Due::Days(interval))
            }
            Grade::Easy => {
                let interval = if relearning {
                    self.easy_growth(card.interval, card.ease_factor)
                } else {
                    self.settings.easy_interval * self.settings.interval_modifier
                };
                state.ease_factor += EASY_EASE_BONUS;
                state.status = CardStatus::Review;
                state.step_index = 0;
                state.repetitions += 1;
                state.interval = interval;
                Outcome::graduated(state, Due::Days(interval))
            }
        }
    }

    /// Easy from review or relearning: `prev × ease × easyBonus × modifier`,
    /// rounded, at least one day longer than `prev`.
    fn easy_growth(&self, prev: f64, ease: f64) -> f64 {
        let grown =
            (prev * ease * self.settings.easy_bonus * self.settings.interval_modifier).round();
        grown.max(prev + 1.0)
    }

    /// Transitions for cards in review.
    fn review_card(&self, card: &CardState, grade: Grade) -> Outcome {
        let prev = card.interval;
        let mut state = card.clone();
        state.step_index = 0;

        match grade {
            Grade::Again => {
                state.lapses += 1;
                state.ease_factor = (card.ease_factor - AGAIN_EASE_PENALTY).max(MIN_EASE_FACTOR);
                state.interval = prev * self.settings.lapse_multiplier;
                let outcome = match self.settings.relearning_steps.first() {
                    Some(&first) => {
                        state.status = CardStatus::Relearning;
                        Outcome::stepped(state, first)
                    }
                    None => {
                        let interval = state.interval;
                        Outcome::plain(state, Due::Days(interval))
                    }
                };
                outcome.lapse()
            }
            Grade::Hard => {
                state.ease_factor = (card.ease_factor - HARD_EASE_PENALTY).max(MIN_EASE_FACTOR);
                state.interval = (prev + 1.0).max((prev * self.settings.hard_multiplier).round());
                state.repetitions += 1;
                let interval = state.interval;
                Outcome::plain(state, Due::Days(interval))
            }
            Grade::Good => {
                let grown = (prev * card.ease_factor * self.settings.interval_modifier).round();
                state.interval = grown.max(prev + 1.0);
                state.repetitions += 1;
                let interval = state.interval;
                Outcome::plain(state, Due::Days(interval))
            }
            Grade::Easy => {
                state.ease_factor = card.ease_factor + EASY_EASE_BONUS;
                state.interval = self.easy_growth(prev, card.ease_factor);
                state.repetitions += 1;
                let interval = state.interval;
                Outcome::plain(state, Due::Days(interval))
            }
        }
    }
}

/// Intermediate result of one branch of the state machine.
struct Outcome {
    state: CardState,
    due: Due,
    is_lapse: bool,
    graduated: bool,
}

impl Outcome {
    fn plain(state: CardState, due: Due) -> Self {
        Self {
            state,
            due,
            is_lapse: false,
            graduated: false,
        }
    }

    fn stepped(state: CardState, minutes: f64) -> Self {
        Self::plain(state, Due::Minutes(minutes))
    }

    fn graduated(state: CardState, due: Due) -> Self {
        Self {
            graduated: true,
            ..Self::plain(state, due)
        }
    }

    fn lapse(mut self) -> Self {
        self.is_lapse = true;
        self
    }
}

fn minutes_to_duration(minutes: f64) -> Duration {
    Duration::milliseconds((minutes * 60_000.0).round() as i64)
}

fn days_to_duration(days: f64) -> Duration {
    Duration::milliseconds((round2(days) * 86_400_000.0).round() as i64)
}
