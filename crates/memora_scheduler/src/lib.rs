//! # Memora Scheduler
//!
//! Spaced-repetition scheduling for Memora.
//!
//! This crate provides:
//! - [`AnkiSettings`] and the settings normalizer ([`PartialSettings::normalize`])
//! - [`CardState`] for the per-card review record
//! - [`Scheduler`], a pure transition function from a grade to a new card state
//!
//! ## State Machine
//!
//! ```text
//! new → learning → review ⇄ relearning
//!                  review | relearning → suspended (leech action)
//! ```
//!
//! ## Key Invariants
//!
//! - Every transition is deterministic: identical inputs produce identical outputs
//! - `interval` is clamped to `[minimum_interval, maximum_interval]` after every transition
//! - `ease_factor` never drops below [`MIN_EASE_FACTOR`]
//! - A suspended card is never scheduled (`next_review` is `None`)
//!
//! This is a pure crate with no I/O and no clock access; callers pass `now`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod card;
mod error;
mod scheduler;
mod settings;

pub use card::{CardState, CardStatus, Grade};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{validate_study_time, Scheduler, SchedulingResult, MAX_STUDY_TIME_SECONDS};
pub use settings::{
    AnkiSettings, LeechAction, PartialSettings, DEFAULT_LEARNING_STEPS, DEFAULT_RELEARNING_STEPS,
    MIN_EASE_FACTOR,
};
