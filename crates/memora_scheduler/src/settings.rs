//! Scheduling configuration and its normalizer.

use serde::{Deserialize, Serialize};

/// Ease factor floor. No transition may push a card below this value.
pub const MIN_EASE_FACTOR: f64 = 1.3;

/// Learning steps (minutes) used when none are configured.
pub const DEFAULT_LEARNING_STEPS: [f64; 2] = [1.0, 10.0];

/// Relearning steps (minutes) used when none are configured.
pub const DEFAULT_RELEARNING_STEPS: [f64; 1] = [10.0];

/// Longest accepted step: 30 days, in minutes.
const MAX_STEP_MINUTES: f64 = 43_200.0;

/// Longest accepted interval: 100 years, in days.
const MAX_INTERVAL_DAYS: f64 = 36_500.0;

/// What happens to a card once it crosses the leech threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeechAction {
    /// Record the leech flag only.
    None,
    /// Record the leech flag so the card can be tagged for review.
    #[default]
    Tag,
    /// Record the leech flag and suspend the card.
    Suspend,
}

/// Fully populated, range-clamped scheduling configuration.
///
/// Only [`PartialSettings::normalize`] and [`Default`] construct this type,
/// so every instance satisfies the documented ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnkiSettings {
    /// Learning step durations in minutes.
    pub learning_steps: Vec<f64>,
    /// Relearning step durations in minutes. May be empty: lapsed cards
    /// then stay in review.
    pub relearning_steps: Vec<f64>,
    /// Interval in days given to a card leaving its last learning step.
    pub graduating_interval: f64,
    /// Interval in days given to a new or learning card graded easy.
    pub easy_interval: f64,
    /// Extra multiplier for easy answers on review cards.
    pub easy_bonus: f64,
    /// Global multiplier applied to review intervals.
    pub interval_modifier: f64,
    /// Multiplier for hard answers on review cards.
    pub hard_multiplier: f64,
    /// Fraction of the old interval kept after a lapse.
    pub lapse_multiplier: f64,
    /// Smallest allowed interval in days.
    pub minimum_interval: f64,
    /// Largest allowed interval in days.
    pub maximum_interval: f64,
    /// Ease factor given to new cards.
    pub starting_ease: f64,
    /// Lapse count at which a card becomes a leech.
    pub leech_threshold: u32,
    /// Action taken on leeches.
    pub leech_action: LeechAction,
    /// New cards introduced per day.
    pub new_cards_per_day: u32,
    /// Reviews shown per day.
    pub reviews_per_day: u32,
    /// Multiplier applied to the current step when a learning card is graded hard.
    pub learning_hard_interval_multiplier: f64,
}

impl Default for AnkiSettings {
    fn default() -> Self {
        PartialSettings::default().normalize()
    }
}

impl AnkiSettings {
    /// Clamps a day-based interval into the configured bounds and rounds it
    /// to two decimal places.
    pub fn clamp_interval(&self, days: f64) -> f64 {
        let days = if days.is_finite() {
            days
        } else {
            self.minimum_interval
        };
        round2(days.clamp(self.minimum_interval, self.maximum_interval))
    }

    /// Re-normalizes these settings. Already-normalized settings come back unchanged.
    pub fn normalized(&self) -> Self {
        PartialSettings::from(self.clone()).normalize()
    }
}

/// Settings as supplied by a user or a remote payload: any subset of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialSettings {
    /// Overrides [`AnkiSettings::learning_steps`].
    pub learning_steps: Option<Vec<f64>>,
    /// Overrides [`AnkiSettings::relearning_steps`].
    pub relearning_steps: Option<Vec<f64>>,
    /// Overrides [`AnkiSettings::graduating_interval`].
    pub graduating_interval: Option<f64>,
    /// Overrides [`AnkiSettings::easy_interval`].
    pub easy_interval: Option<f64>,
    /// Overrides [`AnkiSettings::easy_bonus`].
    pub easy_bonus: Option<f64>,
    /// Overrides [`AnkiSettings::interval_modifier`].
    pub interval_modifier: Option<f64>,
    /// Overrides [`AnkiSettings::hard_multiplier`].
    pub hard_multiplier: Option<f64>,
    /// Overrides [`AnkiSettings::lapse_multiplier`].
    pub lapse_multiplier: Option<f64>,
    /// Overrides [`AnkiSettings::minimum_interval`].
    pub minimum_interval: Option<f64>,
    /// Overrides [`AnkiSettings::maximum_interval`].
    pub maximum_interval: Option<f64>,
    /// Overrides [`AnkiSettings::starting_ease`].
    pub starting_ease: Option<f64>,
    /// Overrides [`AnkiSettings::leech_threshold`].
    pub leech_threshold: Option<u32>,
    /// Overrides [`AnkiSettings::leech_action`].
    pub leech_action: Option<LeechAction>,
    /// Overrides [`AnkiSettings::new_cards_per_day`].
    pub new_cards_per_day: Option<u32>,
    /// Overrides [`AnkiSettings::reviews_per_day`].
    pub reviews_per_day: Option<u32>,
    /// Overrides [`AnkiSettings::learning_hard_interval_multiplier`].
    pub learning_hard_interval_multiplier: Option<f64>,
}

impl PartialSettings {
    /// Produces a fully populated [`AnkiSettings`] with every numeric field
    /// clamped into its valid range.
    ///
    /// - Missing or empty learning steps fall back to [`DEFAULT_LEARNING_STEPS`].
    /// - Missing relearning steps fall back to [`DEFAULT_RELEARNING_STEPS`];
    ///   an explicitly empty list is kept and disables relearning.
    /// - Non-finite and non-positive step values are dropped.
    /// - `maximum_interval` is raised to `minimum_interval` when smaller.
    ///
    /// Pure and idempotent.
    pub fn normalize(&self) -> AnkiSettings {
        let learning_steps = match self.learning_steps.as_deref().map(clean_steps) {
            Some(steps) if !steps.is_empty() => steps,
            _ => DEFAULT_LEARNING_STEPS.to_vec(),
        };

        let relearning_steps = match &self.relearning_steps {
            Some(steps) if steps.is_empty() => Vec::new(),
            Some(steps) => {
                let cleaned = clean_steps(steps);
                if cleaned.is_empty() {
                    DEFAULT_RELEARNING_STEPS.to_vec()
                } else {
                    cleaned
                }
            }
            None => DEFAULT_RELEARNING_STEPS.to_vec(),
        };

        let minimum_interval = clamp_or(self.minimum_interval, 1.0, 1.0, MAX_INTERVAL_DAYS);
        let maximum_interval =
            clamp_or(self.maximum_interval, MAX_INTERVAL_DAYS, 1.0, MAX_INTERVAL_DAYS)
                .max(minimum_interval);

        AnkiSettings {
            learning_steps,
            relearning_steps,
            graduating_interval: clamp_or(self.graduating_interval, 1.0, 1.0, 365.0),
            easy_interval: clamp_or(self.easy_interval, 4.0, 1.0, 365.0),
            easy_bonus: clamp_or(self.easy_bonus, 1.3, 1.0, 5.0),
            interval_modifier: clamp_or(self.interval_modifier, 1.0, 0.5, 3.0),
            hard_multiplier: clamp_or(self.hard_multiplier, 1.2, 1.0, 2.5),
            lapse_multiplier: clamp_or(self.lapse_multiplier, 0.0, 0.0, 1.0),
            minimum_interval,
            maximum_interval,
            starting_ease: clamp_or(self.starting_ease, 2.5, MIN_EASE_FACTOR, 5.0),
            leech_threshold: self.leech_threshold.unwrap_or(8).clamp(1, 99),
            leech_action: self.leech_action.unwrap_or_default(),
            new_cards_per_day: self.new_cards_per_day.unwrap_or(20).min(9999),
            reviews_per_day: self.reviews_per_day.unwrap_or(200).min(9999),
            learning_hard_interval_multiplier: clamp_or(
                self.learning_hard_interval_multiplier,
                1.5,
                1.0,
                3.0,
            ),
        }
    }
}

impl From<AnkiSettings> for PartialSettings {
    fn from(settings: AnkiSettings) -> Self {
        Self {
            learning_steps: Some(settings.learning_steps),
            relearning_steps: Some(settings.relearning_steps),
            graduating_interval: Some(settings.graduating_interval),
            easy_interval: Some(settings.easy_interval),
            easy_bonus: Some(settings.easy_bonus),
            interval_modifier: Some(settings.interval_modifier),
            hard_multiplier: Some(settings.hard_multiplier),
            lapse_multiplier: Some(settings.lapse_multiplier),
            minimum_interval: Some(settings.minimum_interval),
            maximum_interval: Some(settings.maximum_interval),
            starting_ease: Some(settings.starting_ease),
            leech_threshold: Some(settings.leech_threshold),
            leech_action: Some(settings.leech_action),
            new_cards_per_day: Some(settings.new_cards_per_day),
            reviews_per_day: Some(settings.reviews_per_day),
            learning_hard_interval_multiplier: Some(settings.learning_hard_interval_multiplier),
        }
    }
}

fn clean_steps(steps: &[f64]) -> Vec<f64> {
    steps
        .iter()
        .copied()
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(|s| s.min(MAX_STEP_MINUTES))
        .collect()
}

fn clamp_or(value: Option<f64>, default: f64, min: f64, max: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(min, max),
        _ => default,
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
