//! The SM-2 spaced-repetition update rule, exactly as spec.md §4.3.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Per-note review state, persisted in the note's frontmatter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    pub easiness: f64,
    pub interval_days: i64,
    pub repetition: u32,
    pub next_review: DateTime<Utc>,
}

impl Default for ReviewState {
    fn default() -> Self {
        Self {
            easiness: 2.5,
            interval_days: 0,
            repetition: 0,
            next_review: Utc::now(),
        }
    }
}

/// Apply one SM-2 update for a review of quality `q` (0..=5), at time `now`.
///
/// `EF' = max(1.3, EF + 0.1 - (5-q)(0.08 + (5-q)*0.02))`. If `q < 3` the
/// repetition streak resets and the note is due again tomorrow; otherwise
/// the interval follows the standard 1/6/`round(prev * EF')` day schedule.
pub fn update(state: ReviewState, quality: u8, now: DateTime<Utc>) -> ReviewState {
    let q = quality.min(5) as f64;
    let delta = 5.0 - q;
    let new_easiness = (state.easiness + 0.1 - delta * (0.08 + delta * 0.02)).max(1.3);

    let (interval_days, repetition) = if q < 3.0 {
        (1, 0)
    } else {
        let repetition = state.repetition + 1;
        let interval = match repetition {
            1 => 1,
            2 => 6,
            _ => (state.interval_days.max(1) as f64 * new_easiness).round() as i64,
        };
        (interval, repetition)
    };

    ReviewState {
        easiness: new_easiness,
        interval_days,
        repetition,
        next_review: now + Duration::days(interval_days),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn easiness_never_drops_below_1_3() {
        let mut state = ReviewState::default();
        let now = Utc::now();
        for _ in 0..10 {
            state = update(state, 0, now);
        }
        assert!(state.easiness >= 1.3);
    }

    #[test]
    fn low_quality_resets_repetition_and_interval() {
        let state = ReviewState {
            easiness: 2.5,
            interval_days: 6,
            repetition: 2,
            next_review: Utc::now(),
        };
        let now = Utc::now();
        let updated = update(state, 2, now);
        assert_eq!(updated.interval_days, 1);
        assert_eq!(updated.repetition, 0);
    }

    #[test]
    fn first_three_successful_repetitions_follow_1_6_ef_schedule() {
        let now = Utc::now();
        let mut state = ReviewState::default();
        state = update(state, 5, now);
        assert_eq!(state.interval_days, 1);
        assert_eq!(state.repetition, 1);

        state = update(state, 5, now);
        assert_eq!(state.interval_days, 6);
        assert_eq!(state.repetition, 2);

        let prev_interval = state.interval_days;
        let prev_easiness = state.easiness;
        state = update(state, 5, now);
        assert_eq!(
            state.interval_days,
            (prev_interval as f64 * state_easiness_after(prev_easiness, 5)).round() as i64
        );
        assert_eq!(state.repetition, 3);
    }

    fn state_easiness_after(prev: f64, quality: u8) -> f64 {
        let q = quality as f64;
        let delta = 5.0 - q;
        (prev + 0.1 - delta * (0.08 + delta * 0.02)).max(1.3)
    }

    #[test]
    fn next_review_is_always_in_the_future() {
        let now = Utc::now();
        let state = update(ReviewState::default(), 4, now);
        assert!(state.next_review > now);
    }
}
