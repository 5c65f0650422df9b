//! Per-tier circuit breaker guarding stage escalation against a provider
//! outage.
//!
//! Mirrors [`super::batch::ProviderRateLimiter`]'s mutex-guarded-state idiom:
//! a small map behind a single `Mutex`, keyed here by [`ModelTier`] rather
//! than [`Provider`], tracking consecutive failures instead of a request
//! window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::types::ModelTier;

/// Consecutive failures before a tier trips open (spec.md §4.6).
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// How long a tripped tier stays open before probing again.
pub const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct TierState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for TierState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Tracks failure streaks per [`ModelTier`] and trips the tier open once a
/// threshold is crossed, so repeated escalation to a dead provider doesn't
/// keep paying the full request timeout.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    state: Mutex<HashMap<ModelTier, TierState>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_duration,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call for `tier` should be attempted right now. A half-open
    /// tier is allowed exactly one probing call; [`record_failure`] or
    /// [`record_success`] resolves it.
    pub async fn allow(&self, tier: ModelTier) -> bool {
        let mut guard = self.state.lock().await;
        let entry = guard.entry(tier).or_default();
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_duration {
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, tier: ModelTier) {
        let mut guard = self.state.lock().await;
        let entry = guard.entry(tier).or_default();
        entry.consecutive_failures = 0;
        entry.state = CircuitState::Closed;
        entry.opened_at = None;
    }

    pub async fn record_failure(&self, tier: ModelTier) {
        let mut guard = self.state.lock().await;
        let entry = guard.entry(tier).or_default();
        entry.consecutive_failures += 1;
        if entry.state == CircuitState::HalfOpen || entry.consecutive_failures >= self.failure_threshold {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    pub async fn state_of(&self, tier: ModelTier) -> CircuitState {
        let guard = self.state.lock().await;
        guard.get(&tier).map(|s| s.state).unwrap_or(CircuitState::Closed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_DURATION)
    }
}

/// Classifies an LLM error as tripping the breaker, reusing
/// [`super::batch`]'s retryability rules (permanent request-shape errors
/// don't count toward the failure streak; transport/provider errors do).
pub fn counts_as_failure(error: &crate::error::Error) -> bool {
    super::batch::is_retryable_error(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trips_open_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            breaker.record_failure(ModelTier::Balanced).await;
        }
        assert_eq!(breaker.state_of(ModelTier::Balanced).await, CircuitState::Open);
        assert!(!breaker.allow(ModelTier::Balanced).await);
    }

    #[tokio::test]
    async fn half_open_after_cooldown_allows_one_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure(ModelTier::Fast).await;
        assert!(!breaker.allow(ModelTier::Fast).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow(ModelTier::Fast).await);
        assert_eq!(breaker.state_of(ModelTier::Fast).await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure(ModelTier::Strong).await;
        breaker.record_failure(ModelTier::Strong).await;
        breaker.record_success(ModelTier::Strong).await;
        breaker.record_failure(ModelTier::Strong).await;
        assert_eq!(breaker.state_of(ModelTier::Strong).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn tiers_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure(ModelTier::Fast).await;
        assert_eq!(breaker.state_of(ModelTier::Fast).await, CircuitState::Open);
        assert_eq!(breaker.state_of(ModelTier::Balanced).await, CircuitState::Closed);
    }
}
