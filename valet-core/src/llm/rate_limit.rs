//! Token-bucket rate limiting per [`ModelTier`].
//!
//! [`super::batch::ProviderRateLimiter`] uses a fixed window, which is fine
//! for batch fan-out but bursts awkwardly at window boundaries. Stage
//! escalation instead uses a token bucket, refilled continuously, so a quiet
//! period lets a few calls burst through rather than saturating instantly at
//! the top of every window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

use super::types::ModelTier;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-tier token bucket: `capacity` tokens, refilled at `refill_per_second`.
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_per_second: f64,
    buckets: Mutex<HashMap<ModelTier, Bucket>>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_second: refill_per_second.max(0.01),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refill(bucket: &mut Bucket, capacity: f64, refill_per_second: f64) {
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
        bucket.last_refill = Instant::now();
    }

    /// Blocks until a single token for `tier` is available, then consumes it.
    pub async fn acquire(&self, tier: ModelTier) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(tier).or_insert(Bucket {
                    tokens: self.capacity,
                    last_refill: Instant::now(),
                });
                Self::refill(bucket, self.capacity, self.refill_per_second);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_second))
                }
            };
            match wait {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }

    /// Non-blocking variant: returns `true` and consumes a token if one was
    /// available, `false` otherwise.
    pub async fn try_acquire(&self, tier: ModelTier) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(tier).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: Instant::now(),
        });
        Self::refill(bucket, self.capacity, self.refill_per_second);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(10.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumes_tokens_up_to_capacity() {
        let limiter = TokenBucketLimiter::new(2.0, 0.001);
        assert!(limiter.try_acquire(ModelTier::Fast).await);
        assert!(limiter.try_acquire(ModelTier::Fast).await);
        assert!(!limiter.try_acquire(ModelTier::Fast).await);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let limiter = TokenBucketLimiter::new(1.0, 100.0);
        assert!(limiter.try_acquire(ModelTier::Balanced).await);
        assert!(!limiter.try_acquire(ModelTier::Balanced).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.try_acquire(ModelTier::Balanced).await);
    }

    #[tokio::test]
    async fn tiers_have_independent_buckets() {
        let limiter = TokenBucketLimiter::new(1.0, 0.001);
        assert!(limiter.try_acquire(ModelTier::Fast).await);
        assert!(limiter.try_acquire(ModelTier::Strong).await);
    }

    #[tokio::test]
    async fn acquire_blocks_until_token_available() {
        let limiter = TokenBucketLimiter::new(1.0, 50.0);
        limiter.try_acquire(ModelTier::Fast).await;
        let started = Instant::now();
        limiter.acquire(ModelTier::Fast).await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
