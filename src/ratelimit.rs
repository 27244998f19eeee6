//! Keyed token-bucket rate limiting
//!
//! One bucket per key (source IP for the auth endpoint, client ID for
//! payment creation). Buckets refill continuously at the configured
//! per-minute rate and hold at most one minute's worth of tokens.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

/// A single token bucket
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn check_and_consume(&mut self, capacity: u32, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter holding one bucket per key
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    per_minute: u32,
}

impl RateLimiter {
    /// Create a limiter allowing `per_minute` requests per key per minute
    pub fn new(per_minute: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            per_minute,
        }
    }

    /// Check whether a request for `key` is allowed, consuming a token
    pub async fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.per_minute));
        bucket.check_and_consume(self.per_minute, self.per_minute as f64 / 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_burst_then_reject() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.check("10.0.0.1").await);
        }
        assert!(!limiter.check("10.0.0.1").await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("a").await);
        assert!(!limiter.check("a").await);
        assert!(limiter.check("b").await);
    }

    #[tokio::test]
    async fn test_refill() {
        let limiter = RateLimiter::new(60); // one token per second
        for _ in 0..60 {
            assert!(limiter.check("k").await);
        }
        assert!(!limiter.check("k").await);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.check("k").await);
        assert!(!limiter.check("k").await);
    }
}
