//! Transfer Bandwidth Throttling
//!
//! Caps the rate at which stream bytes are handed to the receiver so a
//! replication run does not saturate the link to the backup host.

use std::time::Duration;

use tokio::time::Instant;

/// Bandwidth limit configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Maximum bytes per second (0 = unlimited).
    pub max_bytes_per_sec: u64,
    /// Burst allowance: multiplier on max rate for short bursts (e.g., 2.0 = 2x burst).
    pub burst_factor: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_sec: 0,
            burst_factor: 1.5,
        }
    }
}

/// Token bucket state for the byte budget.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: f64,
    refill_rate: f64,
    last_refill_us: u64,
}

impl TokenBucket {
    /// Create a new, full token bucket with the given capacity and refill rate (tokens/sec).
    pub fn new(capacity: u64, rate_per_sec: f64, now_us: u64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: rate_per_sec / 1_000_000.0,
            last_refill_us: now_us,
        }
    }

    /// Try to consume `amount` tokens. Returns true if successful, false if insufficient.
    /// Refills first based on elapsed time.
    pub fn try_consume(&mut self, amount: u64, now_us: u64) -> bool {
        self.refill(now_us);

        let amount_f = amount as f64;
        if self.tokens >= amount_f {
            self.tokens -= amount_f;
            true
        } else {
            false
        }
    }

    /// Microseconds until `amount` tokens are available.
    pub fn wait_us(&mut self, amount: u64, now_us: u64) -> u64 {
        self.refill(now_us);
        let missing = amount as f64 - self.tokens;
        if missing <= 0.0 || self.refill_rate <= 0.0 {
            return 0;
        }
        (missing / self.refill_rate).ceil() as u64
    }

    /// Bucket capacity in tokens.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Refill tokens based on elapsed time since last refill.
    pub fn refill(&mut self, now_us: u64) {
        let elapsed_us = now_us.saturating_sub(self.last_refill_us);
        if elapsed_us > 0 {
            let tokens_to_add = elapsed_us as f64 * self.refill_rate;
            self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
            self.last_refill_us = now_us;
        }
    }
}

/// Async byte-rate limiter for the buffer stage of the transfer pipeline.
#[derive(Debug)]
pub struct RateLimiter {
    epoch: Instant,
    bucket: Option<TokenBucket>,
    stalls: u64,
}

impl RateLimiter {
    /// Limiter for `config`; a zero rate never waits.
    pub fn new(config: &ThrottleConfig) -> Self {
        let bucket = (config.max_bytes_per_sec > 0).then(|| {
            let capacity = (config.max_bytes_per_sec as f64 * config.burst_factor)
                .max(config.max_bytes_per_sec as f64) as u64;
            TokenBucket::new(capacity, config.max_bytes_per_sec as f64, 0)
        });
        Self {
            epoch: Instant::now(),
            bucket,
            stalls: 0,
        }
    }

    /// Whether a limit is configured.
    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Number of times `acquire` had to sleep.
    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Wait until `bytes` may be sent. Amounts above the bucket capacity
    /// are taken in capacity-sized pieces.
    pub async fn acquire(&mut self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let now = self.now_us();
            let Some(bucket) = self.bucket.as_mut() else {
                return;
            };
            let piece = remaining.min(bucket.capacity());
            if bucket.try_consume(piece, now) {
                remaining -= piece;
                continue;
            }
            let wait = bucket.wait_us(piece, now).max(1);
            self.stalls += 1;
            tokio::time::sleep(Duration::from_micros(wait)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod token_bucket {
        use super::*;

        #[test]
        fn test_new_is_full() {
            let mut bucket = TokenBucket::new(1000, 100.0, 0);
            assert_eq!(bucket.capacity(), 1000);
            assert!(bucket.try_consume(1000, 0));
        }

        #[test]
        fn test_try_consume_fails_not_enough() {
            let mut bucket = TokenBucket::new(100, 1000.0, 0);
            assert!(bucket.try_consume(50, 0));
            assert!(!bucket.try_consume(60, 0));
        }

        #[test]
        fn test_refill_over_time() {
            let mut bucket = TokenBucket::new(100, 1_000_000.0, 0);
            assert!(bucket.try_consume(100, 0));
            assert!(!bucket.try_consume(1, 0));
            assert!(bucket.try_consume(50, 50));
        }

        #[test]
        fn test_refill_capped_at_capacity() {
            let mut bucket = TokenBucket::new(100, 1_000_000.0, 0);
            bucket.refill(10_000_000);
            assert!(!bucket.try_consume(101, 10_000_000));
            assert!(bucket.try_consume(100, 10_000_000));
        }

        #[test]
        fn test_wait_us() {
            let mut bucket = TokenBucket::new(1000, 1_000_000.0, 0);
            assert!(bucket.try_consume(1000, 0));
            assert_eq!(bucket.wait_us(500, 0), 500);
            assert_eq!(bucket.wait_us(500, 500), 0);
        }
    }

    mod rate_limiter {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_unlimited_never_waits() {
            let mut limiter = RateLimiter::new(&ThrottleConfig::default());
            assert!(!limiter.is_limited());
            let start = Instant::now();
            limiter.acquire(10 * 1024 * 1024).await;
            assert_eq!(start.elapsed(), Duration::ZERO);
            assert_eq!(limiter.stalls(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_limit_paces_transfer() {
            let config = ThrottleConfig {
                max_bytes_per_sec: 1000,
                burst_factor: 1.0,
            };
            let mut limiter = RateLimiter::new(&config);
            let start = Instant::now();
            // The first second is covered by the initial bucket, two more must be waited for.
            for _ in 0..3 {
                limiter.acquire(1000).await;
            }
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(1990), "elapsed {:?}", elapsed);
            assert!(elapsed <= Duration::from_millis(2100), "elapsed {:?}", elapsed);
            assert!(limiter.stalls() >= 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_oversized_request_is_split() {
            let config = ThrottleConfig {
                max_bytes_per_sec: 100,
                burst_factor: 1.0,
            };
            let mut limiter = RateLimiter::new(&config);
            let start = Instant::now();
            limiter.acquire(300).await;
            assert!(start.elapsed() >= Duration::from_millis(1990));
        }
    }
}
