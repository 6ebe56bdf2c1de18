//! Token-bucket byte-rate limiting for reads and writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled: Instant,
}

/// A token bucket over bytes per second. A rate of zero disables limiting.
/// The rate is retunable at runtime; waiters pick up the new rate on their
/// next refill.
#[derive(Debug)]
pub struct RateLimiter {
    rate: AtomicU64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Limiter capped at `rate` bytes/sec, with a one-second burst.
    pub fn new(rate: u64) -> Self {
        RateLimiter {
            rate: AtomicU64::new(rate),
            state: Mutex::new(BucketState {
                tokens: rate as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// Current rate, zero meaning unlimited.
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Retune the cap.
    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
    }

    /// Take `bytes` tokens, sleeping until the bucket refills far enough.
    pub async fn acquire(&self, bytes: usize) {
        loop {
            let rate = self.rate.load(Ordering::Relaxed);
            if rate == 0 {
                return;
            }
            let wait = {
                let mut state = self.state.lock();
                let elapsed = state.refilled.elapsed().as_secs_f64();
                state.refilled = Instant::now();
                state.tokens = (state.tokens + elapsed * rate as f64).min(rate as f64);
                if state.tokens >= bytes as f64 {
                    state.tokens -= bytes as f64;
                    return;
                }
                let deficit = bytes as f64 - state.tokens;
                Duration::from_secs_f64(deficit / rate as f64)
            };
            // Cap the sleep so oversized requests still make progress and
            // rate changes are picked up.
            tokio::time::sleep(wait.min(Duration::from_millis(500))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::new(0);
        let before = Instant::now();
        limiter.acquire(usize::MAX / 2).await;
        assert!(before.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn limits_throughput() {
        let limiter = RateLimiter::new(10_000);
        limiter.acquire(10_000).await;
        let before = Instant::now();
        limiter.acquire(5_000).await;
        let waited = before.elapsed();
        assert!(
            waited >= Duration::from_millis(300),
            "refill arrived too early: {waited:?}"
        );
    }

    #[tokio::test]
    async fn raising_the_rate_unblocks() {
        let limiter = RateLimiter::new(1_000);
        limiter.acquire(1_000).await;
        limiter.set_rate(0);
        let before = Instant::now();
        limiter.acquire(1 << 30).await;
        assert!(before.elapsed() < Duration::from_secs(1));
    }
}
