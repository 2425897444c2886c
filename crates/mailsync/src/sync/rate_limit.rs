//! Token bucket shared by fetch workers

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use super::retry::Sleeper;
use crate::error::SyncResult;

#[derive(Debug)]
struct Bucket {
    /// May go negative: outstanding reservations
    tokens: f64,
    last_refill: Instant,
}

/// Request-rate limiter sized from a transport's rate hint
#[derive(Debug)]
pub struct RateLimiter {
    per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Allow `per_second` requests with bursts of up to one second's worth
    pub fn new(per_second: f64) -> Self {
        let per_second = if per_second.is_finite() && per_second > 0.0 {
            per_second
        } else {
            1.0
        };
        let burst = per_second.max(1.0);
        Self {
            per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, returning how long the caller must wait before using it
    pub fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
        bucket.last_refill = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.per_second).unwrap_or(Duration::ZERO)
        }
    }

    /// Wait until a request may be sent
    pub fn acquire(&self, sleeper: &dyn Sleeper, cancel: &CancelToken) -> SyncResult<()> {
        cancel.check()?;
        let wait = self.reserve();
        if !wait.is_zero() {
            sleeper.sleep(wait, cancel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::retry::RecordingSleeper;

    #[test]
    fn test_burst_then_wait() {
        let limiter = RateLimiter::new(10.0);
        for _ in 0..10 {
            assert_eq!(limiter.reserve(), Duration::ZERO);
        }
        let wait = limiter.reserve();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(100));

        // Reservations queue up behind each other
        let next = limiter.reserve();
        assert!(next > wait);
    }

    #[test]
    fn test_acquire_sleeps_for_reservation() {
        let limiter = RateLimiter::new(1.0);
        let sleeper = RecordingSleeper::new();
        let cancel = CancelToken::new();

        limiter.acquire(&sleeper, &cancel).unwrap();
        assert!(sleeper.slept().is_empty());

        limiter.acquire(&sleeper, &cancel).unwrap();
        assert_eq!(sleeper.slept().len(), 1);
    }

    #[test]
    fn test_invalid_rate_falls_back() {
        let limiter = RateLimiter::new(0.0);
        assert_eq!(limiter.reserve(), Duration::ZERO);
    }
}
