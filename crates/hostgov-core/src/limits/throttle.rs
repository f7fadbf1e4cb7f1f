//! Token bucket backing the `throttle` action.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{GovernError, Result};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Refills at `rate` tokens per second up to `burst`; starts full.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Rate and burst below one are raised to one.
    pub fn new(rate: f64, burst: u64) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate: rate.max(1.0),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Sized from the value that tripped the limit: `max(current/2, 1)`
    /// tokens per second with a burst of `max(current/4, 1)`.
    pub fn for_breach(current: u64) -> Self {
        Self::new((current / 2).max(1) as f64, (current / 4).max(1))
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u64 {
        self.burst as u64
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// the next one is.
    fn take(&self) -> std::result::Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.take().is_ok()
    }

    /// Waits for a token. Returns [`GovernError::Cancelled`] if `cancel`
    /// fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = match self.take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GovernError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_from_breach() {
        let bucket = TokenBucket::for_breach(150);
        assert_eq!(bucket.rate(), 75.0);
        assert_eq!(bucket.burst(), 37);

        let tiny = TokenBucket::for_breach(0);
        assert_eq!(tiny.rate(), 1.0);
        assert_eq!(tiny.burst(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_empty() {
        let bucket = TokenBucket::new(1.0, 3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_burst() {
        let bucket = TokenBucket::new(10.0, 2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(2.0, 1);
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();

        let started = Instant::now();
        bucket.acquire(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let bucket = TokenBucket::new(1.0, 1);
        let cancel = CancellationToken::new();
        assert!(bucket.try_acquire());

        cancel.cancel();
        let err = bucket.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, GovernError::Cancelled));
    }
}
