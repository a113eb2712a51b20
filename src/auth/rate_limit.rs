//! Per-key sliding-window rate limiting.
//!
//! Each key holds the timestamps of its admitted requests within the trailing
//! window. Admission drops expired timestamps, compares the remainder against
//! the key's limit, and appends on success. A background sweeper removes
//! buckets that have gone empty. Single-process; no cross-instance
//! coordination.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::constants::{RATE_GC_INTERVAL_SECS, RATE_WINDOW_SECS};
use crate::error::GatewayError;

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a request for `key_id`. `None` means unlimited.
    pub fn check(&self, key_id: &str, limit: Option<u32>) -> Result<(), GatewayError> {
        let Some(limit) = limit else {
            return Ok(());
        };

        let now = Instant::now();
        let window = Duration::from_secs(RATE_WINDOW_SECS);

        let mut buckets = self.buckets.lock().expect("rate bucket lock poisoned");
        let bucket = buckets.entry(key_id.to_string()).or_default();
        bucket.retain(|t| now.duration_since(*t) < window);

        if bucket.len() >= limit as usize {
            return Err(GatewayError::RateLimitExceeded(format!(
                "Rate limit of {limit} requests per minute exceeded"
            )));
        }

        bucket.push(now);
        Ok(())
    }

    /// Drop buckets whose every timestamp has aged out.
    pub fn sweep(&self) {
        let now = Instant::now();
        let window = Duration::from_secs(RATE_WINDOW_SECS);
        let mut buckets = self.buckets.lock().expect("rate bucket lock poisoned");
        buckets.retain(|_, bucket| {
            bucket.retain(|t| now.duration_since(*t) < window);
            !bucket.is_empty()
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("rate bucket lock poisoned").len()
    }
}

/// Periodic GC task. Detached for the process lifetime.
pub fn spawn_gc(limiter: std::sync::Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(RATE_GC_INTERVAL_SECS));
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            limiter.sweep();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit_and_rejects_next() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("k1", Some(3)).is_ok());
        }
        let err = limiter.check("k1", Some(3)).unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitExceeded(_)));
    }

    #[test]
    fn test_unlimited_key_never_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.check("k1", None).is_ok());
        }
        // Unlimited keys never allocate a bucket
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_buckets_are_per_key() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("a", Some(1)).is_ok());
        assert!(limiter.check("b", Some(1)).is_ok());
        assert!(limiter.check("a", Some(1)).is_err());
        assert!(limiter.check("b", Some(1)).is_err());
    }

    #[test]
    fn test_sweep_removes_empty_buckets_only() {
        let limiter = RateLimiter::new();
        limiter.check("live", Some(5)).unwrap();
        {
            let mut buckets = limiter.buckets.lock().unwrap();
            buckets.insert(
                "dead".into(),
                vec![Instant::now() - Duration::from_secs(RATE_WINDOW_SECS + 5)],
            );
        }
        assert_eq!(limiter.bucket_count(), 2);
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
