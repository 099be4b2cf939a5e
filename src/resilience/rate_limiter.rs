//! Dual-window rate limiter
//!
//! Admits a request only when both the 1-second and the 60-second rolling
//! counters are below their ceilings. The check and the increments happen
//! under a single lock acquisition, so there is no check-then-increment race
//! under parallel callers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{FeedError, Result};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Ceiling for the 1-second window
    pub requests_per_second: u32,
    /// Ceiling for the 60-second window
    pub requests_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            requests_per_minute: 100,
        }
    }
}

#[derive(Debug)]
struct Windows {
    second_count: u32,
    minute_count: u32,
    second_reset: DateTime<Utc>,
    minute_reset: DateTime<Utc>,
    total_admitted: u64,
    throttled: u64,
}

/// Read-only view for health/metrics surfaces
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub name: String,
    pub second_count: u32,
    pub minute_count: u32,
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub total_admitted: u64,
    pub throttled: u64,
    /// Utilization of the busier window, 0.0 - 1.0
    pub utilization: f64,
}

pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            config,
            windows: Mutex::new(Windows {
                second_count: 0,
                minute_count: 0,
                second_reset: now + ChronoDuration::seconds(1),
                minute_reset: now + ChronoDuration::seconds(60),
                total_admitted: 0,
                throttled: 0,
            }),
        }
    }

    /// Admit and count, or reject. A rejection is a local policy decision and
    /// must not feed circuit-breaker bookkeeping.
    pub fn try_acquire(&self) -> Result<()> {
        let mut w = self.windows.lock().expect("rate limiter lock poisoned");
        let now = Utc::now();

        if now >= w.second_reset {
            w.second_count = 0;
            w.second_reset = now + ChronoDuration::seconds(1);
        }
        if now >= w.minute_reset {
            w.minute_count = 0;
            w.minute_reset = now + ChronoDuration::seconds(60);
        }

        if w.second_count >= self.config.requests_per_second
            || w.minute_count >= self.config.requests_per_minute
        {
            w.throttled += 1;
            debug!(limiter = %self.name, "request throttled by local rate limiter");
            return Err(FeedError::RateLimited(self.name.clone()));
        }

        w.second_count += 1;
        w.minute_count += 1;
        w.total_admitted += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let w = self.windows.lock().expect("rate limiter lock poisoned");
        let second_util = w.second_count as f64 / self.config.requests_per_second.max(1) as f64;
        let minute_util = w.minute_count as f64 / self.config.requests_per_minute.max(1) as f64;
        RateLimiterSnapshot {
            name: self.name.clone(),
            second_count: w.second_count,
            minute_count: w.minute_count,
            requests_per_second: self.config.requests_per_second,
            requests_per_minute: self.config.requests_per_minute,
            total_admitted: w.total_admitted,
            throttled: w.throttled,
            utilization: second_util.max(minute_util),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_exactly_the_per_second_ceiling() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig {
                requests_per_second: 5,
                requests_per_minute: 1000,
            },
        );

        for i in 0..5 {
            assert!(limiter.try_acquire().is_ok(), "admission {i} should pass");
        }
        assert!(matches!(
            limiter.try_acquire(),
            Err(FeedError::RateLimited(_))
        ));
    }

    #[test]
    fn minute_ceiling_rejects_even_with_second_headroom() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig {
                requests_per_second: 100,
                requests_per_minute: 3,
            },
        );

        for _ in 0..3 {
            limiter.try_acquire().unwrap();
        }
        assert!(limiter.try_acquire().is_err());

        let snap = limiter.snapshot();
        assert_eq!(snap.total_admitted, 3);
        assert_eq!(snap.throttled, 1);
        assert!(snap.utilization >= 1.0);
    }

    #[test]
    fn second_window_rolls_over() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig {
                requests_per_second: 1,
                requests_per_minute: 1000,
            },
        );

        limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_err());

        // Force the window deadline into the past.
        {
            let mut w = limiter.windows.lock().unwrap();
            w.second_reset = Utc::now() - ChronoDuration::seconds(1);
        }
        assert!(limiter.try_acquire().is_ok());
    }
}
