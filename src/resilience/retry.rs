//! Retry budgets and backoff delay calculation.

use rand::Rng;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Delay progression between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Fixed,
    Linear,
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

impl FromStr for BackoffStrategy {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            _ => Err("invalid backoff strategy; expected immediate|fixed|linear|exponential"),
        }
    }
}

/// Retry budget for one call site
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = no retries)
    pub attempts: u32,
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Hard cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(1000),
            strategy: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, strategy: BackoffStrategy) -> Self {
        Self {
            attempts,
            base_delay,
            strategy,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        raw.min(self.max_delay)
    }

    /// Delay with up to 20% additive jitter, so parallel callers do not
    /// synchronize their retries against an already struggling upstream.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if base.is_zero() {
            return base;
        }
        let jitter_cap = base.as_millis() as u64 / 5;
        if jitter_cap == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        (base + Duration::from_millis(jitter)).min(self.max_delay)
    }
}
