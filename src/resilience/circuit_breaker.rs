//! Per-source circuit breaker
//!
//! Stops sending requests to a consistently failing upstream for a cooldown
//! period, then admits a single probe to decide whether to resume.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failure threshold exceeded - requests fail fast
    Open,
    /// Recovery window elapsed - a single probe decides the outcome
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// State transitions surfaced to the owner so it can emit observability events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
    HalfOpened,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Cooldown before a probe is admitted
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    total_requests: u64,
    successes: u64,
    failures: u64,
    trips: u64,
}

/// Read-only view for health/metrics surfaces
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub trips: u64,
}

/// Circuit breaker guarding one named dependency.
///
/// All transitions happen under one mutex; the read-modify-write sequences
/// (admit + promote, record + trip) are atomic under parallel callers.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                next_attempt_at: None,
                probe_in_flight: false,
                total_requests: 0,
                successes: 0,
                failures: 0,
                trips: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit or reject a request.
    ///
    /// Open rejects until the recovery deadline; at or past the deadline the
    /// breaker self-promotes to half-open and admits exactly one probe.
    /// Further requests are rejected until that probe's outcome is recorded.
    pub fn try_acquire(&self) -> Result<Option<CircuitTransition>> {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let now = Utc::now();
                let ready = inner.next_attempt_at.map(|t| now >= t).unwrap_or(true);
                if ready {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit breaker half-open, admitting probe");
                    Ok(Some(CircuitTransition::HalfOpened))
                } else {
                    debug!(breaker = %self.name, "circuit breaker open, failing fast");
                    Err(FeedError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(FeedError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(None)
                }
            }
        }
    }

    /// Record a successful outcome. Resets the failure streak and closes the
    /// circuit if the probe succeeded.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.successes += 1;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.next_attempt_at = None;
            info!(breaker = %self.name, "circuit breaker closed");
            Some(CircuitTransition::Closed)
        } else {
            None
        }
    }

    /// Record a failed outcome. Trips the circuit at the threshold; any
    /// half-open failure re-opens immediately with a fresh cooldown.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.next_attempt_at = Some(
                Utc::now()
                    + ChronoDuration::from_std(self.config.recovery_timeout)
                        .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            );
            inner.trips += 1;
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
            Some(CircuitTransition::Opened)
        } else {
            None
        }
    }

    /// Abandon an admitted probe without recording an outcome.
    ///
    /// Used when a request is stopped by local policy after the probe slot
    /// was claimed (the attempt never reached the upstream, so neither
    /// success nor failure applies). The breaker returns to Open with its
    /// existing deadline so the next caller can probe immediately.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Open;
            debug!(breaker = %self.name, "probe released without outcome");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker lock poisoned").state
    }

    /// Manual reset back to closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.next_attempt_at = None;
        inner.probe_in_flight = false;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock().expect("circuit breaker lock poisoned");
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt_at,
            total_requests: inner.total_requests,
            successes: inner.successes,
            failures: inner.failures,
            trips: inner.trips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
        )
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));

        assert!(cb.record_failure().is_none());
        assert!(cb.record_failure().is_none());
        assert_eq!(cb.state(), CircuitState::Closed);

        assert_eq!(cb.record_failure(), Some(CircuitTransition::Opened));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Err(FeedError::CircuitOpen(_))));
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn admits_exactly_one_probe_after_recovery() {
        let cb = breaker(1, Duration::from_millis(0));

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Deadline already elapsed: first acquire self-promotes and admits.
        assert_eq!(
            cb.try_acquire().unwrap(),
            Some(CircuitTransition::HalfOpened)
        );
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Second acquire while the probe is outstanding is rejected.
        assert!(matches!(cb.try_acquire(), Err(FeedError::CircuitOpen(_))));

        // Probe outcome alone decides the next state.
        assert_eq!(cb.record_success(), Some(CircuitTransition::Closed));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_deadline() {
        let cb = breaker(1, Duration::from_millis(0));

        cb.record_failure();
        cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(cb.record_failure(), Some(CircuitTransition::Opened));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.snapshot().next_attempt_at.is_some());
    }

    #[test]
    fn open_rejects_before_recovery_deadline() {
        let cb = breaker(1, Duration::from_secs(3600));

        cb.record_failure();
        assert!(matches!(cb.try_acquire(), Err(FeedError::CircuitOpen(_))));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn released_probe_frees_the_slot_for_the_next_caller() {
        let cb = breaker(1, Duration::from_millis(0));

        cb.record_failure();
        assert_eq!(
            cb.try_acquire().unwrap(),
            Some(CircuitTransition::HalfOpened)
        );

        // The probe never ran (stopped by local policy); releasing it must
        // not strand the breaker in half-open.
        cb.release_probe();
        assert_eq!(cb.state(), CircuitState::Open);

        // Deadline already elapsed, so the next caller gets the probe.
        assert_eq!(
            cb.try_acquire().unwrap(),
            Some(CircuitTransition::HalfOpened)
        );
        assert_eq!(cb.record_success(), Some(CircuitTransition::Closed));
    }

    #[test]
    fn release_probe_is_a_noop_when_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.release_probe();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn reset_returns_to_closed() {
        let cb = breaker(1, Duration::from_secs(3600));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }
}
