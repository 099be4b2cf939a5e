//! Resilience wrapper owned by each source client.
//!
//! Wraps one network-facing upstream with a circuit breaker, a dual-window
//! rate limiter, and retry-with-backoff, and publishes typed observability
//! events on a bounded broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{FeedError, Result};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, CircuitTransition,
    RateLimiter, RateLimiterConfig, RateLimiterSnapshot, RetryPolicy,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MAX_LATENCY_SAMPLES: usize = 100;

/// Observability events emitted around breaker transitions and retries.
/// Consumers (the metrics task, tests) subscribe; a lagging consumer drops
/// events rather than blocking the request path.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    CircuitOpened {
        source: String,
        consecutive_failures: u32,
    },
    CircuitClosed {
        source: String,
    },
    CircuitHalfOpen {
        source: String,
    },
    RetryScheduled {
        source: String,
        operation: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    RequestFailed {
        source: String,
        operation: String,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct ResilientSourceConfig {
    /// Per-attempt timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ResilientSourceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            rate_limit: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Default)]
struct SourceMetrics {
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rate_limit_hits: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
}

/// Read-only per-source counters for the health surface
#[derive(Debug, Clone, Serialize)]
pub struct SourceMetricsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limit_hits: u64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Aggregated health view of one source
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub name: String,
    pub healthy: bool,
    pub issues: Vec<String>,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
    pub metrics: SourceMetricsSnapshot,
}

pub struct ResilientSource {
    name: String,
    config: ResilientSourceConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    metrics: SourceMetrics,
    last_request_at: Mutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<SourceEvent>,
}

impl ResilientSource {
    pub fn new(name: impl Into<String>, config: ResilientSourceConfig) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            breaker: CircuitBreaker::new(name.clone(), config.circuit_breaker.clone()),
            limiter: RateLimiter::new(name.clone(), config.rate_limit.clone()),
            metrics: SourceMetrics::default(),
            last_request_at: Mutex::new(None),
            events,
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    /// Run one logical request with all protections.
    ///
    /// Order matters: breaker first (fail fast, no network), then the rate
    /// limiter (a local decision that never counts as upstream failure), then
    /// the timed attempt loop. Breaker bookkeeping sees one outcome per
    /// `execute` call, after retries are exhausted.
    pub async fn execute<T, F, Fut>(&self, operation: &str, attempt_fn: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(CircuitTransition::HalfOpened) = self.breaker.try_acquire()? {
            self.emit(SourceEvent::CircuitHalfOpen {
                source: self.name.clone(),
            });
        }

        if let Err(err) = self.limiter.try_acquire() {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            // Not recorded against the breaker: local throttling is not
            // evidence of upstream unhealthiness. If this call claimed the
            // half-open probe slot, hand it back so the next caller can
            // probe instead of being locked out.
            self.breaker.release_probe();
            return Err(err);
        }

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        *self
            .last_request_at
            .lock()
            .expect("last_request lock poisoned") = Some(Utc::now());

        let started = Instant::now();
        let outcome = self.attempt_loop(operation, attempt_fn).await;
        self.record_latency(started.elapsed());

        match outcome {
            Ok(value) => {
                self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                if let Some(CircuitTransition::Closed) = self.breaker.record_success() {
                    self.emit(SourceEvent::CircuitClosed {
                        source: self.name.clone(),
                    });
                }
                Ok(value)
            }
            Err(err) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                if let Some(CircuitTransition::Opened) = self.breaker.record_failure() {
                    let snapshot = self.breaker.snapshot();
                    self.emit(SourceEvent::CircuitOpened {
                        source: self.name.clone(),
                        consecutive_failures: snapshot.consecutive_failures,
                    });
                }
                self.emit(SourceEvent::RequestFailed {
                    source: self.name.clone(),
                    operation: operation.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn attempt_loop<T, F, Fut>(&self, operation: &str, attempt_fn: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.retry.attempts + 1;
        let mut last_error: Option<FeedError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.config.retry.jittered_delay_for(attempt - 1);
                let error = last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                debug!(
                    source = %self.name,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                self.emit(SourceEvent::RetryScheduled {
                    source: self.name.clone(),
                    operation: operation.to_string(),
                    attempt,
                    delay,
                    error,
                });
                tokio::time::sleep(delay).await;
            }

            let attempt_started = Instant::now();
            let result = tokio::time::timeout(self.config.timeout, attempt_fn()).await;
            match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    let retryable = err.is_retryable();
                    warn!(
                        source = %self.name,
                        operation,
                        attempt,
                        error = %err,
                        "attempt failed"
                    );
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
                Err(_) => {
                    last_error = Some(FeedError::Timeout {
                        operation: operation.to_string(),
                        elapsed_ms: attempt_started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FeedError::Internal(format!("no attempts executed for {operation}"))
        }))
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut latencies = self
            .metrics
            .latencies_ms
            .lock()
            .expect("latency lock poisoned");
        latencies.push_back(elapsed.as_millis() as u64);
        if latencies.len() > MAX_LATENCY_SAMPLES {
            latencies.pop_front();
        }
    }

    fn emit(&self, event: SourceEvent) {
        // Receiver-less channels are fine; events are advisory.
        let _ = self.events.send(event);
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    pub fn metrics_snapshot(&self) -> SourceMetricsSnapshot {
        let total = self.metrics.total_requests.load(Ordering::Relaxed);
        let failures = self.metrics.failures.load(Ordering::Relaxed);
        let latencies = self
            .metrics
            .latencies_ms
            .lock()
            .expect("latency lock poisoned");
        let average_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        SourceMetricsSnapshot {
            total_requests: total,
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures,
            rate_limit_hits: self.metrics.rate_limit_hits.load(Ordering::Relaxed),
            average_latency_ms,
            error_rate: if total > 0 {
                failures as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            last_request_at: *self
                .last_request_at
                .lock()
                .expect("last_request lock poisoned"),
        }
    }

    pub fn health(&self) -> SourceHealth {
        let metrics = self.metrics_snapshot();
        let circuit_breaker = self.breaker.snapshot();
        let mut issues = Vec::new();

        if circuit_breaker.state == CircuitState::Open {
            issues.push("circuit breaker is open".to_string());
        }
        if metrics.total_requests >= 10 && metrics.error_rate > 50.0 {
            issues.push("high error rate".to_string());
        }
        if metrics.average_latency_ms > 5000.0 {
            issues.push("high response times".to_string());
        }

        SourceHealth {
            name: self.name.clone(),
            healthy: issues.is_empty(),
            issues,
            circuit_breaker,
            rate_limiter: self.limiter.snapshot(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn fast_config(retries: u32, threshold: u32) -> ResilientSourceConfig {
        ResilientSourceConfig {
            timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                attempts: retries,
                base_delay: Duration::from_millis(1),
                strategy: crate::resilience::BackoffStrategy::Fixed,
                max_delay: Duration::from_millis(5),
            },
            rate_limit: RateLimiterConfig {
                requests_per_second: 1000,
                requests_per_minute: 10_000,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
            },
        }
    }

    fn upstream_err(status: u16) -> FeedError {
        FeedError::Upstream {
            source_name: "test".to_string(),
            status,
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn success_passes_value_through() {
        let source = ResilientSource::new("test", fast_config(2, 5));
        let out: i32 = source.execute("op", || async { Ok(42) }).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(source.metrics_snapshot().successes, 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let source = ResilientSource::new("test", fast_config(3, 5));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let out = source
            .execute("op", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(upstream_err(503))
                    } else {
                        Ok("fresh")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The execute call counts one success despite internal retries.
        assert_eq!(source.metrics_snapshot().successes, 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit() {
        let source = ResilientSource::new("test", fast_config(5, 10));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<()> = source
            .execute("op", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(upstream_err(401))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "401 must not be retried");
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_executes() {
        let source = ResilientSource::new("test", fast_config(0, 3));
        for _ in 0..3 {
            let _: Result<()> = source.execute("op", || async { Err(upstream_err(500)) }).await;
        }
        assert_eq!(source.circuit_state(), CircuitState::Open);

        // Next call fails fast without touching the closure.
        let touched = Arc::new(AtomicU32::new(0));
        let touched_clone = Arc::clone(&touched);
        let result: Result<()> = source
            .execute("op", move || {
                let touched = Arc::clone(&touched_clone);
                async move {
                    touched.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(FeedError::CircuitOpen(_))));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limit_rejection_does_not_count_toward_breaker() {
        let mut config = fast_config(0, 2);
        config.rate_limit = RateLimiterConfig {
            requests_per_second: 1,
            requests_per_minute: 1,
        };
        let source = ResilientSource::new("test", config);

        let _: Result<i32> = source.execute("op", || async { Ok(1) }).await;
        for _ in 0..5 {
            let result: Result<i32> = source.execute("op", || async { Ok(1) }).await;
            assert!(matches!(result, Err(FeedError::RateLimited(_))));
        }
        // Plenty of rejections, breaker still closed.
        assert_eq!(source.circuit_state(), CircuitState::Closed);
        assert_eq!(source.metrics_snapshot().rate_limit_hits, 5);
    }

    #[tokio::test]
    async fn rate_limited_probe_does_not_strand_the_breaker() {
        let mut config = fast_config(0, 1);
        config.circuit_breaker.recovery_timeout = Duration::from_millis(0);
        config.rate_limit = RateLimiterConfig {
            requests_per_second: 1,
            requests_per_minute: 1000,
        };
        let source = ResilientSource::new("test", config);

        // Trip the breaker; this call also spends the per-second budget.
        let _: Result<()> = source.execute("op", || async { Err(upstream_err(500)) }).await;
        assert_eq!(source.circuit_state(), CircuitState::Open);

        // Recovery deadline already elapsed, so this call claims the probe
        // slot, then the limiter stops it before the upstream.
        let result: Result<i32> = source.execute("op", || async { Ok(1) }).await;
        assert!(matches!(result, Err(FeedError::RateLimited(_))));

        // The abandoned probe must not lock the source out; once the limiter
        // window rolls over, a healthy upstream closes the circuit again.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let out: i32 = source.execute("op", || async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
        assert_eq!(source.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn emits_circuit_events() {
        let source = ResilientSource::new("test", fast_config(0, 1));
        let mut events = source.subscribe_events();

        let _: Result<()> = source.execute("op", || async { Err(upstream_err(500)) }).await;

        let mut saw_opened = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SourceEvent::CircuitOpened { .. }) {
                saw_opened = true;
            }
        }
        assert!(saw_opened);
    }
}
