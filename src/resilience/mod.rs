//! Resilience primitives shared by source clients and the fallback chain:
//! circuit breaking, dual-window rate limiting, and retry backoff policies.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, CircuitTransition,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
pub use retry::{BackoffStrategy, RetryPolicy};
