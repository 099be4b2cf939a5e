use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Process-level metrics collector for observability
pub struct Metrics {
    /// Total read requests served through the facade
    pub requests_served: AtomicU64,
    /// Requests that exhausted every fallback tier
    pub total_failures: AtomicU64,
    /// Change events observed on the sync channel
    pub changes_observed: AtomicU64,
    /// Rebroadcasts observed on the sync channel
    pub rebroadcasts_observed: AtomicU64,
    /// Last update timestamp
    last_update: RwLock<i64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_served: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            changes_observed: AtomicU64::new(0),
            rebroadcasts_observed: AtomicU64::new(0),
            last_update: RwLock::new(Utc::now().timestamp()),
        }
    }

    pub fn inc_requests_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_total_failures(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_change(&self) {
        self.changes_observed.fetch_add(1, Ordering::Relaxed);
        *self.last_update.write().await = Utc::now().timestamp();
    }

    pub fn record_rebroadcast(&self) {
        self.rebroadcasts_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn last_update(&self) -> i64 {
        *self.last_update.read().await
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.inc_requests_served();
        metrics.inc_requests_served();
        metrics.record_change().await;
        assert_eq!(metrics.requests_served.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.changes_observed.load(Ordering::Relaxed), 1);
        assert!(metrics.last_update().await > 0);
    }
}
