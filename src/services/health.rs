//! Health check HTTP server for production monitoring
//!
//! Provides liveness and readiness probes for process supervision and a
//! Prometheus text endpoint covering sources, sync and cache.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheManager;
use crate::orchestrator::SourceOrchestrator;
use crate::services::Metrics;
use crate::sync::SyncService;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall system health response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub sources_healthy: usize,
    pub sources_total: usize,
}

/// Shared state for the health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub orchestrator: Arc<SourceOrchestrator>,
    pub cache: Arc<CacheManager>,
    pub sync: Option<Arc<SyncService>>,
    pub metrics: Option<Arc<Metrics>>,
    pub db_connected: AtomicBool,
}

impl HealthState {
    pub fn new(orchestrator: Arc<SourceOrchestrator>, cache: Arc<CacheManager>) -> Self {
        Self {
            started_at: Utc::now(),
            orchestrator,
            cache,
            sync: None,
            metrics: None,
            db_connected: AtomicBool::new(false),
        }
    }

    pub fn with_sync(mut self, sync: Arc<SyncService>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn set_db_connected(&self, connected: bool) {
        self.db_connected.store(connected, Ordering::SeqCst);
    }

    /// Overall status from the fraction of healthy sub-components: all
    /// healthy, at least half, or fewer.
    pub fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();

        let (sources_healthy, sources_total) = self.orchestrator.health_summary();
        let sources_status = if sources_total == 0 || sources_healthy == sources_total {
            HealthStatus::Healthy
        } else if sources_healthy * 2 >= sources_total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        components.push(ComponentHealth {
            name: "sources".to_string(),
            status: sources_status,
            message: Some(format!("{sources_healthy}/{sources_total} healthy")),
        });

        if let Some(sync) = &self.sync {
            let sync_health = sync.health();
            let status = if !sync_health.running {
                HealthStatus::Degraded
            } else if sync_health.stalled {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            };
            components.push(ComponentHealth {
                name: "sync".to_string(),
                status,
                message: sync_health.stalled.then(|| "polling stalled".to_string()),
            });
        }

        let db_connected = self.db_connected.load(Ordering::SeqCst);
        components.push(ComponentHealth {
            name: "database".to_string(),
            status: if db_connected {
                HealthStatus::Healthy
            } else {
                // The store tier is optional; missing DB degrades, never kills.
                HealthStatus::Degraded
            },
            message: (!db_connected).then(|| "disconnected".to_string()),
        });

        let healthy = components
            .iter()
            .filter(|c| c.status == HealthStatus::Healthy)
            .count();
        let status = if healthy == components.len() {
            HealthStatus::Healthy
        } else if healthy * 2 >= components.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds() as u64,
            components,
            sources_healthy,
            sources_total,
        }
    }
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    pub async fn run(&self) -> crate::Result<()> {
        let state = Arc::clone(&self.state);

        // Dashboards poll these endpoints cross-origin.
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .layer(cors)
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::FeedError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }

    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

/// Full health check endpoint
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health();
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Liveness probe - is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe - is the service ready to serve reads?
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.get_health().status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health();
    let cache = state.cache.stats();
    let health_gauge = match health.status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 0,
        HealthStatus::Unhealthy => -1,
    };

    let (requests_served, total_failures, changes_observed, rebroadcasts) =
        if let Some(m) = &state.metrics {
            (
                m.requests_served.load(Ordering::Relaxed),
                m.total_failures.load(Ordering::Relaxed),
                m.changes_observed.load(Ordering::Relaxed),
                m.rebroadcasts_observed.load(Ordering::Relaxed),
            )
        } else {
            (0, 0, 0, 0)
        };

    let mut body = format!(
        r#"# HELP gridfeed_up Health status (1=healthy, 0=degraded, -1=unhealthy)
# TYPE gridfeed_up gauge
gridfeed_up {health_gauge}

# HELP gridfeed_uptime_seconds Uptime in seconds
# TYPE gridfeed_uptime_seconds counter
gridfeed_uptime_seconds {uptime}

# HELP gridfeed_sources_healthy Healthy upstream sources
# TYPE gridfeed_sources_healthy gauge
gridfeed_sources_healthy {sources_healthy}

# HELP gridfeed_sources_total Registered upstream sources
# TYPE gridfeed_sources_total gauge
gridfeed_sources_total {sources_total}

# HELP gridfeed_requests_total Read requests served
# TYPE gridfeed_requests_total counter
gridfeed_requests_total {requests_served}

# HELP gridfeed_total_failures_total Requests that exhausted every tier
# TYPE gridfeed_total_failures_total counter
gridfeed_total_failures_total {total_failures}

# HELP gridfeed_changes_total Change events detected
# TYPE gridfeed_changes_total counter
gridfeed_changes_total {changes_observed}

# HELP gridfeed_rebroadcasts_total Change events rebroadcast
# TYPE gridfeed_rebroadcasts_total counter
gridfeed_rebroadcasts_total {rebroadcasts}

# HELP gridfeed_cache_hits_total Cache hits
# TYPE gridfeed_cache_hits_total counter
gridfeed_cache_hits_total {cache_hits}

# HELP gridfeed_cache_misses_total Cache misses
# TYPE gridfeed_cache_misses_total counter
gridfeed_cache_misses_total {cache_misses}

# HELP gridfeed_cache_entries Cache entry count
# TYPE gridfeed_cache_entries gauge
gridfeed_cache_entries {cache_entries}
"#,
        uptime = health.uptime_seconds,
        sources_healthy = health.sources_healthy,
        sources_total = health.sources_total,
        cache_hits = cache.hits,
        cache_misses = cache.misses,
        cache_entries = cache.entries,
    );

    // Per-source breaker and limiter gauges.
    for status in state.orchestrator.source_status() {
        let breaker_state = match status.health.circuit_breaker.state {
            crate::resilience::CircuitState::Closed => 0,
            crate::resilience::CircuitState::HalfOpen => 1,
            crate::resilience::CircuitState::Open => 2,
        };
        body.push_str(&format!(
            "gridfeed_source_breaker_state{{source=\"{}\"}} {}\n",
            status.name, breaker_state
        ));
        body.push_str(&format!(
            "gridfeed_source_limiter_utilization{{source=\"{}\"}} {:.3}\n",
            status.name, status.health.rate_limiter.utilization
        ));
        body.push_str(&format!(
            "gridfeed_source_requests_total{{source=\"{}\"}} {}\n",
            status.name, status.health.metrics.total_requests
        ));
        body.push_str(&format!(
            "gridfeed_source_avg_latency_ms{{source=\"{}\"}} {:.1}\n",
            status.name, status.health.metrics.average_latency_ms
        ));
    }

    (StatusCode::OK, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::LoadBalancingStrategy;
    use crate::resilience::CircuitState;
    use crate::sources::{MockSourceClient, SourceHealth, SourceKind};

    fn source_with_health(healthy: bool) -> MockSourceClient {
        let mut mock = MockSourceClient::new();
        mock.expect_kind().return_const(SourceKind::Espn);
        mock.expect_name().return_const("espn".to_string());
        mock.expect_circuit_state().return_const(CircuitState::Closed);
        mock.expect_health().returning(move || {
            let source = crate::sources::ResilientSource::new(
                "espn",
                crate::sources::ResilientSourceConfig::default(),
            );
            let mut health: SourceHealth = source.health();
            if !healthy {
                health.healthy = false;
                health.issues.push("circuit breaker is open".to_string());
            }
            health
        });
        mock
    }

    fn state(healthy_sources: &[bool]) -> HealthState {
        let orchestrator = Arc::new(SourceOrchestrator::new(LoadBalancingStrategy::Priority, 0));
        for (i, healthy) in healthy_sources.iter().enumerate() {
            orchestrator.register(Arc::new(source_with_health(*healthy)), i as u32);
        }
        HealthState::new(orchestrator, Arc::new(CacheManager::new(100)))
    }

    #[test]
    fn all_sources_healthy_without_db_is_degraded_overall() {
        let state = state(&[true, true]);
        let health = state.get_health();
        // sources healthy, database disconnected -> 1 of 2 components
        assert_eq!(health.sources_healthy, 2);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[test]
    fn connected_db_and_healthy_sources_is_healthy() {
        let state = state(&[true]);
        state.set_db_connected(true);
        assert_eq!(state.get_health().status, HealthStatus::Healthy);
    }

    #[test]
    fn mostly_unhealthy_sources_degrade_the_component() {
        let state = state(&[true, false, false]);
        state.set_db_connected(true);
        let health = state.get_health();
        let sources = health
            .components
            .iter()
            .find(|c| c.name == "sources")
            .unwrap();
        assert_eq!(sources.status, HealthStatus::Unhealthy);
    }
}
