//! Multi-source orchestrator.
//!
//! Owns the registry of source clients and routes each typed operation across
//! them: preferred source first, then explicit fallbacks, then everything
//! else in load-balanced order. A first pass skips sources whose breaker is
//! open; if the whole set fails, the set is retried with capped exponential
//! backoff before giving up.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{FantasyProjection, Game, InjuryReport, PlayerStatLine};
use crate::error::{FeedError, Result};
use crate::resilience::CircuitState;
use crate::sources::{SourceClient, SourceHealth, SourceKind};

const RESPONSE_TIME_SAMPLES: usize = 100;
const PASS_BACKOFF_BASE: Duration = Duration::from_millis(500);
const PASS_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// How sources without an explicit preference are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    /// Static priority, lowest number first
    Priority,
    RoundRobin,
    /// Fewest in-flight requests first
    LeastConnections,
    /// Lowest recent average latency first
    ResponseTime,
}

impl FromStr for LoadBalancingStrategy {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(Self::Priority),
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_connections" | "leastconnections" => Ok(Self::LeastConnections),
            "response_time" | "responsetime" => Ok(Self::ResponseTime),
            _ => Err("invalid strategy; expected priority|round_robin|least_connections|response_time"),
        }
    }
}

struct RegisteredSource {
    name: String,
    client: Arc<dyn SourceClient>,
    priority: u32,
    in_flight: AtomicUsize,
    response_times_ms: Mutex<Vec<u64>>,
}

impl RegisteredSource {
    fn avg_response_ms(&self) -> f64 {
        let times = self.response_times_ms.lock().expect("latency lock poisoned");
        if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<u64>() as f64 / times.len() as f64
        }
    }

    fn record_response(&self, elapsed_ms: u64) {
        let mut times = self.response_times_ms.lock().expect("latency lock poisoned");
        times.push(elapsed_ms);
        if times.len() > RESPONSE_TIME_SAMPLES {
            times.remove(0);
        }
    }
}

/// Per-source view exposed on the admin/health surface
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSourceStatus {
    pub name: String,
    pub priority: u32,
    pub in_flight: usize,
    pub avg_response_ms: f64,
    pub health: SourceHealth,
}

pub struct SourceOrchestrator {
    sources: RwLock<Vec<Arc<RegisteredSource>>>,
    strategy: RwLock<LoadBalancingStrategy>,
    round_robin_cursor: AtomicUsize,
    /// Extra full passes over the source set after the first all-fail
    set_retries: u32,
}

impl SourceOrchestrator {
    pub fn new(strategy: LoadBalancingStrategy, set_retries: u32) -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            strategy: RwLock::new(strategy),
            round_robin_cursor: AtomicUsize::new(0),
            set_retries,
        }
    }

    pub fn register(&self, client: Arc<dyn SourceClient>, priority: u32) {
        let name = client.name();
        info!(source = %name, priority, "registering source");
        self.sources
            .write()
            .expect("source registry lock poisoned")
            .push(Arc::new(RegisteredSource {
                name,
                client,
                priority,
                in_flight: AtomicUsize::new(0),
                response_times_ms: Mutex::new(Vec::new()),
            }));
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.write().expect("strategy lock poisoned") = strategy;
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        *self.strategy.read().expect("strategy lock poisoned")
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .read()
            .expect("source registry lock poisoned")
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut sources = self.sources.write().expect("source registry lock poisoned");
        let before = sources.len();
        sources.retain(|s| s.name != name);
        if sources.len() == before {
            return Err(FeedError::ProviderRegistry(format!(
                "unknown source '{name}'"
            )));
        }
        info!(source = %name, "removed source");
        Ok(())
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> Result<()> {
        let sources = self.sources.read().expect("source registry lock poisoned");
        let source = sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| FeedError::ProviderRegistry(format!("unknown source '{name}'")))?;
        source.client.reset_circuit_breaker();
        Ok(())
    }

    pub fn source_status(&self) -> Vec<OrchestratorSourceStatus> {
        self.sources
            .read()
            .expect("source registry lock poisoned")
            .iter()
            .map(|s| OrchestratorSourceStatus {
                name: s.name.clone(),
                priority: s.priority,
                in_flight: s.in_flight.load(Ordering::Relaxed),
                avg_response_ms: s.avg_response_ms(),
                health: s.client.health(),
            })
            .collect()
    }

    /// Healthy-source count out of total, for the service health roll-up
    pub fn health_summary(&self) -> (usize, usize) {
        let statuses = self.source_status();
        let healthy = statuses.iter().filter(|s| s.health.healthy).count();
        (healthy, statuses.len())
    }

    /// Build the execution order: preferred first, then explicit fallbacks,
    /// then the remaining sources in strategy order. Names that match no
    /// registered source are ignored.
    fn execution_order(
        &self,
        preferred: Option<SourceKind>,
        fallbacks: &[SourceKind],
    ) -> Vec<Arc<RegisteredSource>> {
        let sources = self.sources.read().expect("source registry lock poisoned");
        let mut ordered: Vec<Arc<RegisteredSource>> = Vec::with_capacity(sources.len());
        let mut used: HashMap<String, ()> = HashMap::new();

        let mut push_kind = |kind: SourceKind, ordered: &mut Vec<Arc<RegisteredSource>>| {
            for source in sources.iter() {
                if source.client.kind() == kind && !used.contains_key(&source.name) {
                    used.insert(source.name.clone(), ());
                    ordered.push(Arc::clone(source));
                }
            }
        };

        if let Some(kind) = preferred {
            push_kind(kind, &mut ordered);
        }
        for kind in fallbacks {
            push_kind(*kind, &mut ordered);
        }

        let mut remaining: Vec<Arc<RegisteredSource>> = sources
            .iter()
            .filter(|s| !used.contains_key(&s.name))
            .cloned()
            .collect();

        match self.strategy() {
            LoadBalancingStrategy::Priority => {
                remaining.sort_by_key(|s| s.priority);
            }
            LoadBalancingStrategy::RoundRobin => {
                remaining.sort_by_key(|s| s.priority);
                if !remaining.is_empty() {
                    let offset = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed)
                        % remaining.len();
                    remaining.rotate_left(offset);
                }
            }
            LoadBalancingStrategy::LeastConnections => {
                remaining.sort_by_key(|s| s.in_flight.load(Ordering::Relaxed));
            }
            LoadBalancingStrategy::ResponseTime => {
                remaining.sort_by(|a, b| {
                    a.avg_response_ms()
                        .partial_cmp(&b.avg_response_ms())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        ordered.extend(remaining);
        ordered
    }

    /// Try each source in order; on total failure retry the whole set with
    /// capped exponential backoff between passes. The first pass of each
    /// round skips sources with an open breaker so fast-fails do not crowd
    /// out working sources; a second sweep inside the pass gives skipped
    /// sources their probe chance.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        preferred: Option<SourceKind>,
        fallbacks: &[SourceKind],
        call: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn SourceClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let ordered = self.execution_order(preferred, fallbacks);
        if ordered.is_empty() {
            return Err(FeedError::ProviderRegistry(
                "no sources registered".to_string(),
            ));
        }

        let mut last_error: Option<FeedError> = None;

        for pass in 0..=self.set_retries {
            if pass > 0 {
                let delay = PASS_BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(pass - 1))
                    .min(PASS_BACKOFF_CAP);
                debug!(operation, pass, delay_ms = delay.as_millis() as u64, "retrying source set");
                tokio::time::sleep(delay).await;
            }

            // skip_open=true sweep first, then pick up the skipped ones
            for skip_open in [true, false] {
                for source in &ordered {
                    let open = source.client.circuit_state() == CircuitState::Open;
                    if skip_open && open {
                        continue;
                    }
                    if !skip_open && !open {
                        continue;
                    }

                    source.in_flight.fetch_add(1, Ordering::Relaxed);
                    let started = std::time::Instant::now();
                    let result = call(Arc::clone(&source.client)).await;
                    source.in_flight.fetch_sub(1, Ordering::Relaxed);

                    match result {
                        Ok(value) => {
                            source.record_response(started.elapsed().as_millis() as u64);
                            debug!(operation, source = %source.name, "source call succeeded");
                            return Ok(value);
                        }
                        Err(FeedError::Unsupported(_)) => continue,
                        Err(err) => {
                            warn!(
                                operation,
                                source = %source.name,
                                error = %err,
                                class = err.class(),
                                "source call failed, moving to next"
                            );
                            last_error = Some(err);
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FeedError::Unsupported(format!("no source implements {operation}"))
        }))
    }

    // Typed operations. Preferred/fallback routing mirrors each vendor's
    // strengths: sportsdata for schedule truth, nfl_official for live
    // latency, fantasydata for projections.

    pub async fn current_week(&self, season: u16) -> Result<u8> {
        self.execute(
            "current_week",
            Some(SourceKind::SportsData),
            &[SourceKind::Espn],
            |client| async move { client.current_week(season).await },
        )
        .await
    }

    pub async fn games_by_week(&self, week: u8, season: u16) -> Result<Vec<Game>> {
        self.execute(
            "games_by_week",
            Some(SourceKind::SportsData),
            &[SourceKind::Espn, SourceKind::NflOfficial],
            |client| async move { client.games_by_week(week, season).await },
        )
        .await
    }

    pub async fn live_games(&self) -> Result<Vec<Game>> {
        self.execute(
            "live_games",
            Some(SourceKind::NflOfficial),
            &[SourceKind::Espn],
            |client| async move { client.live_games().await },
        )
        .await
    }

    pub async fn player_stats(
        &self,
        player_id: &str,
        week: u8,
        season: u16,
    ) -> Result<Option<PlayerStatLine>> {
        let player_id = player_id.to_string();
        self.execute(
            "player_stats",
            Some(SourceKind::SportsData),
            &[SourceKind::FantasyData],
            |client| {
                let player_id = player_id.clone();
                async move { client.player_stats(&player_id, week, season).await }
            },
        )
        .await
    }

    pub async fn fantasy_projections(&self, week: u8, season: u16) -> Result<Vec<FantasyProjection>> {
        self.execute(
            "fantasy_projections",
            Some(SourceKind::FantasyData),
            &[SourceKind::SportsData],
            |client| async move { client.fantasy_projections(week, season).await },
        )
        .await
    }

    /// Injury reports merge across every source that serves them instead of
    /// stopping at the first success; duplicates keep the most recent entry
    /// per player.
    pub async fn injury_reports(&self) -> Result<Vec<InjuryReport>> {
        let sources = self.execution_order(Some(SourceKind::NflOfficial), &[]);
        let mut merged: HashMap<String, InjuryReport> = HashMap::new();
        let mut last_error: Option<FeedError> = None;
        let mut any_success = false;

        for source in sources {
            match source.client.injury_reports().await {
                Ok(reports) => {
                    any_success = true;
                    for report in reports {
                        match merged.get(&report.player_id) {
                            Some(existing) if existing.reported_at >= report.reported_at => {}
                            _ => {
                                merged.insert(report.player_id.clone(), report);
                            }
                        }
                    }
                }
                Err(FeedError::Unsupported(_)) => continue,
                Err(err) => last_error = Some(err),
            }
        }

        if !any_success {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        Ok(merged.into_values().collect())
    }
}
