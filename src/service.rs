//! Caller-facing read API.
//!
//! `NflDataService` wires a typed fallback chain over the orchestrator for
//! each read operation: cache, then the multi-source orchestrator as the
//! provider tier, then the Postgres store, then a synthesized default.
//! Chains are keyed by operation parameters so breaker state persists
//! across calls.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{CacheManager, Namespace};
use crate::domain::{FantasyProjection, Game, InjuryReport, PlayerStatLine};
use crate::error::Result;
use crate::fallback::{defaults, FallbackChain, FallbackChainConfig, FallbackResult, Provider};
use crate::orchestrator::{OrchestratorSourceStatus, SourceOrchestrator};
use crate::services::Metrics;
use crate::store::PostgresStore;

/// Cap on memoized per-player stat chains. Week and game chains are
/// naturally bounded by the calendar; stat chains are keyed by player and
/// would otherwise grow for as long as callers ask about new players.
const MAX_STATS_CHAINS: usize = 512;

pub struct NflDataService {
    orchestrator: Arc<SourceOrchestrator>,
    cache: Arc<CacheManager>,
    store: Option<Arc<PostgresStore>>,
    chain_config: FallbackChainConfig,
    metrics: Option<Arc<Metrics>>,
    week_chains: DashMap<String, Arc<FallbackChain<u8>>>,
    game_chains: DashMap<String, Arc<FallbackChain<Vec<Game>>>>,
    stats_chains: DashMap<String, Arc<FallbackChain<PlayerStatLine>>>,
}

impl NflDataService {
    pub fn new(
        orchestrator: Arc<SourceOrchestrator>,
        cache: Arc<CacheManager>,
        store: Option<Arc<PostgresStore>>,
        chain_config: FallbackChainConfig,
    ) -> Self {
        Self {
            orchestrator,
            cache,
            store,
            chain_config,
            metrics: None,
            week_chains: DashMap::new(),
            game_chains: DashMap::new(),
            stats_chains: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn count_request(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_requests_served();
        }
    }

    fn count_outcome<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            if let Some(metrics) = &self.metrics {
                metrics.inc_total_failures();
            }
        }
        result
    }

    pub fn orchestrator(&self) -> &Arc<SourceOrchestrator> {
        &self.orchestrator
    }

    pub fn source_status(&self) -> Vec<OrchestratorSourceStatus> {
        self.orchestrator.source_status()
    }

    /// Current schedule week, through the full fallback chain.
    pub async fn current_week(&self, season: u16) -> Result<FallbackResult<u8>> {
        self.count_request();
        let key = format!("current_week:{season}");
        let chain = self.week_chain(&key, season)?;
        let result = self.count_outcome(chain.execute(&key).await)?;

        // Remember fresh resolutions so the store tier can answer next time.
        if result.successful_provider.is_some() {
            if let Some(store) = &self.store {
                if let Err(err) = store.record_schedule_week(season, result.data).await {
                    warn!(error = %err, "failed to record schedule week");
                }
            }
        }
        Ok(result)
    }

    pub async fn games_by_week(&self, week: u8, season: u16) -> Result<FallbackResult<Vec<Game>>> {
        self.count_request();
        let key = format!("week:{season}:{week}");
        let chain = self.games_chain(&key, week, season, false)?;
        self.count_outcome(chain.execute(&key).await)
    }

    pub async fn live_games(&self) -> Result<FallbackResult<Vec<Game>>> {
        self.count_request();
        let key = "live".to_string();
        let chain = self.games_chain(&key, 0, 0, true)?;
        self.count_outcome(chain.execute(&key).await)
    }

    pub async fn player_stats(
        &self,
        player_id: &str,
        week: u8,
        season: u16,
    ) -> Result<FallbackResult<PlayerStatLine>> {
        self.count_request();
        let key = format!("{player_id}:{season}:{week}");
        let chain = self.stats_chain(&key, player_id, week, season)?;
        self.count_outcome(chain.execute(&key).await)
    }

    /// No fallback tiers beyond the orchestrator's own failover; projections
    /// are advisory and a miss is not worth synthesizing.
    pub async fn fantasy_projections(&self, week: u8, season: u16) -> Result<Vec<FantasyProjection>> {
        self.count_request();
        self.cache
            .get_or_set(Namespace::Projections, &format!("{season}:{week}"), || {
                self.orchestrator.fantasy_projections(week, season)
            })
            .await
    }

    pub async fn injury_reports(&self) -> Result<Vec<InjuryReport>> {
        self.count_request();
        self.cache
            .get_or_set(Namespace::Injuries, "league", || {
                self.orchestrator.injury_reports()
            })
            .await
    }

    fn week_chain(&self, key: &str, season: u16) -> Result<Arc<FallbackChain<u8>>> {
        if let Some(chain) = self.week_chains.get(key) {
            return Ok(Arc::clone(&chain));
        }

        let chain = FallbackChain::new(format!("current_week:{season}"), self.chain_config.clone())
            .with_cache(Arc::clone(&self.cache), Namespace::Games);

        let orchestrator = Arc::clone(&self.orchestrator);
        let chain = chain.with_synthesized_default(move || defaults::current_week(season));
        let chain = match &self.store {
            Some(store) => {
                let store = Arc::clone(store);
                chain.with_store_lookup(move |_key| {
                    let store = Arc::clone(&store);
                    Box::pin(async move { store.latest_schedule_week(season).await })
                })
            }
            None => chain,
        };

        chain.add_provider(
            Provider::builder("sources")
                .fetch(move || {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move {
                        let week = orchestrator.current_week(season).await?;
                        Ok(serde_json::to_value(week)?)
                    })
                })
                .validate(|week: &u8| (1..=22).contains(week))
                .build()?,
        )?;

        let chain = Arc::new(chain);
        self.week_chains.insert(key.to_string(), Arc::clone(&chain));
        Ok(chain)
    }

    fn games_chain(
        &self,
        key: &str,
        week: u8,
        season: u16,
        live: bool,
    ) -> Result<Arc<FallbackChain<Vec<Game>>>> {
        if let Some(chain) = self.game_chains.get(key) {
            return Ok(Arc::clone(&chain));
        }

        let namespace = if live { Namespace::LiveGames } else { Namespace::Games };
        let operation = if live {
            "live_games".to_string()
        } else {
            format!("games_by_week:{season}:{week}")
        };
        let chain = FallbackChain::new(operation, self.chain_config.clone())
            .with_cache(Arc::clone(&self.cache), namespace);

        let chain = chain.with_synthesized_default(move || {
            if live {
                // A plausible default for a live query is an empty slate,
                // not fabricated in-progress games.
                Vec::new()
            } else {
                defaults::mock_games(week, season)
            }
        });
        let chain = match &self.store {
            Some(store) => {
                let store = Arc::clone(store);
                chain.with_store_lookup(move |_key| {
                    let store = Arc::clone(&store);
                    Box::pin(async move {
                        let games = if live {
                            store.live_games().await?
                        } else {
                            store.games_for_week(week, season).await?
                        };
                        Ok(if games.is_empty() { None } else { Some(games) })
                    })
                })
            }
            None => chain,
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        chain.add_provider(
            Provider::builder("sources")
                .fetch(move || {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move {
                        let games = if live {
                            orchestrator.live_games().await?
                        } else {
                            orchestrator.games_by_week(week, season).await?
                        };
                        Ok(serde_json::to_value(games)?)
                    })
                })
                .build()?,
        )?;

        let chain = Arc::new(chain);
        self.game_chains.insert(key.to_string(), Arc::clone(&chain));
        Ok(chain)
    }

    fn stats_chain(
        &self,
        key: &str,
        player_id: &str,
        week: u8,
        season: u16,
    ) -> Result<Arc<FallbackChain<PlayerStatLine>>> {
        if let Some(chain) = self.stats_chains.get(key) {
            return Ok(Arc::clone(&chain));
        }

        let chain = FallbackChain::new(
            format!("player_stats:{key}"),
            self.chain_config.clone(),
        )
        .with_cache(Arc::clone(&self.cache), Namespace::PlayerStats);

        let default_player = player_id.to_string();
        let chain = chain.with_synthesized_default(move || {
            PlayerStatLine::empty(&default_player, week, season)
        });
        let chain = match &self.store {
            Some(store) => {
                let store = Arc::clone(store);
                let player_id = player_id.to_string();
                chain.with_store_lookup(move |_key| {
                    let store = Arc::clone(&store);
                    let player_id = player_id.clone();
                    Box::pin(async move { store.stat_line(&player_id, week, season).await })
                })
            }
            None => chain,
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        let fetch_player = player_id.to_string();
        chain.add_provider(
            Provider::builder("sources")
                .fetch(move || {
                    let orchestrator = Arc::clone(&orchestrator);
                    let player_id = fetch_player.clone();
                    Box::pin(async move {
                        match orchestrator.player_stats(&player_id, week, season).await? {
                            Some(line) => Ok(serde_json::to_value(line)?),
                            None => Err(crate::error::FeedError::Validation(format!(
                                "no stat line for player {player_id}"
                            ))),
                        }
                    })
                })
                .build()?,
        )?;

        // At the cap, evict an arbitrary entry. Upstream health lives in
        // the orchestrator, so a dropped chain only forgets its own
        // per-provider breaker, which rebuilds on first use.
        if self.stats_chains.len() >= MAX_STATS_CHAINS {
            // Bind the key first so the iteration guard is released
            // before remove takes the shard lock.
            let stale = self.stats_chains.iter().next().map(|e| e.key().clone());
            if let Some(stale) = stale {
                self.stats_chains.remove(&stale);
            }
        }

        let chain = Arc::new(chain);
        self.stats_chains.insert(key.to_string(), Arc::clone(&chain));
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::orchestrator::LoadBalancingStrategy;
    use crate::resilience::CircuitState;
    use crate::sources::{MockSourceClient, SourceKind};

    fn orchestrator_with(mock: MockSourceClient) -> Arc<SourceOrchestrator> {
        let orchestrator = Arc::new(SourceOrchestrator::new(LoadBalancingStrategy::Priority, 0));
        orchestrator.register(Arc::new(mock), 1);
        orchestrator
    }

    fn working_week_source(week: u8) -> MockSourceClient {
        let mut mock = MockSourceClient::new();
        mock.expect_kind().return_const(SourceKind::SportsData);
        mock.expect_name().return_const("sportsdata".to_string());
        mock.expect_circuit_state().return_const(CircuitState::Closed);
        mock.expect_current_week().returning(move |_| Ok(week));
        mock
    }

    fn failing_source() -> MockSourceClient {
        let mut mock = MockSourceClient::new();
        mock.expect_kind().return_const(SourceKind::SportsData);
        mock.expect_name().return_const("sportsdata".to_string());
        mock.expect_circuit_state().return_const(CircuitState::Closed);
        mock.expect_current_week().returning(|_| {
            Err(FeedError::Upstream {
                source_name: "sportsdata".to_string(),
                status: 503,
                message: "down".to_string(),
            })
        });
        mock.expect_games_by_week().returning(|_, _| {
            Err(FeedError::Upstream {
                source_name: "sportsdata".to_string(),
                status: 503,
                message: "down".to_string(),
            })
        });
        mock
    }

    fn service(orchestrator: Arc<SourceOrchestrator>) -> NflDataService {
        NflDataService::new(
            orchestrator,
            Arc::new(CacheManager::new(1000)),
            None,
            FallbackChainConfig::default(),
        )
    }

    #[tokio::test]
    async fn fresh_week_comes_from_sources() {
        let service = service(orchestrator_with(working_week_source(6)));
        let result = service.current_week(2025).await.unwrap();
        assert_eq!(result.data, 6);
        assert_eq!(result.successful_provider.as_deref(), Some("sources"));
        assert!(!result.from_mock_data);
    }

    #[tokio::test]
    async fn second_call_hits_cache() {
        let service = service(orchestrator_with(working_week_source(6)));
        service.current_week(2025).await.unwrap();
        let result = service.current_week(2025).await.unwrap();
        assert!(result.from_cache);
    }

    #[tokio::test]
    async fn all_sources_down_falls_to_synthesized_week() {
        let service = service(orchestrator_with(failing_source()));
        let result = service.current_week(2025).await.unwrap();
        assert!(result.from_mock_data);
        assert!((1..=18).contains(&result.data));
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn stats_chain_map_stays_bounded() {
        let service = service(orchestrator_with(working_week_source(6)));
        for i in 0..(MAX_STATS_CHAINS + 40) {
            let player = format!("p{i}");
            let key = format!("{player}:2025:6");
            service.stats_chain(&key, &player, 6, 2025).unwrap();
        }
        assert!(service.stats_chains.len() <= MAX_STATS_CHAINS);

        // Memoization still works for keys that stayed resident.
        let before = service.stats_chains.len();
        let key = format!("p{}:2025:6", MAX_STATS_CHAINS + 39);
        service
            .stats_chain(&key, &format!("p{}", MAX_STATS_CHAINS + 39), 6, 2025)
            .unwrap();
        assert_eq!(service.stats_chains.len(), before);
    }

    #[tokio::test]
    async fn games_fall_back_to_mock_slate() {
        let service = service(orchestrator_with(failing_source()));
        let result = service.games_by_week(6, 2025).await.unwrap();
        assert!(result.from_mock_data);
        assert!(!result.data.is_empty());
        assert!(result.data.iter().all(|g| g.week == 6));
    }
}
