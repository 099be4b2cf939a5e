//! Change-detection sync loop.
//!
//! Polls live games and watched player stat lines on fixed cadences,
//! snapshots each entity, and broadcasts a [`ChangeEvent`] only when the
//! checksummed state actually moved. Recent changes are rebroadcast on a
//! short ticker so late subscribers converge during live windows.

mod snapshot;

pub use snapshot::{
    ChangeCategory, ChangeEvent, FieldChange, FieldDiff, GameSnapshot, PlayerStatsSnapshot,
    MIN_POINTS_DELTA,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheManager, Namespace};
use crate::domain::{Game, PlayerStatLine, DEFAULT_SEASON};
use crate::error::Result;
use crate::orchestrator::SourceOrchestrator;
use crate::store::PostgresStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Payload on the sync broadcast channel. Rebroadcasts are tagged so
/// consumers with their own dedup can ignore them.
#[derive(Debug, Clone, Serialize)]
pub enum SyncEvent {
    Changed(ChangeEvent),
    Rebroadcast(ChangeEvent),
}

impl SyncEvent {
    pub fn inner(&self) -> &ChangeEvent {
        match self {
            Self::Changed(event) | Self::Rebroadcast(event) => event,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub game_poll_interval: Duration,
    pub stats_poll_interval: Duration,
    pub rebroadcast_interval: Duration,
    pub max_concurrent_polls: usize,
    /// Player ids whose stat lines the stats poller tracks
    pub watched_players: Vec<String>,
    /// Persist every changed entity to the store
    pub write_through: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            game_poll_interval: Duration::from_secs(15),
            stats_poll_interval: Duration::from_secs(30),
            rebroadcast_interval: Duration::from_secs(5),
            max_concurrent_polls: 8,
            watched_players: Vec::new(),
            write_through: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetrics {
    pub game_polls: u64,
    pub stats_polls: u64,
    pub poll_failures: u64,
    pub changes_detected: u64,
    pub events_rebroadcast: u64,
    pub avg_poll_ms: f64,
    pub error_rate: f64,
    pub last_game_poll_at: Option<DateTime<Utc>>,
    pub last_stats_poll_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncHealth {
    pub running: bool,
    pub stalled: bool,
    pub tracked_games: usize,
    pub tracked_players: usize,
    pub metrics: SyncMetrics,
}

struct Counters {
    game_polls: AtomicU64,
    stats_polls: AtomicU64,
    poll_failures: AtomicU64,
    changes_detected: AtomicU64,
    events_rebroadcast: AtomicU64,
    poll_time_total_ms: AtomicU64,
}

pub struct SyncService {
    config: SyncConfig,
    orchestrator: Arc<SourceOrchestrator>,
    cache: Arc<CacheManager>,
    store: Option<Arc<PostgresStore>>,
    game_snapshots: DashMap<String, GameSnapshot>,
    stats_snapshots: DashMap<String, PlayerStatsSnapshot>,
    recent_events: Mutex<Vec<ChangeEvent>>,
    events: broadcast::Sender<SyncEvent>,
    counters: Counters,
    last_game_poll: Mutex<Option<DateTime<Utc>>>,
    last_stats_poll: Mutex<Option<DateTime<Utc>>>,
    poll_permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        orchestrator: Arc<SourceOrchestrator>,
        cache: Arc<CacheManager>,
        store: Option<Arc<PostgresStore>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let permits = config.max_concurrent_polls.max(1);
        Self {
            config,
            orchestrator,
            cache,
            store,
            game_snapshots: DashMap::new(),
            stats_snapshots: DashMap::new(),
            recent_events: Mutex::new(Vec::new()),
            events,
            counters: Counters {
                game_polls: AtomicU64::new(0),
                stats_polls: AtomicU64::new(0),
                poll_failures: AtomicU64::new(0),
                changes_detected: AtomicU64::new(0),
                events_rebroadcast: AtomicU64::new(0),
                poll_time_total_ms: AtomicU64::new(0),
            },
            last_game_poll: Mutex::new(None),
            last_stats_poll: Mutex::new(None),
            poll_permits: Arc::new(Semaphore::new(permits)),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Spawn the pollers and the rebroadcast ticker.
    pub fn start(self: &Arc<Self>) {
        info!(
            game_interval_s = self.config.game_poll_interval.as_secs(),
            stats_interval_s = self.config.stats_poll_interval.as_secs(),
            "starting sync service"
        );

        let mut handles = self.handles.lock().expect("handles lock poisoned");
        handles.push(self.spawn_loop(self.config.game_poll_interval, |svc| async move {
            if let Err(err) = svc.poll_games_once().await {
                svc.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "game poll failed");
            }
        }));
        handles.push(self.spawn_loop(self.config.stats_poll_interval, |svc| async move {
            if let Err(err) = svc.poll_stats_once().await {
                svc.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "stats poll failed");
            }
        }));
        handles.push(self.spawn_loop(self.config.rebroadcast_interval, |svc| async move {
            svc.rebroadcast_recent();
        }));
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, interval: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(Arc::clone(&service)).await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signal shutdown and wait for the loops to drain.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("handles lock poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
        info!("sync service stopped");
    }

    /// One immediate pass over both categories, outside the tickers.
    pub async fn force_sync(&self) -> Result<()> {
        self.poll_games_once().await?;
        self.poll_stats_once().await?;
        Ok(())
    }

    async fn poll_games_once(&self) -> Result<()> {
        let _permit = self
            .poll_permits
            .acquire()
            .await
            .map_err(|_| crate::error::FeedError::Cancelled)?;

        let started = std::time::Instant::now();
        let games = self.orchestrator.live_games().await?;
        self.counters.game_polls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .poll_time_total_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        *self.last_game_poll.lock().expect("poll lock poisoned") = Some(Utc::now());

        for game in &games {
            self.observe_game(game).await;
        }

        // A slate that went empty means the live window ended; drop stale
        // snapshots so the next window starts clean.
        if games.is_empty() {
            self.game_snapshots.clear();
        }
        Ok(())
    }

    async fn observe_game(&self, game: &Game) {
        let snapshot = GameSnapshot::of(game);
        let previous = self.game_snapshots.get(&game.id).map(|p| p.clone());
        let diff = match &previous {
            Some(previous) => snapshot.diff(previous),
            None => FieldDiff::new(),
        };
        let is_new = previous.is_none();
        let current_payload = snapshot.payload();
        self.game_snapshots.insert(game.id.clone(), snapshot);

        let _ = self.cache.set(Namespace::LiveGames, &game.id, game);

        if diff.is_empty() && !is_new {
            return;
        }
        if !diff.is_empty() {
            debug!(game_id = %game.id, fields = diff.len(), "game state changed");
            self.publish(ChangeEvent::new(
                game.id.clone(),
                ChangeCategory::GameState,
                diff,
                previous.map(|p| p.payload()),
                current_payload,
            ));
        }

        if self.config.write_through {
            if let Some(store) = &self.store {
                if let Err(err) = store.upsert_game(game).await {
                    warn!(game_id = %game.id, error = %err, "game write-through failed");
                }
            }
        }
    }

    async fn poll_stats_once(&self) -> Result<()> {
        if self.config.watched_players.is_empty() {
            return Ok(());
        }

        let season = DEFAULT_SEASON;
        let week = self.orchestrator.current_week(season).await?;
        self.counters.stats_polls.fetch_add(1, Ordering::Relaxed);
        *self.last_stats_poll.lock().expect("poll lock poisoned") = Some(Utc::now());

        let mut polls = Vec::new();
        for player_id in &self.config.watched_players {
            let permit = Arc::clone(&self.poll_permits);
            let orchestrator = Arc::clone(&self.orchestrator);
            let player_id = player_id.clone();
            polls.push(async move {
                let _permit = permit.acquire_owned().await.ok()?;
                match orchestrator.player_stats(&player_id, week, season).await {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(player_id = %player_id, error = %err, "stats poll failed");
                        None
                    }
                }
            });
        }

        for line in futures::future::join_all(polls).await.into_iter().flatten() {
            self.observe_stat_line(&line).await;
        }
        Ok(())
    }

    async fn observe_stat_line(&self, line: &PlayerStatLine) {
        let snapshot = PlayerStatsSnapshot::of(line);
        let previous = self.stats_snapshots.get(&line.player_id).map(|p| p.clone());
        let diff = match &previous {
            Some(previous) => snapshot.diff(previous),
            None => FieldDiff::new(),
        };
        let current_payload = snapshot.payload();
        self.stats_snapshots
            .insert(line.player_id.clone(), snapshot);

        let _ = self.cache.set(Namespace::PlayerStats, &line.player_id, line);

        if diff.is_empty() {
            return;
        }
        debug!(player_id = %line.player_id, fields = diff.len(), "player stats changed");
        self.publish(ChangeEvent::new(
            line.player_id.clone(),
            ChangeCategory::PlayerStats,
            diff,
            previous.map(|p| p.payload()),
            current_payload,
        ));

        if self.config.write_through {
            if let Some(store) = &self.store {
                if let Err(err) = store.upsert_stat_line(line).await {
                    warn!(player_id = %line.player_id, error = %err, "stats write-through failed");
                }
            }
        }
    }

    fn publish(&self, event: ChangeEvent) {
        self.counters.changes_detected.fetch_add(1, Ordering::Relaxed);
        self.recent_events
            .lock()
            .expect("events lock poisoned")
            .push(event.clone());
        let _ = self.events.send(SyncEvent::Changed(event));
    }

    /// Resend changes newer than twice their category's poll interval, so a
    /// subscriber that connected between polls still sees the current live
    /// state. Stats change on a slower cadence than game state, so their
    /// events stay replayable for longer.
    fn rebroadcast_recent(&self) {
        let now = Utc::now();
        let game_cutoff = now - recency_window(self.config.game_poll_interval);
        let stats_cutoff = now - recency_window(self.config.stats_poll_interval);

        let mut recent = self.recent_events.lock().expect("events lock poisoned");
        recent.retain(|event| {
            let cutoff = match event.category {
                ChangeCategory::GameState => game_cutoff,
                ChangeCategory::PlayerStats => stats_cutoff,
            };
            event.detected_at >= cutoff
        });

        for event in recent.iter() {
            if self.events.send(SyncEvent::Rebroadcast(event.clone())).is_ok() {
                self.counters
                    .events_rebroadcast
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn metrics(&self) -> SyncMetrics {
        let game_polls = self.counters.game_polls.load(Ordering::Relaxed);
        let stats_polls = self.counters.stats_polls.load(Ordering::Relaxed);
        let poll_failures = self.counters.poll_failures.load(Ordering::Relaxed);
        let poll_time_total_ms = self.counters.poll_time_total_ms.load(Ordering::Relaxed);
        let attempts = game_polls + stats_polls + poll_failures;

        SyncMetrics {
            game_polls,
            stats_polls,
            poll_failures,
            changes_detected: self.counters.changes_detected.load(Ordering::Relaxed),
            events_rebroadcast: self.counters.events_rebroadcast.load(Ordering::Relaxed),
            avg_poll_ms: if game_polls == 0 {
                0.0
            } else {
                poll_time_total_ms as f64 / game_polls as f64
            },
            error_rate: if attempts == 0 {
                0.0
            } else {
                poll_failures as f64 / attempts as f64
            },
            last_game_poll_at: *self.last_game_poll.lock().expect("poll lock poisoned"),
            last_stats_poll_at: *self.last_stats_poll.lock().expect("poll lock poisoned"),
        }
    }

    /// Stalled when the last successful game poll is older than three
    /// intervals despite the service having started.
    pub fn health(&self) -> SyncHealth {
        let metrics = self.metrics();
        let running = !self.handles.lock().expect("handles lock poisoned").is_empty();
        let stall_after = chrono::Duration::from_std(self.config.game_poll_interval * 3)
            .unwrap_or_else(|_| chrono::Duration::seconds(45));
        let stalled = running
            && match metrics.last_game_poll_at {
                Some(at) => Utc::now() - at > stall_after,
                None => metrics.game_polls == 0 && metrics.poll_failures > 0,
            };

        SyncHealth {
            running,
            stalled,
            tracked_games: self.game_snapshots.len(),
            tracked_players: self.stats_snapshots.len(),
            metrics,
        }
    }
}

fn recency_window(interval: Duration) -> chrono::Duration {
    chrono::Duration::from_std(interval * 2).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GameStatus;
    use crate::error::FeedError;
    use crate::orchestrator::LoadBalancingStrategy;
    use crate::resilience::CircuitState;
    use crate::sources::{MockSourceClient, SourceKind};
    use rust_decimal_macros::dec;

    fn live_game(id: &str, home_score: u32) -> Game {
        Game {
            id: id.to_string(),
            home_team: "KC".to_string(),
            away_team: "BUF".to_string(),
            kickoff: Utc::now(),
            week: 6,
            season: DEFAULT_SEASON,
            status: GameStatus::InProgress,
            home_score,
            away_score: 7,
            quarter: 2,
            time_remaining: "5:00".to_string(),
            last_updated: Utc::now(),
        }
    }

    fn service_with_source(mock: MockSourceClient) -> Arc<SyncService> {
        let orchestrator = Arc::new(SourceOrchestrator::new(LoadBalancingStrategy::Priority, 0));
        orchestrator.register(Arc::new(mock), 1);
        Arc::new(SyncService::new(
            SyncConfig::default(),
            orchestrator,
            Arc::new(CacheManager::new(1000)),
            None,
        ))
    }

    fn live_source(games: Vec<Vec<Game>>) -> MockSourceClient {
        let mut mock = MockSourceClient::new();
        mock.expect_kind().return_const(SourceKind::NflOfficial);
        mock.expect_name().return_const("nfl_official".to_string());
        mock.expect_circuit_state().return_const(CircuitState::Closed);
        let queue = Mutex::new(games);
        mock.expect_live_games().returning(move || {
            let mut queue = queue.lock().unwrap();
            if queue.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(queue.remove(0))
            }
        });
        mock
    }

    #[tokio::test]
    async fn first_observation_emits_no_change_event() {
        let service = service_with_source(live_source(vec![vec![live_game("g1", 7)]]));
        let mut events = service.subscribe();

        service.poll_games_once().await.unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(service.health().tracked_games, 1);
    }

    #[tokio::test]
    async fn identical_polls_are_idempotent() {
        let service = service_with_source(live_source(vec![
            vec![live_game("g1", 7)],
            vec![live_game("g1", 7)],
        ]));
        let mut events = service.subscribe();

        service.poll_games_once().await.unwrap();
        service.poll_games_once().await.unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(service.metrics().changes_detected, 0);
    }

    #[tokio::test]
    async fn score_change_emits_single_field_diff() {
        let service = service_with_source(live_source(vec![
            vec![live_game("g1", 7)],
            vec![live_game("g1", 14)],
        ]));
        let mut events = service.subscribe();

        service.poll_games_once().await.unwrap();
        service.poll_games_once().await.unwrap();

        let event = match events.try_recv().unwrap() {
            SyncEvent::Changed(event) => event,
            other => panic!("expected Changed, got {other:?}"),
        };
        assert_eq!(event.entity_id, "g1");
        assert_eq!(event.category, ChangeCategory::GameState);
        assert_eq!(event.field_diff.len(), 1);
        assert!(event.field_diff.contains_key("home_score"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn change_events_carry_before_and_after_state() {
        let service = service_with_source(live_source(vec![
            vec![live_game("g1", 7)],
            vec![live_game("g1", 14)],
        ]));
        let mut events = service.subscribe();

        service.poll_games_once().await.unwrap();
        service.poll_games_once().await.unwrap();

        let event = match events.try_recv().unwrap() {
            SyncEvent::Changed(event) => event,
            other => panic!("expected Changed, got {other:?}"),
        };
        let previous = event.previous.expect("second observation has a baseline");
        assert_eq!(previous["home_score"], serde_json::json!(7));
        assert_eq!(event.current["home_score"], serde_json::json!(14));
        // The untouched fields ride along so consumers get the whole entity.
        assert_eq!(event.current["away_score"], serde_json::json!(7));
        assert_eq!(event.current["status"], serde_json::json!("in_progress"));
    }

    #[tokio::test]
    async fn changed_games_are_cached() {
        let service = service_with_source(live_source(vec![vec![live_game("g1", 7)]]));
        service.poll_games_once().await.unwrap();

        let cached: Game = service
            .cache
            .get(Namespace::LiveGames, "g1")
            .expect("live game cached on observation");
        assert_eq!(cached.home_score, 7);
    }

    #[tokio::test]
    async fn empty_slate_clears_tracked_games() {
        let service = service_with_source(live_source(vec![vec![live_game("g1", 7)], vec![]]));
        service.poll_games_once().await.unwrap();
        assert_eq!(service.health().tracked_games, 1);

        service.poll_games_once().await.unwrap();
        assert_eq!(service.health().tracked_games, 0);
    }

    #[tokio::test]
    async fn rebroadcast_resends_recent_changes() {
        let service = service_with_source(live_source(vec![
            vec![live_game("g1", 7)],
            vec![live_game("g1", 14)],
        ]));
        service.poll_games_once().await.unwrap();
        service.poll_games_once().await.unwrap();

        let mut late_subscriber = service.subscribe();
        service.rebroadcast_recent();

        match late_subscriber.try_recv().unwrap() {
            SyncEvent::Rebroadcast(event) => assert_eq!(event.entity_id, "g1"),
            other => panic!("expected Rebroadcast, got {other:?}"),
        }
        assert!(service.metrics().events_rebroadcast >= 1);
    }

    #[tokio::test]
    async fn rebroadcast_window_follows_each_category_cadence() {
        let service = service_with_source(live_source(vec![]));
        // Game events age out after 2x the 1s game cadence; stats events
        // live for 2x the 30s stats cadence.
        let config = SyncConfig {
            game_poll_interval: Duration::from_secs(1),
            stats_poll_interval: Duration::from_secs(30),
            ..SyncConfig::default()
        };
        let service = Arc::new(SyncService::new(
            config,
            Arc::clone(&service.orchestrator),
            Arc::new(CacheManager::new(1000)),
            None,
        ));

        let aged = Utc::now() - chrono::Duration::seconds(10);
        let mut game_event = ChangeEvent::new(
            "g1".to_string(),
            ChangeCategory::GameState,
            FieldDiff::new(),
            None,
            serde_json::json!({}),
        );
        game_event.detected_at = aged;
        let mut stats_event = ChangeEvent::new(
            "p1".to_string(),
            ChangeCategory::PlayerStats,
            FieldDiff::new(),
            None,
            serde_json::json!({}),
        );
        stats_event.detected_at = aged;
        {
            let mut recent = service.recent_events.lock().unwrap();
            recent.push(game_event);
            recent.push(stats_event);
        }

        let mut events = service.subscribe();
        service.rebroadcast_recent();

        match events.try_recv().unwrap() {
            SyncEvent::Rebroadcast(event) => {
                assert_eq!(event.entity_id, "p1");
                assert_eq!(event.category, ChangeCategory::PlayerStats);
            }
            other => panic!("expected Rebroadcast, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "stale game event must not resend");
    }

    #[tokio::test]
    async fn watched_player_stat_changes_are_detected() {
        let mut mock = MockSourceClient::new();
        mock.expect_kind().return_const(SourceKind::SportsData);
        mock.expect_name().return_const("sportsdata".to_string());
        mock.expect_circuit_state().return_const(CircuitState::Closed);
        mock.expect_current_week().returning(|_| Ok(6));

        let calls = Mutex::new(0u32);
        mock.expect_player_stats().returning(move |player_id, week, season| {
            let mut line = PlayerStatLine::empty(player_id, week, season);
            let mut calls = calls.lock().unwrap();
            *calls += 1;
            line.fantasy_points = if *calls > 1 { dec!(18.4) } else { dec!(12.1) };
            Ok(Some(line))
        });

        let orchestrator = Arc::new(SourceOrchestrator::new(LoadBalancingStrategy::Priority, 0));
        orchestrator.register(Arc::new(mock), 1);
        let config = SyncConfig {
            watched_players: vec!["p1".to_string()],
            ..SyncConfig::default()
        };
        let service = Arc::new(SyncService::new(
            config,
            orchestrator,
            Arc::new(CacheManager::new(1000)),
            None,
        ));
        let mut events = service.subscribe();

        service.poll_stats_once().await.unwrap();
        assert!(events.try_recv().is_err(), "first observation is baseline");

        service.poll_stats_once().await.unwrap();
        let event = match events.try_recv().unwrap() {
            SyncEvent::Changed(event) => event,
            other => panic!("expected Changed, got {other:?}"),
        };
        assert_eq!(event.category, ChangeCategory::PlayerStats);
        assert!(event.field_diff.contains_key("fantasy_points"));
    }

    #[tokio::test]
    async fn poll_failure_surfaces_error_and_counts() {
        let mut mock = MockSourceClient::new();
        mock.expect_kind().return_const(SourceKind::NflOfficial);
        mock.expect_name().return_const("nfl_official".to_string());
        mock.expect_circuit_state().return_const(CircuitState::Closed);
        mock.expect_live_games().returning(|| {
            Err(FeedError::Upstream {
                source_name: "nfl_official".to_string(),
                status: 500,
                message: "down".to_string(),
            })
        });

        let service = service_with_source(mock);
        assert!(service.poll_games_once().await.is_err());
    }
}
