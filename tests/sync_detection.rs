//! Change-detection behavior through the public sync API: baseline
//! observations, checksum-gated diffs, the fantasy-points delta threshold,
//! and the poller lifecycle.

use async_trait::async_trait;
use chrono::Utc;
use gridfeed::domain::{Game, GameStatus, PlayerStatLine};
use gridfeed::error::Result;
use gridfeed::orchestrator::LoadBalancingStrategy;
use gridfeed::resilience::CircuitState;
use gridfeed::sources::{
    ResilientSource, ResilientSourceConfig, SourceClient, SourceHealth, SourceKind,
};
use gridfeed::sync::{ChangeCategory, SyncConfig, SyncEvent, SyncService};
use gridfeed::{CacheManager, SourceOrchestrator};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves a scripted sequence of live slates and stat lines; the last entry
/// repeats once the queue drains.
struct ScriptedFeed {
    resilient: ResilientSource,
    slates: Mutex<VecDeque<Vec<Game>>>,
    stat_points: Mutex<VecDeque<Decimal>>,
}

impl ScriptedFeed {
    fn new(slates: Vec<Vec<Game>>, stat_points: Vec<Decimal>) -> Self {
        Self {
            resilient: ResilientSource::new("nfl_official", ResilientSourceConfig::default()),
            slates: Mutex::new(slates.into()),
            stat_points: Mutex::new(stat_points.into()),
        }
    }

    fn next<T: Clone>(queue: &Mutex<VecDeque<T>>, fallback: T) -> T {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap_or(fallback)
        }
    }
}

#[async_trait]
impl SourceClient for ScriptedFeed {
    fn kind(&self) -> SourceKind {
        SourceKind::NflOfficial
    }

    fn circuit_state(&self) -> CircuitState {
        self.resilient.circuit_state()
    }

    fn reset_circuit_breaker(&self) {
        self.resilient.reset_circuit_breaker()
    }

    fn health(&self) -> SourceHealth {
        self.resilient.health()
    }

    async fn current_week(&self, _season: u16) -> Result<u8> {
        Ok(6)
    }

    async fn live_games(&self) -> Result<Vec<Game>> {
        Ok(Self::next(&self.slates, Vec::new()))
    }

    async fn player_stats(
        &self,
        player_id: &str,
        week: u8,
        season: u16,
    ) -> Result<Option<PlayerStatLine>> {
        let mut line = PlayerStatLine::empty(player_id, week, season);
        line.fantasy_points = Self::next(&self.stat_points, Decimal::ZERO);
        Ok(Some(line))
    }
}

fn live_game(id: &str, home_score: u32, quarter: u8) -> Game {
    Game {
        id: id.to_string(),
        home_team: "KC".to_string(),
        away_team: "BUF".to_string(),
        kickoff: Utc::now(),
        week: 6,
        season: 2025,
        status: GameStatus::InProgress,
        home_score,
        away_score: 10,
        quarter,
        time_remaining: "7:12".to_string(),
        last_updated: Utc::now(),
    }
}

fn sync_over(feed: ScriptedFeed, config: SyncConfig) -> Arc<SyncService> {
    let orchestrator = Arc::new(SourceOrchestrator::new(LoadBalancingStrategy::Priority, 0));
    orchestrator.register(Arc::new(feed), 1);
    Arc::new(SyncService::new(
        config,
        orchestrator,
        Arc::new(CacheManager::new(1000)),
        None,
    ))
}

#[tokio::test]
async fn score_changes_flow_to_subscribers() {
    let feed = ScriptedFeed::new(
        vec![vec![live_game("g1", 7, 2)], vec![live_game("g1", 14, 2)]],
        vec![],
    );
    let service = sync_over(feed, SyncConfig::default());
    let mut events = service.subscribe();

    service.force_sync().await.unwrap();
    assert!(events.try_recv().is_err(), "first observation is baseline");

    service.force_sync().await.unwrap();
    let event = match events.try_recv().unwrap() {
        SyncEvent::Changed(event) => event,
        other => panic!("expected Changed, got {other:?}"),
    };
    assert_eq!(event.entity_id, "g1");
    assert_eq!(event.category, ChangeCategory::GameState);
    assert_eq!(event.field_diff.len(), 1);
    let change = &event.field_diff["home_score"];
    assert_eq!(change.from, serde_json::json!(7));
    assert_eq!(change.to, serde_json::json!(14));
}

#[tokio::test]
async fn multiple_fields_land_in_one_event() {
    let feed = ScriptedFeed::new(
        vec![vec![live_game("g1", 7, 2)], vec![live_game("g1", 14, 3)]],
        vec![],
    );
    let service = sync_over(feed, SyncConfig::default());
    let mut events = service.subscribe();

    service.force_sync().await.unwrap();
    service.force_sync().await.unwrap();

    let event = match events.try_recv().unwrap() {
        SyncEvent::Changed(event) => event,
        other => panic!("expected Changed, got {other:?}"),
    };
    assert_eq!(event.field_diff.len(), 2);
    assert!(event.field_diff.contains_key("home_score"));
    assert!(event.field_diff.contains_key("quarter"));
    assert!(events.try_recv().is_err(), "one event per changed entity");
}

#[tokio::test]
async fn sub_threshold_point_noise_is_suppressed() {
    let points: Vec<Decimal> = vec!["12.53".parse().unwrap(), "12.55".parse().unwrap()];
    let feed = ScriptedFeed::new(vec![], points);
    let config = SyncConfig {
        watched_players: vec!["p1".to_string()],
        ..SyncConfig::default()
    };
    let service = sync_over(feed, config);
    let mut events = service.subscribe();

    service.force_sync().await.unwrap();
    service.force_sync().await.unwrap();

    assert!(
        events.try_recv().is_err(),
        "a 0.02 point drift must not produce a change event"
    );
}

#[tokio::test]
async fn threshold_crossing_points_change_is_reported() {
    let points: Vec<Decimal> = vec!["12.5".parse().unwrap(), "12.7".parse().unwrap()];
    let feed = ScriptedFeed::new(vec![], points);
    let config = SyncConfig {
        watched_players: vec!["p1".to_string()],
        ..SyncConfig::default()
    };
    let service = sync_over(feed, config);
    let mut events = service.subscribe();

    service.force_sync().await.unwrap();
    service.force_sync().await.unwrap();

    let event = match events.try_recv().unwrap() {
        SyncEvent::Changed(event) => event,
        other => panic!("expected Changed, got {other:?}"),
    };
    assert_eq!(event.category, ChangeCategory::PlayerStats);
    let change = &event.field_diff["fantasy_points"];
    let from: Decimal = "12.5".parse().unwrap();
    let to: Decimal = "12.7".parse().unwrap();
    assert_eq!(change.from, serde_json::json!(from));
    assert_eq!(change.to, serde_json::json!(to));
}

#[tokio::test]
async fn slate_reset_restarts_baselines() {
    let feed = ScriptedFeed::new(
        vec![
            vec![live_game("g1", 7, 2)],
            vec![],
            vec![live_game("g1", 7, 2)],
        ],
        vec![],
    );
    let service = sync_over(feed, SyncConfig::default());
    let mut events = service.subscribe();

    service.force_sync().await.unwrap();
    service.force_sync().await.unwrap();
    service.force_sync().await.unwrap();

    assert!(
        events.try_recv().is_err(),
        "re-observing an unchanged game after a window reset is a new baseline"
    );
}

#[tokio::test]
async fn pollers_run_and_drain_on_stop() {
    let feed = ScriptedFeed::new(
        vec![vec![live_game("g1", 7, 2)], vec![live_game("g1", 14, 2)]],
        vec![],
    );
    let config = SyncConfig {
        game_poll_interval: Duration::from_millis(20),
        stats_poll_interval: Duration::from_millis(50),
        rebroadcast_interval: Duration::from_millis(20),
        ..SyncConfig::default()
    };
    let service = sync_over(feed, config);
    let mut events = service.subscribe();
    service.start();

    // The scripted slates advance once, so one Changed event must arrive;
    // the rebroadcast ticker then resends it.
    let mut saw_change = false;
    let mut saw_rebroadcast = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_change && saw_rebroadcast) {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("expected sync events before deadline")
            .expect("event channel closed");
        match event {
            SyncEvent::Changed(event) => {
                assert_eq!(event.entity_id, "g1");
                saw_change = true;
            }
            SyncEvent::Rebroadcast(event) => {
                assert_eq!(event.entity_id, "g1");
                saw_rebroadcast = true;
            }
        }
    }

    assert!(service.health().running);
    assert!(service.metrics().game_polls >= 2);

    service.stop().await;
    assert!(!service.health().running);
}
