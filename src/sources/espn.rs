//! ESPN scoreboard client.
//!
//! Free endpoint, no API key. Serves the schedule-shaped operations: current
//! week, games by week, and live games filtered from the scoreboard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

use super::json::{pick, pick_array, pick_str, pick_u64};
use super::{ResilientSource, ResilientSourceConfig, SourceClient, SourceHealth, SourceKind};
use crate::domain::{Game, GameStatus};
use crate::error::{FeedError, Result};
use crate::resilience::CircuitState;

const DEFAULT_ESPN_API_BASE: &str =
    "https://site.api.espn.com/apis/site/v2/sports/football/nfl";

pub struct EspnClient {
    http: Client,
    base_url: String,
    inner: ResilientSource,
}

impl EspnClient {
    pub fn new(base_url: Option<&str>, config: ResilientSourceConfig) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_ESPN_API_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("gridfeed/0.1")
            .build()
            .map_err(|e| FeedError::Internal(format!("failed to build ESPN HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            inner: ResilientSource::new(SourceKind::Espn.as_str(), config),
        })
    }

    async fn get_json(&self, operation: &str, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        self.inner
            .execute(operation, || async {
                let resp = self.http.get(&url).query(query).send().await?;
                let status = resp.status();
                let text = resp.text().await?;

                if !status.is_success() {
                    return Err(FeedError::Upstream {
                        source_name: SourceKind::Espn.as_str().to_string(),
                        status: status.as_u16(),
                        message: truncate(&text, 200),
                    });
                }

                serde_json::from_str(&text).map_err(|e| FeedError::InvalidPayload {
                    source_name: SourceKind::Espn.as_str().to_string(),
                    message: format!("invalid scoreboard JSON: {e}"),
                })
            })
            .await
    }

    fn parse_scoreboard(&self, root: &Value) -> Vec<Game> {
        let Some(events) = pick_array(root, &["events"]) else {
            return Vec::new();
        };

        let mut games = Vec::with_capacity(events.len());
        for event in events {
            match parse_event(event) {
                Some(game) => games.push(game),
                None => {
                    warn!(
                        source = "espn",
                        event_id = pick_str(event, &["id"]).unwrap_or("?"),
                        "skipping unparseable scoreboard event"
                    );
                }
            }
        }
        games
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    }
}

fn parse_event(event: &Value) -> Option<Game> {
    let id = pick_str(event, &["id"])?;
    let competition = pick_array(event, &["competitions"])?.first()?;
    let competitors = pick_array(competition, &["competitors"])?;

    let mut home_team = None;
    let mut away_team = None;
    let mut home_score = 0u32;
    let mut away_score = 0u32;
    for competitor in competitors {
        let abbrev = competitor
            .get("team")
            .and_then(|t| pick_str(t, &["abbreviation", "shortDisplayName"]))?
            .to_string();
        let score = pick_u64(competitor, &["score"]).unwrap_or(0) as u32;
        match pick_str(competitor, &["homeAway"]) {
            Some("home") => {
                home_team = Some(abbrev);
                home_score = score;
            }
            _ => {
                away_team = Some(abbrev);
                away_score = score;
            }
        }
    }

    let status_node = pick(competition, &["status"])?;
    let state = status_node
        .get("type")
        .and_then(|t| pick_str(t, &["state", "name"]))
        .unwrap_or("pre");
    let status = GameStatus::from_str(state).unwrap_or(GameStatus::Scheduled);

    let kickoff = pick_str(event, &["date"])
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let week = event
        .get("week")
        .and_then(|w| pick_u64(w, &["number"]))
        .unwrap_or(0) as u8;
    let season = event
        .get("season")
        .and_then(|s| pick_u64(s, &["year"]))
        .unwrap_or(crate::domain::DEFAULT_SEASON as u64) as u16;

    Some(Game {
        id: format!("espn:{id}"),
        home_team: home_team?,
        away_team: away_team?,
        kickoff,
        week,
        season,
        status,
        home_score,
        away_score,
        quarter: pick_u64(status_node, &["period"]).unwrap_or(0) as u8,
        time_remaining: pick_str(status_node, &["displayClock"]).unwrap_or("").to_string(),
        last_updated: Utc::now(),
    })
}

#[async_trait]
impl SourceClient for EspnClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Espn
    }

    fn circuit_state(&self) -> CircuitState {
        self.inner.circuit_state()
    }

    fn reset_circuit_breaker(&self) {
        self.inner.reset_circuit_breaker();
    }

    fn health(&self) -> SourceHealth {
        self.inner.health()
    }

    async fn current_week(&self, _season: u16) -> Result<u8> {
        let root = self.get_json("current_week", "/scoreboard", &[]).await?;
        root.get("week")
            .and_then(|w| pick_u64(w, &["number"]))
            .map(|w| w as u8)
            .ok_or_else(|| FeedError::InvalidPayload {
                source_name: self.name(),
                message: "scoreboard response missing week.number".to_string(),
            })
    }

    async fn games_by_week(&self, week: u8, season: u16) -> Result<Vec<Game>> {
        let root = self
            .get_json(
                "games_by_week",
                "/scoreboard",
                &[("week", week.to_string()), ("dates", season.to_string())],
            )
            .await?;
        Ok(self.parse_scoreboard(&root))
    }

    async fn live_games(&self) -> Result<Vec<Game>> {
        let root = self.get_json("live_games", "/scoreboard", &[]).await?;
        Ok(self
            .parse_scoreboard(&root)
            .into_iter()
            .filter(Game::is_live)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, state: &str, home_score: &str) -> Value {
        json!({
            "id": id,
            "date": "2025-10-12T17:00:00Z",
            "week": {"number": 6},
            "season": {"year": 2025},
            "competitions": [{
                "competitors": [
                    {"homeAway": "home", "score": home_score, "team": {"abbreviation": "KC"}},
                    {"homeAway": "away", "score": "14", "team": {"abbreviation": "BUF"}}
                ],
                "status": {"period": 3, "displayClock": "8:42", "type": {"state": state}}
            }]
        })
    }

    #[test]
    fn parses_scoreboard_event() {
        let game = parse_event(&event("401", "in", "21")).unwrap();
        assert_eq!(game.id, "espn:401");
        assert_eq!(game.home_team, "KC");
        assert_eq!(game.away_team, "BUF");
        assert_eq!(game.home_score, 21);
        assert_eq!(game.away_score, 14);
        assert_eq!(game.status, GameStatus::InProgress);
        assert_eq!(game.quarter, 3);
        assert_eq!(game.time_remaining, "8:42");
        assert_eq!(game.week, 6);
    }

    #[test]
    fn unknown_status_defaults_to_scheduled() {
        let game = parse_event(&event("401", "mystery", "0")).unwrap();
        assert_eq!(game.status, GameStatus::Scheduled);
    }

    #[test]
    fn event_without_competitors_is_skipped() {
        let broken = json!({"id": "401", "competitions": [{}]});
        assert!(parse_event(&broken).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // A multi-byte char straddling the limit must not split mid-char.
        let body = format!("{}é tail", "x".repeat(199));
        let cut = truncate(&body, 200);
        assert_eq!(cut.chars().count(), 203); // 200 chars + "..."
        assert!(cut.ends_with("é..."));

        assert_eq!(truncate("short", 200), "short");
    }
}
