//! NFL official feed client.
//!
//! Lowest-latency scores during live windows, plus the league injury report.
//! No stat lines or projections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::str::FromStr;

use super::json::{pick_array, pick_str, pick_u64};
use super::{ResilientSource, ResilientSourceConfig, SourceClient, SourceHealth, SourceKind};
use crate::domain::{Game, GameStatus, InjuryDesignation, InjuryReport};
use crate::error::{FeedError, Result};
use crate::resilience::CircuitState;

const DEFAULT_NFL_API_BASE: &str = "https://api.nfl.com/v1";

pub struct NflOfficialClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    inner: ResilientSource,
}

impl NflOfficialClient {
    pub fn new(
        base_url: Option<&str>,
        api_key: Option<String>,
        config: ResilientSourceConfig,
    ) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_NFL_API_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("gridfeed/0.1")
            .build()
            .map_err(|e| {
                FeedError::Internal(format!("failed to build NFL HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            base_url,
            api_key,
            inner: ResilientSource::new(SourceKind::NflOfficial.as_str(), config),
        })
    }

    async fn get_json(&self, operation: &str, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        self.inner
            .execute(operation, || async {
                let mut req = self.http.get(&url).query(query);
                if let Some(key) = &self.api_key {
                    req = req.bearer_auth(key);
                }
                let resp = req.send().await?;
                let status = resp.status();
                let text = resp.text().await?;

                if !status.is_success() {
                    return Err(FeedError::Upstream {
                        source_name: SourceKind::NflOfficial.as_str().to_string(),
                        status: status.as_u16(),
                        message: text.chars().take(200).collect(),
                    });
                }

                serde_json::from_str(&text).map_err(|e| FeedError::InvalidPayload {
                    source_name: SourceKind::NflOfficial.as_str().to_string(),
                    message: format!("invalid JSON from {path}: {e}"),
                })
            })
            .await
    }
}

fn parse_game(node: &Value) -> Option<Game> {
    let id = pick_str(node, &["id", "gameId"])?;
    let status = pick_str(node, &["phase", "status"])
        .and_then(|s| GameStatus::from_str(s).ok())
        .unwrap_or(GameStatus::Scheduled);

    Some(Game {
        id: format!("nfl:{id}"),
        home_team: node
            .get("homeTeam")
            .and_then(|t| pick_str(t, &["abbreviation", "abbr"]))?
            .to_string(),
        away_team: node
            .get("awayTeam")
            .and_then(|t| pick_str(t, &["abbreviation", "abbr"]))?
            .to_string(),
        kickoff: pick_str(node, &["gameTime", "time"])
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        week: pick_u64(node, &["week"]).unwrap_or(0) as u8,
        season: pick_u64(node, &["season"]).unwrap_or(crate::domain::DEFAULT_SEASON as u64) as u16,
        status,
        home_score: node
            .get("homeTeam")
            .and_then(|t| pick_u64(t, &["score", "points"]))
            .unwrap_or(0) as u32,
        away_score: node
            .get("awayTeam")
            .and_then(|t| pick_u64(t, &["score", "points"]))
            .unwrap_or(0) as u32,
        quarter: pick_u64(node, &["quarter", "period"]).unwrap_or(0) as u8,
        time_remaining: pick_str(node, &["gameClock", "clock"]).unwrap_or("").to_string(),
        last_updated: Utc::now(),
    })
}

fn parse_designation(raw: &str) -> InjuryDesignation {
    match raw.trim().to_ascii_lowercase().as_str() {
        "probable" => InjuryDesignation::Probable,
        "doubtful" => InjuryDesignation::Doubtful,
        "out" => InjuryDesignation::Out,
        "ir" | "injured_reserve" | "injured reserve" => InjuryDesignation::InjuredReserve,
        _ => InjuryDesignation::Questionable,
    }
}

fn parse_injury(node: &Value) -> Option<InjuryReport> {
    Some(InjuryReport {
        player_id: pick_str(node, &["playerId", "id"])?.to_string(),
        player_name: pick_str(node, &["playerName", "name"]).unwrap_or("").to_string(),
        team: pick_str(node, &["team", "teamAbbr"]).unwrap_or("").to_string(),
        designation: parse_designation(pick_str(node, &["status", "designation"])?),
        description: pick_str(node, &["injury", "description"]).unwrap_or("").to_string(),
        reported_at: pick_str(node, &["updated", "reportedAt"])
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl SourceClient for NflOfficialClient {
    fn kind(&self) -> SourceKind {
        SourceKind::NflOfficial
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

    async fn games_by_week(&self, week: u8, season: u16) -> Result<Vec<Game>> {
        let root = self
            .get_json(
                "games_by_week",
                "/games",
                &[
                    ("season", season.to_string()),
                    ("week", week.to_string()),
                ],
            )
            .await?;
        let nodes = pick_array(&root, &["games", "data"]).ok_or_else(|| {
            FeedError::InvalidPayload {
                source_name: self.name(),
                message: "games response missing games array".to_string(),
            }
        })?;
        Ok(nodes.iter().filter_map(parse_game).collect())
    }

    async fn live_games(&self) -> Result<Vec<Game>> {
        let root = self
            .get_json("live_games", "/games", &[("live", "true".to_string())])
            .await?;
        let nodes = pick_array(&root, &["games", "data"]).ok_or_else(|| {
            FeedError::InvalidPayload {
                source_name: self.name(),
                message: "live games response missing games array".to_string(),
            }
        })?;
        Ok(nodes
            .iter()
            .filter_map(parse_game)
            .filter(Game::is_live)
            .collect())
    }

    async fn injury_reports(&self) -> Result<Vec<InjuryReport>> {
        let root = self.get_json("injury_reports", "/injuries", &[]).await?;
        let nodes = pick_array(&root, &["injuries", "data"]).ok_or_else(|| {
            FeedError::InvalidPayload {
                source_name: self.name(),
                message: "injuries response missing injuries array".to_string(),
            }
        })?;
        Ok(nodes.iter().filter_map(parse_injury).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_live_game_node() {
        let node = json!({
            "id": "2025101205",
            "phase": "live",
            "week": 6,
            "season": 2025,
            "quarter": 4,
            "gameClock": "2:00",
            "gameTime": "2025-10-12T17:00:00Z",
            "homeTeam": {"abbreviation": "DAL", "score": 24},
            "awayTeam": {"abbreviation": "PHI", "score": 28}
        });
        let game = parse_game(&node).unwrap();
        assert_eq!(game.id, "nfl:2025101205");
        assert!(game.is_live());
        assert_eq!(game.away_score, 28);
        assert_eq!(game.quarter, 4);
    }

    #[test]
    fn designations_map_with_questionable_default() {
        assert_eq!(parse_designation("OUT"), InjuryDesignation::Out);
        assert_eq!(parse_designation("IR"), InjuryDesignation::InjuredReserve);
        assert_eq!(parse_designation("???"), InjuryDesignation::Questionable);
    }

    #[test]
    fn parses_injury_entry() {
        let node = json!({
            "playerId": "p42",
            "playerName": "A. Player",
            "team": "DAL",
            "status": "Doubtful",
            "injury": "hamstring",
            "updated": "2025-10-10T12:00:00Z"
        });
        let report = parse_injury(&node).unwrap();
        assert_eq!(report.designation, InjuryDesignation::Doubtful);
        assert_eq!(report.description, "hamstring");
    }
}
