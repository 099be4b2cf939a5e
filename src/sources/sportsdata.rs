//! SportsDataIO client.
//!
//! Keyed vendor with the broadest coverage: schedule, box scores, player
//! stat lines and fantasy projections. PascalCase payloads.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use super::json::{pick_f64, pick_str, pick_u64};
use super::{ResilientSource, ResilientSourceConfig, SourceClient, SourceHealth, SourceKind};
use crate::domain::{FantasyProjection, Game, GameStatus, PlayerStatLine};
use crate::error::{FeedError, Result};
use crate::resilience::CircuitState;

const DEFAULT_SPORTSDATA_API_BASE: &str = "https://api.sportsdata.io/v3/nfl";
const API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

pub struct SportsDataClient {
    http: Client,
    base_url: String,
    api_key: String,
    inner: ResilientSource,
}

impl SportsDataClient {
    pub fn new(
        base_url: Option<&str>,
        api_key: String,
        config: ResilientSourceConfig,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(FeedError::Internal(
                "sportsdata client requires an API key".to_string(),
            ));
        }

        let base_url = base_url
            .unwrap_or(DEFAULT_SPORTSDATA_API_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("gridfeed/0.1")
            .build()
            .map_err(|e| {
                FeedError::Internal(format!("failed to build sportsdata HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            base_url,
            api_key,
            inner: ResilientSource::new(SourceKind::SportsData.as_str(), config),
        })
    }

    async fn get_json(&self, operation: &str, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        self.inner
            .execute(operation, || async {
                let resp = self
                    .http
                    .get(&url)
                    .header(API_KEY_HEADER, &self.api_key)
                    .send()
                    .await?;
                let status = resp.status();
                let text = resp.text().await?;

                if !status.is_success() {
                    return Err(FeedError::Upstream {
                        source_name: SourceKind::SportsData.as_str().to_string(),
                        status: status.as_u16(),
                        message: text.chars().take(200).collect(),
                    });
                }

                serde_json::from_str(&text).map_err(|e| FeedError::InvalidPayload {
                    source_name: SourceKind::SportsData.as_str().to_string(),
                    message: format!("invalid JSON from {path}: {e}"),
                })
            })
            .await
    }
}

fn parse_vendor_datetime(raw: &str) -> Option<DateTime<Utc>> {
    // Vendor timestamps are local-naive, e.g. "2025-10-12T13:00:00"
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn parse_game(node: &Value) -> Option<Game> {
    let id = pick_str(node, &["GameKey", "GameID"])
        .map(str::to_string)
        .or_else(|| pick_u64(node, &["GameID"]).map(|v| v.to_string()))?;

    let status = pick_str(node, &["Status"])
        .and_then(|s| GameStatus::from_str(s).ok())
        .unwrap_or(GameStatus::Scheduled);

    Some(Game {
        id: format!("sportsdata:{id}"),
        home_team: pick_str(node, &["HomeTeam"])?.to_string(),
        away_team: pick_str(node, &["AwayTeam"])?.to_string(),
        kickoff: pick_str(node, &["DateTime", "Day"])
            .and_then(parse_vendor_datetime)
            .unwrap_or_else(Utc::now),
        week: pick_u64(node, &["Week"]).unwrap_or(0) as u8,
        season: pick_u64(node, &["Season"]).unwrap_or(crate::domain::DEFAULT_SEASON as u64) as u16,
        status,
        home_score: pick_u64(node, &["HomeScore"]).unwrap_or(0) as u32,
        away_score: pick_u64(node, &["AwayScore"]).unwrap_or(0) as u32,
        quarter: pick_u64(node, &["Quarter"]).unwrap_or(0) as u8,
        time_remaining: pick_str(node, &["TimeRemaining"]).unwrap_or("").to_string(),
        last_updated: Utc::now(),
    })
}

fn parse_stat_line(node: &Value, week: u8, season: u16) -> Option<PlayerStatLine> {
    let player_id = pick_u64(node, &["PlayerID"]).map(|v| v.to_string())?;
    let fantasy_points = pick_f64(node, &["FantasyPointsPPR", "FantasyPoints"])
        .and_then(Decimal::from_f64)
        .unwrap_or(Decimal::ZERO);

    Some(PlayerStatLine {
        player_id,
        game_id: pick_u64(node, &["GameID"])
            .map(|v| format!("sportsdata:{v}"))
            .unwrap_or_default(),
        week,
        season,
        passing_yards: pick_f64(node, &["PassingYards"]).unwrap_or(0.0) as i32,
        passing_tds: pick_f64(node, &["PassingTouchdowns"]).unwrap_or(0.0) as u8,
        interceptions: pick_f64(node, &["PassingInterceptions"]).unwrap_or(0.0) as u8,
        rushing_yards: pick_f64(node, &["RushingYards"]).unwrap_or(0.0) as i32,
        rushing_tds: pick_f64(node, &["RushingTouchdowns"]).unwrap_or(0.0) as u8,
        receiving_yards: pick_f64(node, &["ReceivingYards"]).unwrap_or(0.0) as i32,
        receiving_tds: pick_f64(node, &["ReceivingTouchdowns"]).unwrap_or(0.0) as u8,
        receptions: pick_f64(node, &["Receptions"]).unwrap_or(0.0) as u8,
        fantasy_points,
        last_updated: Utc::now(),
    })
}

#[async_trait]
impl SourceClient for SportsDataClient {
    fn kind(&self) -> SourceKind {
        SourceKind::SportsData
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
        let root = self
            .get_json("current_week", "/scores/json/CurrentWeek")
            .await?;
        root.as_u64()
            .map(|w| w as u8)
            .ok_or_else(|| FeedError::InvalidPayload {
                source_name: self.name(),
                message: "CurrentWeek did not return a number".to_string(),
            })
    }

    async fn games_by_week(&self, week: u8, season: u16) -> Result<Vec<Game>> {
        let root = self
            .get_json(
                "games_by_week",
                &format!("/scores/json/ScoresByWeek/{season}/{week}"),
            )
            .await?;
        let nodes = root.as_array().ok_or_else(|| FeedError::InvalidPayload {
            source_name: self.name(),
            message: "ScoresByWeek did not return an array".to_string(),
        })?;
        Ok(nodes.iter().filter_map(parse_game).collect())
    }

    async fn live_games(&self) -> Result<Vec<Game>> {
        let season = crate::domain::DEFAULT_SEASON;
        let week = self.current_week(season).await?;
        Ok(self
            .games_by_week(week, season)
            .await?
            .into_iter()
            .filter(Game::is_live)
            .collect())
    }

    async fn player_stats(
        &self,
        player_id: &str,
        week: u8,
        season: u16,
    ) -> Result<Option<PlayerStatLine>> {
        let root = self
            .get_json(
                "player_stats",
                &format!("/stats/json/PlayerGameStatsByWeek/{season}/{week}"),
            )
            .await?;
        let nodes = root.as_array().ok_or_else(|| FeedError::InvalidPayload {
            source_name: self.name(),
            message: "PlayerGameStatsByWeek did not return an array".to_string(),
        })?;

        Ok(nodes
            .iter()
            .find(|node| {
                pick_u64(node, &["PlayerID"])
                    .map(|v| v.to_string() == player_id)
                    .unwrap_or(false)
            })
            .and_then(|node| parse_stat_line(node, week, season)))
    }

    async fn fantasy_projections(&self, week: u8, season: u16) -> Result<Vec<FantasyProjection>> {
        let root = self
            .get_json(
                "fantasy_projections",
                &format!("/projections/json/PlayerGameProjectionStatsByWeek/{season}/{week}"),
            )
            .await?;
        let nodes = root.as_array().ok_or_else(|| FeedError::InvalidPayload {
            source_name: self.name(),
            message: "projections did not return an array".to_string(),
        })?;

        Ok(nodes
            .iter()
            .filter_map(|node| {
                Some(FantasyProjection {
                    player_id: pick_u64(node, &["PlayerID"])?.to_string(),
                    week,
                    season,
                    projected_points: pick_f64(node, &["FantasyPointsPPR", "FantasyPoints"])
                        .and_then(Decimal::from_f64)?,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pascal_case_game() {
        let node = json!({
            "GameKey": "202561012",
            "Season": 2025,
            "Week": 6,
            "HomeTeam": "KC",
            "AwayTeam": "BUF",
            "DateTime": "2025-10-12T13:00:00",
            "Status": "InProgress",
            "Quarter": "2",
            "TimeRemaining": "4:18",
            "HomeScore": 17,
            "AwayScore": 10
        });
        let game = parse_game(&node).unwrap();
        assert_eq!(game.id, "sportsdata:202561012");
        assert_eq!(game.status, GameStatus::InProgress);
        assert_eq!(game.quarter, 2);
        assert_eq!(game.home_score, 17);
    }

    #[test]
    fn parses_stat_line_with_ppr_points() {
        let node = json!({
            "PlayerID": 14876,
            "GameID": 18452,
            "PassingYards": 312.0,
            "PassingTouchdowns": 3.0,
            "PassingInterceptions": 1.0,
            "RushingYards": 24.0,
            "Receptions": 0.0,
            "FantasyPointsPPR": 26.58
        });
        let line = parse_stat_line(&node, 6, 2025).unwrap();
        assert_eq!(line.player_id, "14876");
        assert_eq!(line.passing_yards, 312);
        assert_eq!(line.total_touchdowns(), 3);
        assert_eq!(line.fantasy_points.to_string(), "26.58");
    }

    #[test]
    fn vendor_naive_datetime_parses() {
        let dt = parse_vendor_datetime("2025-10-12T13:00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-10-12T13:00:00+00:00");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let err = SportsDataClient::new(None, "  ".to_string(), ResilientSourceConfig::default());
        assert!(err.is_err());
    }
}
