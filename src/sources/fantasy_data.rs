//! FantasyData client.
//!
//! Fantasy-focused vendor: projections first, stat lines as a backup for the
//! stats chain.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;

use super::json::{pick_f64, pick_str, pick_u64};
use super::{ResilientSource, ResilientSourceConfig, SourceClient, SourceHealth, SourceKind};
use crate::domain::{FantasyProjection, PlayerStatLine};
use crate::error::{FeedError, Result};
use crate::resilience::CircuitState;

const DEFAULT_FANTASYDATA_API_BASE: &str = "https://api.fantasydata.net/v3/nfl";
const API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

pub struct FantasyDataClient {
    http: Client,
    base_url: String,
    api_key: String,
    inner: ResilientSource,
}

impl FantasyDataClient {
    pub fn new(
        base_url: Option<&str>,
        api_key: String,
        config: ResilientSourceConfig,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(FeedError::Internal(
                "fantasydata client requires an API key".to_string(),
            ));
        }

        let base_url = base_url
            .unwrap_or(DEFAULT_FANTASYDATA_API_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("gridfeed/0.1")
            .build()
            .map_err(|e| {
                FeedError::Internal(format!("failed to build fantasydata HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            base_url,
            api_key,
            inner: ResilientSource::new(SourceKind::FantasyData.as_str(), config),
        })
    }

    async fn get_array(&self, operation: &str, path: &str) -> Result<Vec<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let root = self
            .inner
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
                        source_name: SourceKind::FantasyData.as_str().to_string(),
                        status: status.as_u16(),
                        message: text.chars().take(200).collect(),
                    });
                }

                serde_json::from_str::<Value>(&text).map_err(|e| FeedError::InvalidPayload {
                    source_name: SourceKind::FantasyData.as_str().to_string(),
                    message: format!("invalid JSON from {path}: {e}"),
                })
            })
            .await?;

        root.as_array()
            .cloned()
            .ok_or_else(|| FeedError::InvalidPayload {
                source_name: self.name(),
                message: format!("{path} did not return an array"),
            })
    }
}

fn parse_projection(node: &Value, week: u8, season: u16) -> Option<FantasyProjection> {
    let player_id = pick_u64(node, &["PlayerID"])
        .map(|v| v.to_string())
        .or_else(|| pick_str(node, &["PlayerID"]).map(str::to_string))?;
    Some(FantasyProjection {
        player_id,
        week,
        season,
        projected_points: pick_f64(node, &["FantasyPointsPPR", "FantasyPoints", "ProjectedFantasyPoints"])
            .and_then(Decimal::from_f64)?,
    })
}

fn parse_stat_line(node: &Value, week: u8, season: u16) -> Option<PlayerStatLine> {
    let player_id = pick_u64(node, &["PlayerID"]).map(|v| v.to_string())?;
    Some(PlayerStatLine {
        player_id,
        game_id: pick_u64(node, &["GameID"])
            .map(|v| format!("fantasydata:{v}"))
            .unwrap_or_default(),
        week,
        season,
        passing_yards: pick_f64(node, &["PassingYards"]).unwrap_or(0.0) as i32,
        passing_tds: pick_f64(node, &["PassingTouchdowns"]).unwrap_or(0.0) as u8,
        interceptions: pick_f64(node, &["PassingInterceptions", "Interceptions"]).unwrap_or(0.0)
            as u8,
        rushing_yards: pick_f64(node, &["RushingYards"]).unwrap_or(0.0) as i32,
        rushing_tds: pick_f64(node, &["RushingTouchdowns"]).unwrap_or(0.0) as u8,
        receiving_yards: pick_f64(node, &["ReceivingYards"]).unwrap_or(0.0) as i32,
        receiving_tds: pick_f64(node, &["ReceivingTouchdowns"]).unwrap_or(0.0) as u8,
        receptions: pick_f64(node, &["Receptions"]).unwrap_or(0.0) as u8,
        fantasy_points: pick_f64(node, &["FantasyPointsPPR", "FantasyPoints"])
            .and_then(Decimal::from_f64)
            .unwrap_or(Decimal::ZERO),
        last_updated: Utc::now(),
    })
}

#[async_trait]
impl SourceClient for FantasyDataClient {
    fn kind(&self) -> SourceKind {
        SourceKind::FantasyData
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

    async fn player_stats(
        &self,
        player_id: &str,
        week: u8,
        season: u16,
    ) -> Result<Option<PlayerStatLine>> {
        let nodes = self
            .get_array(
                "player_stats",
                &format!("/stats/json/PlayerGameStatsByWeek/{season}/{week}"),
            )
            .await?;
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
        let nodes = self
            .get_array(
                "fantasy_projections",
                &format!("/projections/json/PlayerGameProjectionStatsByWeek/{season}/{week}"),
            )
            .await?;
        Ok(nodes
            .iter()
            .filter_map(|node| parse_projection(node, week, season))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_projection_with_ppr_preference() {
        let node = json!({"PlayerID": 99, "FantasyPoints": 10.0, "FantasyPointsPPR": 12.5});
        let proj = parse_projection(&node, 6, 2025).unwrap();
        assert_eq!(proj.player_id, "99");
        assert_eq!(proj.projected_points.to_string(), "12.5");
    }

    #[test]
    fn projection_without_points_is_dropped() {
        let node = json!({"PlayerID": 99});
        assert!(parse_projection(&node, 6, 2025).is_none());
    }

    #[test]
    fn parses_backup_stat_line() {
        let node = json!({
            "PlayerID": 12,
            "ReceivingYards": 88.0,
            "ReceivingTouchdowns": 1.0,
            "Receptions": 7.0,
            "FantasyPointsPPR": 21.8
        });
        let line = parse_stat_line(&node, 6, 2025).unwrap();
        assert_eq!(line.receptions, 7);
        assert_eq!(line.total_touchdowns(), 1);
    }
}
