//! Upstream source clients.
//!
//! Each concrete client normalizes one vendor's payloads into the shared
//! domain types and funnels every network call through its own
//! [`ResilientSource`] (circuit breaker + rate limiter + retry).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{FantasyProjection, Game, InjuryReport, PlayerStatLine};
use crate::error::{FeedError, Result};
use crate::resilience::CircuitState;

pub mod espn;
pub mod fantasy_data;
pub mod nfl_official;
pub mod resilient;
pub mod sportsdata;

pub use espn::EspnClient;
pub use fantasy_data::FantasyDataClient;
pub use nfl_official::NflOfficialClient;
pub use resilient::{
    ResilientSource, ResilientSourceConfig, SourceEvent, SourceHealth, SourceMetricsSnapshot,
};
pub use sportsdata::SportsDataClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Espn,
    SportsData,
    NflOfficial,
    FantasyData,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Espn => "espn",
            Self::SportsData => "sportsdata",
            Self::NflOfficial => "nfl_official",
            Self::FantasyData => "fantasydata",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "espn" => Ok(Self::Espn),
            "sportsdata" | "sports_data" | "sportsio" => Ok(Self::SportsData),
            "nfl_official" | "nfl" => Ok(Self::NflOfficial),
            "fantasydata" | "fantasy_data" => Ok(Self::FantasyData),
            _ => Err("invalid source; expected espn|sportsdata|nfl_official|fantasydata"),
        }
    }
}

fn unsupported(operation: &str, source: SourceKind) -> FeedError {
    FeedError::Unsupported(format!(
        "{} is not implemented for source '{}'",
        operation,
        source.as_str()
    ))
}

/// One upstream data source.
///
/// Operations default to `Unsupported` so each vendor implements only what it
/// actually serves; the orchestrator treats `Unsupported` as a per-source
/// failure and moves on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Registry key. Distinct from `kind` so tests can register several
    /// doubles of the same kind.
    fn name(&self) -> String {
        self.kind().as_str().to_string()
    }

    fn circuit_state(&self) -> CircuitState;

    fn reset_circuit_breaker(&self);

    fn health(&self) -> SourceHealth;

    async fn current_week(&self, _season: u16) -> Result<u8> {
        Err(unsupported("current_week", self.kind()))
    }

    async fn games_by_week(&self, _week: u8, _season: u16) -> Result<Vec<Game>> {
        Err(unsupported("games_by_week", self.kind()))
    }

    async fn live_games(&self) -> Result<Vec<Game>> {
        Err(unsupported("live_games", self.kind()))
    }

    async fn player_stats(
        &self,
        _player_id: &str,
        _week: u8,
        _season: u16,
    ) -> Result<Option<PlayerStatLine>> {
        Err(unsupported("player_stats", self.kind()))
    }

    async fn fantasy_projections(&self, _week: u8, _season: u16) -> Result<Vec<FantasyProjection>> {
        Err(unsupported("fantasy_projections", self.kind()))
    }

    async fn injury_reports(&self) -> Result<Vec<InjuryReport>> {
        Err(unsupported("injury_reports", self.kind()))
    }
}

// Defensive accessors for loosely-shaped vendor JSON. Vendors rename and
// re-nest fields between API revisions; these keep the mapping glue flat.
pub(crate) mod json {
    use serde_json::Value;

    pub fn pick<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|key| root.get(*key))
    }

    pub fn pick_str<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a str> {
        pick(root, keys).and_then(|v| v.as_str())
    }

    pub fn pick_u64(root: &Value, keys: &[&str]) -> Option<u64> {
        pick(root, keys).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
    }

    pub fn pick_i64(root: &Value, keys: &[&str]) -> Option<i64> {
        pick(root, keys).and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
    }

    pub fn pick_f64(root: &Value, keys: &[&str]) -> Option<f64> {
        pick(root, keys).and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
    }

    pub fn pick_array<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a [Value]> {
        keys.iter()
            .find_map(|key| root.get(*key).and_then(|v| v.as_array()).map(Vec::as_slice))
    }
}
