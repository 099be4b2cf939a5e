//! Core domain types shared across sources, fallback tiers and the sync loop.
//!
//! Every upstream normalizes into these structs; field-mapping differences
//! stay inside the source clients.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default season when the caller does not specify one
pub const DEFAULT_SEASON: u16 = 2025;

/// Regular-season week bounds
pub const FIRST_WEEK: u8 = 1;
pub const LAST_WEEK: u8 = 18;

/// Game lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Halftime,
    Final,
    Postponed,
    Canceled,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Halftime => "halftime",
            Self::Final => "final",
            Self::Postponed => "postponed",
            Self::Canceled => "canceled",
        }
    }

    /// Statuses the live pollers care about
    pub fn is_live(&self) -> bool {
        matches!(self, Self::InProgress | Self::Halftime)
    }
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GameStatus {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scheduled" | "pre" | "pregame" => Ok(Self::Scheduled),
            "in_progress" | "in" | "live" | "inprogress" => Ok(Self::InProgress),
            "halftime" | "half" => Ok(Self::Halftime),
            "final" | "post" | "closed" | "f" => Ok(Self::Final),
            "postponed" => Ok(Self::Postponed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err("unrecognized game status"),
        }
    }
}

/// A single NFL game, normalized across sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    /// Stable identifier, prefixed by the originating source when upstream
    /// ids collide (e.g. "espn:401547417")
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub kickoff: DateTime<Utc>,
    pub week: u8,
    pub season: u16,
    pub status: GameStatus,
    pub home_score: u32,
    pub away_score: u32,
    /// 1-4, 5 for overtime
    pub quarter: u8,
    /// Display clock, e.g. "12:34"
    pub time_remaining: String,
    pub last_updated: DateTime<Utc>,
}

impl Game {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// One player's accumulated stat line for a week
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStatLine {
    pub player_id: String,
    pub game_id: String,
    pub week: u8,
    pub season: u16,
    pub passing_yards: i32,
    pub passing_tds: u8,
    pub interceptions: u8,
    pub rushing_yards: i32,
    pub rushing_tds: u8,
    pub receiving_yards: i32,
    pub receiving_tds: u8,
    pub receptions: u8,
    /// Derived scalar recomputed upstream on every poll; compared with a
    /// minimum-delta threshold, never raw equality
    pub fantasy_points: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl PlayerStatLine {
    /// Zeroed stat line, used by the synthesized-default tier
    pub fn empty(player_id: &str, week: u8, season: u16) -> Self {
        Self {
            player_id: player_id.to_string(),
            game_id: String::new(),
            week,
            season,
            passing_yards: 0,
            passing_tds: 0,
            interceptions: 0,
            rushing_yards: 0,
            rushing_tds: 0,
            receiving_yards: 0,
            receiving_tds: 0,
            receptions: 0,
            fantasy_points: Decimal::ZERO,
            last_updated: Utc::now(),
        }
    }

    pub fn total_touchdowns(&self) -> u8 {
        self.passing_tds + self.rushing_tds + self.receiving_tds
    }
}

/// Injury designation severity, most severe last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjuryDesignation {
    Probable,
    Questionable,
    Doubtful,
    Out,
    InjuredReserve,
}

/// Injury report entry, merged across sources by player
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjuryReport {
    pub player_id: String,
    pub player_name: String,
    pub team: String,
    pub designation: InjuryDesignation,
    pub description: String,
    pub reported_at: DateTime<Utc>,
}

/// Weekly fantasy projection for a player
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FantasyProjection {
    pub player_id: String,
    pub week: u8,
    pub season: u16,
    pub projected_points: Decimal,
}
