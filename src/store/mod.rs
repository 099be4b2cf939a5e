//! PostgreSQL persistence.
//!
//! Backs the store tier of the fallback chains and receives write-through
//! from the sync loop, so the last successfully fetched state survives
//! restarts and upstream outages.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{info, instrument};

use crate::domain::{Game, GameStatus, PlayerStatLine};
use crate::error::Result;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== Games ====================

    #[instrument(skip(self, game), fields(game_id = %game.id))]
    pub async fn upsert_game(&self, game: &Game) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO games (
                id, home_team, away_team, kickoff, week, season, status,
                home_score, away_score, quarter, time_remaining, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                home_score = EXCLUDED.home_score,
                away_score = EXCLUDED.away_score,
                quarter = EXCLUDED.quarter,
                time_remaining = EXCLUDED.time_remaining,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&game.id)
        .bind(&game.home_team)
        .bind(&game.away_team)
        .bind(game.kickoff)
        .bind(game.week as i16)
        .bind(game.season as i16)
        .bind(game.status.as_str())
        .bind(game.home_score as i32)
        .bind(game.away_score as i32)
        .bind(game.quarter as i16)
        .bind(&game.time_remaining)
        .bind(game.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn games_for_week(&self, week: u8, season: u16) -> Result<Vec<Game>> {
        let rows = sqlx::query(
            r#"
            SELECT id, home_team, away_team, kickoff, week, season, status,
                   home_score, away_score, quarter, time_remaining, last_updated
            FROM games
            WHERE season = $1 AND week = $2
            ORDER BY kickoff
            "#,
        )
        .bind(season as i16)
        .bind(week as i16)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_game).collect())
    }

    pub async fn live_games(&self) -> Result<Vec<Game>> {
        let rows = sqlx::query(
            r#"
            SELECT id, home_team, away_team, kickoff, week, season, status,
                   home_score, away_score, quarter, time_remaining, last_updated
            FROM games
            WHERE status IN ('in_progress', 'halftime')
            ORDER BY kickoff
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_game).collect())
    }

    // ==================== Player stats ====================

    #[instrument(skip(self, line), fields(player_id = %line.player_id))]
    pub async fn upsert_stat_line(&self, line: &PlayerStatLine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO player_stats (
                player_id, game_id, week, season,
                passing_yards, passing_tds, interceptions,
                rushing_yards, rushing_tds,
                receiving_yards, receiving_tds, receptions,
                fantasy_points, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (player_id, season, week) DO UPDATE SET
                game_id = EXCLUDED.game_id,
                passing_yards = EXCLUDED.passing_yards,
                passing_tds = EXCLUDED.passing_tds,
                interceptions = EXCLUDED.interceptions,
                rushing_yards = EXCLUDED.rushing_yards,
                rushing_tds = EXCLUDED.rushing_tds,
                receiving_yards = EXCLUDED.receiving_yards,
                receiving_tds = EXCLUDED.receiving_tds,
                receptions = EXCLUDED.receptions,
                fantasy_points = EXCLUDED.fantasy_points,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&line.player_id)
        .bind(&line.game_id)
        .bind(line.week as i16)
        .bind(line.season as i16)
        .bind(line.passing_yards)
        .bind(line.passing_tds as i16)
        .bind(line.interceptions as i16)
        .bind(line.rushing_yards)
        .bind(line.rushing_tds as i16)
        .bind(line.receiving_yards)
        .bind(line.receiving_tds as i16)
        .bind(line.receptions as i16)
        .bind(line.fantasy_points)
        .bind(line.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn stat_line(
        &self,
        player_id: &str,
        week: u8,
        season: u16,
    ) -> Result<Option<PlayerStatLine>> {
        let row = sqlx::query(
            r#"
            SELECT player_id, game_id, week, season,
                   passing_yards, passing_tds, interceptions,
                   rushing_yards, rushing_tds,
                   receiving_yards, receiving_tds, receptions,
                   fantasy_points, last_updated
            FROM player_stats
            WHERE player_id = $1 AND season = $2 AND week = $3
            "#,
        )
        .bind(player_id)
        .bind(season as i16)
        .bind(week as i16)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PlayerStatLine {
            player_id: row.get("player_id"),
            game_id: row.get("game_id"),
            week: row.get::<i16, _>("week") as u8,
            season: row.get::<i16, _>("season") as u16,
            passing_yards: row.get("passing_yards"),
            passing_tds: row.get::<i16, _>("passing_tds") as u8,
            interceptions: row.get::<i16, _>("interceptions") as u8,
            rushing_yards: row.get("rushing_yards"),
            rushing_tds: row.get::<i16, _>("rushing_tds") as u8,
            receiving_yards: row.get("receiving_yards"),
            receiving_tds: row.get::<i16, _>("receiving_tds") as u8,
            receptions: row.get::<i16, _>("receptions") as u8,
            fantasy_points: row.get::<Decimal, _>("fantasy_points"),
            last_updated: row.get::<DateTime<Utc>, _>("last_updated"),
        }))
    }

    // ==================== Schedule ====================

    pub async fn record_schedule_week(&self, season: u16, week: u8) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_weeks (season, week, resolved_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (season) DO UPDATE SET
                week = EXCLUDED.week,
                resolved_at = EXCLUDED.resolved_at
            "#,
        )
        .bind(season as i16)
        .bind(week as i16)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The last week we resolved for a season, if any
    pub async fn latest_schedule_week(&self, season: u16) -> Result<Option<u8>> {
        let row = sqlx::query("SELECT week FROM schedule_weeks WHERE season = $1")
            .bind(season as i16)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i16, _>("week") as u8))
    }
}

fn row_to_game(row: &sqlx::postgres::PgRow) -> Game {
    Game {
        id: row.get("id"),
        home_team: row.get("home_team"),
        away_team: row.get("away_team"),
        kickoff: row.get::<DateTime<Utc>, _>("kickoff"),
        week: row.get::<i16, _>("week") as u8,
        season: row.get::<i16, _>("season") as u16,
        status: GameStatus::from_str(row.get::<String, _>("status").as_str())
            .unwrap_or(GameStatus::Scheduled),
        home_score: row.get::<i32, _>("home_score") as u32,
        away_score: row.get::<i32, _>("away_score") as u32,
        quarter: row.get::<i16, _>("quarter") as u8,
        time_remaining: row.get("time_remaining"),
        last_updated: row.get::<DateTime<Utc>, _>("last_updated"),
    }
}
