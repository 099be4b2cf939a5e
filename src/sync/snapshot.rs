//! Checksummed snapshots and field-level diffs.
//!
//! Change detection compares checksums first (cheap negative) and only walks
//! fields when they differ. Numeric fantasy points move through a minimum
//! delta so scoring-formula jitter does not spam change events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::{Game, PlayerStatLine};

/// Smallest fantasy-point move treated as a real change
pub const MIN_POINTS_DELTA: Decimal = dec!(0.1);

/// One field's before/after pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: serde_json::Value,
    pub to: serde_json::Value,
}

pub type FieldDiff = BTreeMap<String, FieldChange>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    GameState,
    PlayerStats,
}

/// Emitted on the broadcast channel whenever a watched entity changes.
///
/// Carries the full before/after state alongside the field diff, so a
/// consumer that missed earlier events can reconstruct the entity without
/// replaying history. `previous` is absent for the first observation.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub entity_id: String,
    pub category: ChangeCategory,
    pub field_diff: FieldDiff,
    pub previous: Option<serde_json::Value>,
    pub current: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

fn checksum(fields: &serde_json::Value) -> String {
    // BTreeMap-backed serialization keeps field order stable.
    let canonical = serde_json::to_string(fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Change-relevant projection of a game, with its checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game_id: String,
    pub checksum: String,
    fields: BTreeMap<String, serde_json::Value>,
    pub taken_at: DateTime<Utc>,
}

impl GameSnapshot {
    pub fn of(game: &Game) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("status".to_string(), serde_json::json!(game.status.as_str()));
        fields.insert("home_score".to_string(), serde_json::json!(game.home_score));
        fields.insert("away_score".to_string(), serde_json::json!(game.away_score));
        fields.insert("quarter".to_string(), serde_json::json!(game.quarter));
        fields.insert(
            "time_remaining".to_string(),
            serde_json::json!(game.time_remaining),
        );

        let checksum = checksum(&serde_json::json!(fields));
        Self {
            game_id: game.id.clone(),
            checksum,
            fields,
            taken_at: Utc::now(),
        }
    }

    /// Fields that differ from `previous`. Empty when checksums match.
    pub fn diff(&self, previous: &GameSnapshot) -> FieldDiff {
        if self.checksum == previous.checksum {
            return FieldDiff::new();
        }
        diff_fields(&previous.fields, &self.fields)
    }

    /// The snapshot's state as a JSON object, for event payloads.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!(self.fields)
    }
}

/// Change-relevant projection of a player stat line, with its checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStatsSnapshot {
    pub player_id: String,
    pub checksum: String,
    fields: BTreeMap<String, serde_json::Value>,
    fantasy_points: Decimal,
    pub taken_at: DateTime<Utc>,
}

impl PlayerStatsSnapshot {
    pub fn of(line: &PlayerStatLine) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "passing_yards".to_string(),
            serde_json::json!(line.passing_yards),
        );
        fields.insert("passing_tds".to_string(), serde_json::json!(line.passing_tds));
        fields.insert(
            "interceptions".to_string(),
            serde_json::json!(line.interceptions),
        );
        fields.insert(
            "rushing_yards".to_string(),
            serde_json::json!(line.rushing_yards),
        );
        fields.insert("rushing_tds".to_string(), serde_json::json!(line.rushing_tds));
        fields.insert(
            "receiving_yards".to_string(),
            serde_json::json!(line.receiving_yards),
        );
        fields.insert(
            "receiving_tds".to_string(),
            serde_json::json!(line.receiving_tds),
        );
        fields.insert("receptions".to_string(), serde_json::json!(line.receptions));

        // Fantasy points join the checksum only at threshold granularity, so
        // sub-threshold recomputation noise leaves the checksum unchanged.
        let quantized = (line.fantasy_points / MIN_POINTS_DELTA).floor();
        fields.insert("fantasy_points".to_string(), serde_json::json!(quantized));

        let checksum = checksum(&serde_json::json!(fields));
        Self {
            player_id: line.player_id.clone(),
            checksum,
            fields,
            fantasy_points: line.fantasy_points,
            taken_at: Utc::now(),
        }
    }

    pub fn diff(&self, previous: &PlayerStatsSnapshot) -> FieldDiff {
        if self.checksum == previous.checksum {
            return FieldDiff::new();
        }
        let mut diff = diff_fields(&previous.fields, &self.fields);
        // Surface raw point values in the event, not the quantized buckets.
        if diff.contains_key("fantasy_points") {
            diff.insert(
                "fantasy_points".to_string(),
                FieldChange {
                    from: serde_json::json!(previous.fantasy_points),
                    to: serde_json::json!(self.fantasy_points),
                },
            );
        }
        diff
    }

    /// The snapshot's state as a JSON object, with raw fantasy points
    /// rather than the quantized checksum buckets.
    pub fn payload(&self) -> serde_json::Value {
        let mut fields = self.fields.clone();
        fields.insert(
            "fantasy_points".to_string(),
            serde_json::json!(self.fantasy_points),
        );
        serde_json::json!(fields)
    }
}

fn diff_fields(
    previous: &BTreeMap<String, serde_json::Value>,
    current: &BTreeMap<String, serde_json::Value>,
) -> FieldDiff {
    let mut diff = FieldDiff::new();
    for (key, new_value) in current {
        match previous.get(key) {
            Some(old_value) if old_value == new_value => {}
            Some(old_value) => {
                diff.insert(
                    key.clone(),
                    FieldChange {
                        from: old_value.clone(),
                        to: new_value.clone(),
                    },
                );
            }
            None => {
                diff.insert(
                    key.clone(),
                    FieldChange {
                        from: serde_json::Value::Null,
                        to: new_value.clone(),
                    },
                );
            }
        }
    }
    diff
}

impl ChangeEvent {
    pub fn new(
        entity_id: String,
        category: ChangeCategory,
        field_diff: FieldDiff,
        previous: Option<serde_json::Value>,
        current: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_id,
            category,
            field_diff,
            previous,
            current,
            detected_at: Utc::now(),
        }
    }
}
