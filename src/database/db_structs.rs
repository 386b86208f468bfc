use crate::model::structures::{Discipline, GameScore, MatchTier, RatingStatus, Sex, Side, Sport};
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One rating ladder. Created on first reference, never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Ladder {
    pub ladder_id: String,
    pub sport: Sport,
    pub discipline: Discipline,
    pub default_age_cutoff: Option<NaiveDate>,
    pub age_bands: Option<Value>,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>
}

/// Registry row for a player. Ratings and history reference this by id
/// only; there are no owning links between the stores.
#[derive(Debug, Clone, Serialize)]
pub struct Player {
    pub player_id: i64,
    pub organization_id: i64,
    pub sex: Sex,
    pub region: String
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerRatingRow {
    pub player_id: i64,
    pub ladder_id: String,
    pub mu: f64,
    pub sigma: f64,
    pub matches_count: i32,
    pub updated_at: DateTime<FixedOffset>
}

/// Append-only rating history row, one per (player, match).
#[derive(Debug, Clone, Serialize)]
pub struct RatingEvent {
    pub id: i64,
    pub player_id: i64,
    pub ladder_id: String,
    pub match_id: Uuid,
    pub mu_before: f64,
    pub mu_after: f64,
    pub sigma_before: f64,
    pub sigma_after: f64,
    pub delta: f64,
    pub win_prob_pre: f64,
    pub mov_weight: f64,
    pub created_at: DateTime<FixedOffset>
}

#[derive(Debug, Clone, Serialize)]
pub struct PairSynergyRow {
    pub ladder_id: String,
    pub pair_key: String,
    pub players: Vec<i64>,
    pub gamma: f64,
    pub matches: i32,
    pub updated_at: DateTime<FixedOffset>
}

#[derive(Debug, Clone, Serialize)]
pub struct SexOffsetRow {
    pub ladder_id: String,
    pub sex: Sex,
    pub bias: f64,
    pub matches: i32,
    pub updated_at: DateTime<FixedOffset>
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayQueueEntry {
    pub ladder_id: String,
    pub earliest_start_time: DateTime<FixedOffset>,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>
}

/// Optional timing block stored as JSON on the match row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchTiming {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>
}

/// Canonical stored match.
#[derive(Debug, Clone, Serialize)]
pub struct MatchRow {
    pub match_id: Uuid,
    pub ladder_id: String,
    pub provider_id: String,
    pub external_ref: Option<String>,
    pub organization_id: i64,
    pub sport: Sport,
    pub discipline: Discipline,
    pub format: Option<String>,
    pub tier: Option<MatchTier>,
    pub stage: Option<String>,
    pub start_time: DateTime<FixedOffset>,
    pub timing: Option<MatchTiming>,
    pub raw_payload: Value,
    pub rating_status: RatingStatus,
    pub rating_skip_reason: Option<String>,
    pub winner_side: Option<Side>,
    pub created_at: DateTime<FixedOffset>
}

impl MatchRow {
    /// Event time of the rating change this match produced.
    pub fn applied_at(&self) -> DateTime<FixedOffset> {
        self.timing
            .as_ref()
            .and_then(|t| t.completed_at)
            .unwrap_or(self.start_time)
    }
}

/// A match joined with its sides and games, as streamed during replay.
#[derive(Debug, Clone)]
pub struct StoredMatch {
    pub match_id: Uuid,
    pub start_time: DateTime<FixedOffset>,
    pub completed_at: Option<DateTime<FixedOffset>>,
    pub sport: Sport,
    pub discipline: Discipline,
    pub tier: Option<MatchTier>,
    pub rating_status: RatingStatus,
    pub winner_side: Option<Side>,
    pub raw_payload: Value,
    pub side_a: Vec<(i64, Sex)>,
    pub side_b: Vec<(i64, Sex)>,
    pub games: Vec<GameScore>
}

impl StoredMatch {
    pub fn applied_at(&self) -> DateTime<FixedOffset> {
        self.completed_at.unwrap_or(self.start_time)
    }
}

/// Page of rating events plus the total row count for the query.
#[derive(Debug, Clone, Serialize)]
pub struct RatingEventPage {
    pub events: Vec<RatingEvent>,
    pub total: i64
}

/// Point-in-time rating answer: sex-adjusted μ, raw μ, and the event that
/// produced it.
#[derive(Debug, Clone, Serialize)]
pub struct RatingSnapshot {
    pub mu: f64,
    pub mu_raw: f64,
    pub sigma: f64,
    pub rating_event: RatingEvent
}

/// Current rating of a player with the sex bias applied on read.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerRatingView {
    pub mu: f64,
    pub sigma: f64,
    pub matches: i32,
    pub sex: Sex,
    pub sex_bias: f64
}
