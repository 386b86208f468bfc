use super::sex::SexCounts;
use serde::{Deserialize, Serialize};

/// Per-player outcome of one rated match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRatingChange {
    pub player_id: i64,
    pub mu_before: f64,
    pub mu_after: f64,
    pub delta: f64,
    pub sigma_before: f64,
    pub sigma_after: f64,
    /// Win probability of this player's side before the match.
    pub win_prob_pre: f64
}

/// Outcome of one match for a doubles pair. Emitted for every pair
/// appearance so the pair history stays complete; `activated` marks whether
/// the synergy value was allowed to move.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairUpdate {
    pub pair_key: String,
    pub players: Vec<i64>,
    pub gamma_before: f64,
    pub gamma_after: f64,
    pub delta: f64,
    pub matches: u32,
    pub activated: bool
}

/// Signal handed to the sex-offset controller. The engine only counts; the
/// controller decides eligibility and applies the update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SexOffsetSignal {
    pub surprise: f64,
    pub counts_a: SexCounts,
    pub counts_b: SexCounts
}

/// Full result contract of the match engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRatingResult {
    pub per_player: Vec<PlayerRatingChange>,
    pub pair_updates: Vec<PairUpdate>,
    pub team_delta: f64,
    pub win_probability: f64,
    pub mov_weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex_offset: Option<SexOffsetSignal>
}
