use crate::model::{
    constants::Params,
    engine::rate_match,
    ladder_tracker::LadderTracker,
    sex_offset::{offsets_eligible, OffsetState},
    structures::{MatchInput, SexOffsetSignal}
};
use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// One stored match, reconstructed for chronological re-processing.
#[derive(Debug, Clone)]
pub struct ReplayMatch {
    pub match_id: Uuid,
    pub start_time: DateTime<FixedOffset>,
    /// Event time of the rating change: `completed_at ?? start_time`.
    pub applied_at: DateTime<FixedOffset>,
    pub input: MatchInput
}

/// History row produced for each participant of each replayed match.
#[derive(Debug, Clone)]
pub struct PlayerHistoryRow {
    pub player_id: i64,
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

/// History row produced for each pair appearance of each replayed match.
#[derive(Debug, Clone)]
pub struct PairHistoryRow {
    pub pair_key: String,
    pub match_id: Uuid,
    pub gamma_before: f64,
    pub gamma_after: f64,
    pub delta: f64,
    pub created_at: DateTime<FixedOffset>
}

/// Everything a finished replay wants to persist.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub tracker: LadderTracker,
    pub offsets: OffsetState,
    pub player_history: Vec<PlayerHistoryRow>,
    pub pair_history: Vec<PairHistoryRow>,
    pub matches_processed: usize
}

/// Summary returned to the caller of a replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub ladder_id: String,
    pub matches_processed: usize,
    pub players_touched: usize,
    pub pair_updates: usize,
    pub replay_from: Option<DateTime<FixedOffset>>,
    pub replay_to: Option<DateTime<FixedOffset>>,
    pub dry_run: bool
}

/// A match counts as an inter-sex edge when the two sides field different
/// sex compositions. Only such matches inform the offset estimator.
pub fn is_inter_sex(signal: &SexOffsetSignal) -> bool {
    signal.counts_a != signal.counts_b
}

/// Replay Executor core
///
/// Re-runs a ladder's matches from priors, in the exact `(start_time,
/// match_id)` order the caller streamed them in. All state lives in memory;
/// the database wrapper truncates and rewrites the derived tables from the
/// returned outcome.
///
/// Determinism is the contract here: the same match stream must always
/// produce bit-identical μ, σ, γ and biases, which is why the offset
/// eligibility window is reconstructed from the stream itself rather than
/// read from any wall clock.
pub fn run_replay(ladder_id: &str, matches: &[ReplayMatch], params: &Params) -> ReplayOutcome {
    let mut tracker = LadderTracker::new(ladder_id);
    let mut offsets = OffsetState::default();

    let mut player_history = Vec::new();
    let mut pair_history = Vec::new();

    // Rolling 90-day window of inter-sex appearances, for the eligibility
    // gate as it would have evaluated at each point in time.
    let mut edge_window: VecDeque<DateTime<FixedOffset>> = VecDeque::new();

    for replay_match in matches {
        for player_id in replay_match.input.all_player_ids() {
            tracker.ensure_player(player_id, &params.rating);
        }
        for side in [&replay_match.input.side_a, &replay_match.input.side_b] {
            if side.is_pair() {
                tracker.ensure_pair(&side.player_ids());
            }
        }

        let result = rate_match(&replay_match.input, &mut tracker, params);

        for change in &result.per_player {
            let state = tracker
                .player_mut(change.player_id)
                .unwrap_or_else(|| panic!("Player {}: state vanished during replay", change.player_id));
            state.updated_at = Some(replay_match.applied_at);

            player_history.push(PlayerHistoryRow {
                player_id: change.player_id,
                match_id: replay_match.match_id,
                mu_before: change.mu_before,
                mu_after: change.mu_after,
                sigma_before: change.sigma_before,
                sigma_after: change.sigma_after,
                delta: change.delta,
                win_prob_pre: change.win_prob_pre,
                mov_weight: result.mov_weight,
                created_at: replay_match.applied_at
            });
        }

        for update in &result.pair_updates {
            if let Some(pair) = tracker.pair_mut(&update.pair_key) {
                pair.updated_at = Some(replay_match.applied_at);
            }
            pair_history.push(PairHistoryRow {
                pair_key: update.pair_key.clone(),
                match_id: replay_match.match_id,
                gamma_before: update.gamma_before,
                gamma_after: update.gamma_after,
                delta: update.delta,
                created_at: replay_match.applied_at
            });
        }

        if let Some(signal) = result.sex_offset {
            let horizon = replay_match.start_time - Duration::days(90);
            while edge_window.front().is_some_and(|&t| t < horizon) {
                edge_window.pop_front();
            }

            let edges = edge_window.len() as u32;
            if offsets_eligible(edges, &offsets, &params.sex_offsets) {
                offsets.apply_signal(&signal, &params.sex_offsets);
                offsets.updated_at = Some(replay_match.applied_at);
            }

            if is_inter_sex(&signal) {
                edge_window.push_back(replay_match.start_time);
            }
        }
    }

    ReplayOutcome {
        matches_processed: matches.len(),
        tracker,
        offsets,
        player_history,
        pair_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::structures::{Discipline, GameScore, Sex, SideInput, SidePlayer, Sport};
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Utc};

    fn side(players: &[(i64, Sex)]) -> SideInput {
        SideInput {
            players: players
                .iter()
                .map(|&(player_id, sex)| SidePlayer { player_id, sex })
                .collect()
        }
    }

    fn at(hours: i64) -> DateTime<FixedOffset> {
        (Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::hours(hours)).fixed_offset()
    }

    fn singles(seq: u128, hours: i64, a: i64, b: i64, score_a: i32, score_b: i32) -> ReplayMatch {
        ReplayMatch {
            match_id: Uuid::from_u128(seq),
            start_time: at(hours),
            applied_at: at(hours),
            input: MatchInput {
                sport: Sport::Squash,
                discipline: Discipline::Singles,
                format: None,
                tier: None,
                side_a: side(&[(a, Sex::Male)]),
                side_b: side(&[(b, Sex::Male)]),
                games: vec![GameScore {
                    game_no: 1,
                    score_a,
                    score_b
                }],
                mov_weight: None,
                winner: None
            }
        }
    }

    #[test]
    fn test_replay_is_deterministic() {
        let params = Params::default();
        let matches = vec![
            singles(1, 0, 1, 2, 11, 7),
            singles(2, 1, 2, 3, 11, 9),
            singles(3, 2, 1, 3, 6, 11),
            singles(4, 3, 2, 1, 11, 4),
        ];

        let first = run_replay("squash:singles", &matches, &params);
        let second = run_replay("squash:singles", &matches, &params);

        for player in first.tracker.players() {
            let other = second.tracker.player(player.player_id).unwrap();
            assert_eq!(player.mu.to_bits(), other.mu.to_bits());
            assert_eq!(player.sigma.to_bits(), other.sigma.to_bits());
        }
        assert_eq!(first.player_history.len(), second.player_history.len());
    }

    #[test]
    fn test_replay_matches_online_processing() {
        let params = Params::default();
        let matches = vec![
            singles(1, 0, 1, 2, 11, 7),
            singles(2, 1, 3, 1, 11, 9),
            singles(3, 2, 2, 3, 11, 2),
        ];

        // Online: the same stream, applied through the engine one match at
        // a time in arrival order (which here is chronological).
        let mut online = LadderTracker::new("squash:singles");
        for m in &matches {
            for id in m.input.all_player_ids() {
                online.ensure_player(id, &params.rating);
            }
            rate_match(&m.input, &mut online, &params);
        }

        let replayed = run_replay("squash:singles", &matches, &params);

        for player in online.players() {
            let other = replayed.tracker.player(player.player_id).unwrap();
            assert_abs_diff_eq!(player.mu, other.mu, epsilon = 1e-9);
            assert_abs_diff_eq!(player.sigma, other.sigma, epsilon = 1e-9);
            assert_eq!(player.matches_count, other.matches_count);
        }
    }

    #[test]
    fn test_late_arrival_resolved_by_chronological_replay() {
        let params = Params::default();
        let m0 = singles(10, -2, 1, 2, 11, 5);
        let m1 = singles(11, 0, 1, 2, 11, 8);
        let m2 = singles(12, 1, 2, 1, 11, 9);

        // Arrival order had m0 last; replay must equal the chronological run.
        let chronological = vec![m0.clone(), m1.clone(), m2.clone()];
        let outcome = run_replay("squash:singles", &chronological, &params);

        let mut reference = LadderTracker::new("squash:singles");
        for m in &chronological {
            for id in m.input.all_player_ids() {
                reference.ensure_player(id, &params.rating);
            }
            rate_match(&m.input, &mut reference, &params);
        }

        for player in reference.players() {
            let replayed = outcome.tracker.player(player.player_id).unwrap();
            assert_abs_diff_eq!(player.mu, replayed.mu, epsilon = 1e-9);
        }
        assert_eq!(outcome.matches_processed, 3);
    }

    #[test]
    fn test_history_rows_cover_every_participant() {
        let params = Params::default();
        let matches = vec![singles(1, 0, 1, 2, 11, 7), singles(2, 1, 1, 3, 11, 3)];

        let outcome = run_replay("squash:singles", &matches, &params);

        assert_eq!(outcome.player_history.len(), 4);
        assert_eq!(outcome.player_history[0].created_at, at(0));
        assert_eq!(outcome.tracker.player(1).unwrap().matches_count, 2);
        assert_eq!(outcome.tracker.player(1).unwrap().updated_at, Some(at(1)));
    }

    #[test]
    fn test_offsets_stay_quiet_below_edge_minimum() {
        let params = Params::default();
        // Two inter-sex matches: far fewer than min_edges_90d.
        let mut matches = vec![singles(1, 0, 1, 2, 11, 7)];
        matches.push(ReplayMatch {
            match_id: Uuid::from_u128(2),
            start_time: at(1),
            applied_at: at(1),
            input: MatchInput {
                sport: Sport::Squash,
                discipline: Discipline::Singles,
                format: None,
                tier: None,
                side_a: side(&[(4, Sex::Female)]),
                side_b: side(&[(5, Sex::Male)]),
                games: vec![GameScore {
                    game_no: 1,
                    score_a: 11,
                    score_b: 6
                }],
                mov_weight: None,
                winner: None
            }
        });

        let outcome = run_replay("squash:singles", &matches, &params);

        assert_abs_diff_eq!(outcome.offsets.bias(Sex::Female), 0.0);
        assert_abs_diff_eq!(outcome.offsets.width(), 0.0);
    }
}
