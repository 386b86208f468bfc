use crate::model::{
    constants::Params,
    ladder_tracker::{pair_key, EngineState},
    math::normal_cdf,
    mov::mov_weight,
    structures::{
        MatchInput, MatchRatingResult, PairUpdate, PlayerRatingChange, SexCounts, SexOffsetSignal, Side, SideInput
    }
};

/// Match Engine
///
/// The pure rating update at the heart of the service. Given a match input
/// and the mutable state of everyone involved, it computes and applies:
///
/// 1. **Team delta** — a margin- and tier-weighted, uncertainty-scaled step
///    on the expected-win surprise, split evenly across each side.
/// 2. **σ adjustment** — uncertainty shrinks with match information and
///    grows again when the result was a large surprise.
/// 3. **Pair synergy deltas** — for doubles sides, once the pair has enough
///    shared appearances.
/// 4. **Sex-offset signal** — raw per-sex counts for the offset controller;
///    the engine itself never persists anything.
///
/// The engine is deterministic and infallible: it rates whatever states it
/// is handed. Loading the right states (and erroring on unknown players) is
/// the recorder's job.
///
/// # Panics
/// Panics if a participant has no state in `state`. That is a caller bug,
/// mirrored after the store contract rather than silently seeding here.
pub fn rate_match(input: &MatchInput, state: &mut dyn EngineState, params: &Params) -> MatchRatingResult {
    let beta = input.sport.beta();

    let gamma_a = side_gamma(&input.side_a, state);
    let gamma_b = side_gamma(&input.side_b, state);

    let rating_a = side_mu_sum(&input.side_a, state) + gamma_a;
    let rating_b = side_mu_sum(&input.side_b, state) + gamma_b;

    let win_probability = normal_cdf((rating_a - rating_b) / (std::f64::consts::SQRT_2 * beta));

    let winner = input.resolve_winner();
    let y = match winner {
        Side::A => 1.0,
        Side::B => 0.0
    };
    let surprise = y - win_probability;

    let weight = input
        .mov_weight
        .unwrap_or_else(|| mov_weight(input.sport, &input.games, &params.mov));
    let tiered_weight = (weight * params.tier_weights.weight(input.tier)).min(params.rating.multiplier_cap);

    // Uncertainty scale: how much collective doubt both sides carry,
    // relative to the reference σ.
    let var_a = side_mean_variance(&input.side_a, state);
    let var_b = side_mean_variance(&input.side_b, state);
    let uncertainty = ((var_a + var_b) / (2.0 * params.rating.sigma_ref * params.rating.sigma_ref)).sqrt();

    let rookie_factor = if has_rookie(&input.side_a, state, params) || has_rookie(&input.side_b, state, params) {
        params.rating.rookie_k_multiplier
    } else {
        1.0
    };
    let k = (params.rating.k0 * uncertainty).clamp(params.rating.k_min, params.rating.k_max) * rookie_factor;

    // Amplifies upsets, dampens the expected result.
    let mismatch =
        1.0 + params.rating.mismatch_lambda * (2.0 * win_probability - 1.0) * (1.0 - 2.0 * y);

    let team_delta = mismatch * k * surprise * tiered_weight;

    let mut per_player = Vec::with_capacity(input.side_a.players.len() + input.side_b.players.len());
    apply_side(&input.side_a, state, team_delta, win_probability, surprise, params, &mut per_player);
    apply_side(
        &input.side_b,
        state,
        -team_delta,
        1.0 - win_probability,
        surprise,
        params,
        &mut per_player
    );

    let mut pair_updates = Vec::new();
    for side in [Side::A, Side::B] {
        if let Some(update) = update_pair(input.side(side), state, winner == side, surprise, params) {
            pair_updates.push(update);
        }
    }

    let sex_offset = Some(SexOffsetSignal {
        surprise,
        counts_a: SexCounts::from_players(input.side_a.players.iter().map(|p| &p.sex)),
        counts_b: SexCounts::from_players(input.side_b.players.iter().map(|p| &p.sex))
    });

    MatchRatingResult {
        per_player,
        pair_updates,
        team_delta,
        win_probability,
        mov_weight: weight,
        sex_offset
    }
}

fn side_mu_sum(side: &SideInput, state: &dyn EngineState) -> f64 {
    side.players
        .iter()
        .map(|p| required_player(state, p.player_id).mu)
        .sum()
}

fn side_mean_variance(side: &SideInput, state: &dyn EngineState) -> f64 {
    let sum: f64 = side
        .players
        .iter()
        .map(|p| {
            let sigma = required_player(state, p.player_id).sigma;
            sigma * sigma
        })
        .sum();
    sum / side.players.len() as f64
}

fn side_gamma(side: &SideInput, state: &dyn EngineState) -> f64 {
    if !side.is_pair() {
        return 0.0;
    }
    let key = pair_key(&side.player_ids());
    state.pair(&key).map(|p| p.gamma).unwrap_or(0.0)
}

fn has_rookie(side: &SideInput, state: &dyn EngineState, params: &Params) -> bool {
    side.players
        .iter()
        .any(|p| required_player(state, p.player_id).matches_count < params.rating.rookie_boost_matches)
}

fn required_player<'a>(state: &'a dyn EngineState, player_id: i64) -> &'a crate::model::ladder_tracker::PlayerState {
    state
        .player(player_id)
        .unwrap_or_else(|| panic!("Player {player_id}: no rating state supplied to the engine"))
}

fn apply_side(
    side: &SideInput,
    state: &mut dyn EngineState,
    side_delta: f64,
    side_win_prob: f64,
    surprise: f64,
    params: &Params,
    out: &mut Vec<PlayerRatingChange>
) {
    let share = side_delta / side.players.len() as f64;
    // Match information is symmetric in p, so both sides share it.
    let info = 4.0 * side_win_prob * (1.0 - side_win_prob);

    for player in &side.players {
        let state = state
            .player_mut(player.player_id)
            .unwrap_or_else(|| panic!("Player {}: no rating state supplied to the engine", player.player_id));

        let mu_before = state.mu;
        let sigma_before = state.sigma;

        state.mu += share;

        let variance = sigma_before * sigma_before;
        let mut new_variance = variance - params.rating.eta_down * info * variance;
        if surprise.abs() > params.rating.surprise_threshold {
            new_variance += params.rating.eta_up * (surprise.abs() - params.rating.surprise_threshold) * variance;
        }
        let sigma_min_sq = params.rating.sigma_min * params.rating.sigma_min;
        let sigma_max_sq = params.rating.sigma_max() * params.rating.sigma_max();
        state.sigma = new_variance.clamp(sigma_min_sq, sigma_max_sq).sqrt();
        debug_assert!(state.sigma >= params.rating.sigma_min && state.sigma <= params.rating.sigma_max());

        state.matches_count += 1;

        out.push(PlayerRatingChange {
            player_id: player.player_id,
            mu_before,
            mu_after: state.mu,
            delta: share,
            sigma_before,
            sigma_after: state.sigma,
            win_prob_pre: side_win_prob
        });
    }
}

/// Synergy bookkeeping for one doubles side.
///
/// The appearance counter always advances; γ itself only moves once the
/// pair has reached the activation threshold. The per-side direction is +1
/// for the winning side, so a favored pair that loses bleeds synergy in
/// proportion to how unexpected the loss was.
fn update_pair(
    side: &SideInput,
    state: &mut dyn EngineState,
    side_won: bool,
    surprise: f64,
    params: &Params
) -> Option<PairUpdate> {
    if !side.is_pair() {
        return None;
    }

    let key = pair_key(&side.player_ids());
    let pair = state.pair_mut(&key)?;

    pair.matches += 1;
    let activated = pair.matches >= params.synergy.activation_matches;

    let gamma_before = pair.gamma;
    let delta = if activated {
        let direction = if side_won { 1.0 } else { -1.0 };
        (params.synergy.k0 * surprise.abs() * direction).clamp(-params.synergy.delta_max, params.synergy.delta_max)
    } else {
        0.0
    };
    pair.gamma = (pair.gamma + delta).clamp(params.synergy.gamma_min, params.synergy.gamma_max);
    debug_assert!(pair.gamma >= params.synergy.gamma_min && pair.gamma <= params.synergy.gamma_max);

    Some(PairUpdate {
        pair_key: key,
        players: pair.players.clone(),
        gamma_before,
        gamma_after: pair.gamma,
        delta: pair.gamma - gamma_before,
        matches: pair.matches,
        activated
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        constants::Params,
        ladder_tracker::LadderTracker,
        structures::{Discipline, GameScore, Sex, SidePlayer, Sport}
    };
    use approx::assert_abs_diff_eq;

    fn side(players: &[(i64, Sex)]) -> SideInput {
        SideInput {
            players: players
                .iter()
                .map(|&(player_id, sex)| SidePlayer { player_id, sex })
                .collect()
        }
    }

    fn singles_input(games: Vec<GameScore>, winner: Option<Side>) -> MatchInput {
        MatchInput {
            sport: Sport::Tennis,
            discipline: Discipline::Singles,
            format: None,
            tier: None,
            side_a: side(&[(1, Sex::Male)]),
            side_b: side(&[(2, Sex::Female)]),
            games,
            mov_weight: None,
            winner
        }
    }

    fn game(game_no: i32, score_a: i32, score_b: i32) -> GameScore {
        GameScore {
            game_no,
            score_a,
            score_b
        }
    }

    fn seeded_tracker(entries: &[(i64, f64, f64, u32)]) -> LadderTracker {
        let params = Params::default();
        let mut tracker = LadderTracker::new("tennis:singles");
        for &(id, mu, sigma, matches) in entries {
            let state = tracker.ensure_player(id, &params.rating);
            state.mu = mu;
            state.sigma = sigma;
            state.matches_count = matches;
        }
        tracker
    }

    #[test]
    fn test_expected_win_moves_ratings_the_right_way() {
        let params = Params::default();
        let mut tracker = seeded_tracker(&[(1, 1600.0, 100.0, 20), (2, 1400.0, 100.0, 20)]);

        let input = singles_input(vec![game(1, 21, 15), game(2, 21, 18)], Some(Side::A));
        let result = rate_match(&input, &mut tracker, &params);

        assert_abs_diff_eq!(result.win_probability, 0.731, epsilon = 0.002);
        assert!(result.team_delta > 0.0);

        let a = tracker.player(1).unwrap();
        let b = tracker.player(2).unwrap();
        assert!(a.mu > 1600.0);
        assert!(b.mu < 1400.0);
        assert_abs_diff_eq!(a.mu - 1600.0, 1400.0 - b.mu, epsilon = 1e-9);

        // Small surprise: information outweighs it, σ shrinks for both.
        assert!(a.sigma < 100.0);
        assert!(b.sigma < 100.0);
        assert_eq!(a.matches_count, 21);
    }

    #[test]
    fn test_upset_amplified_and_sigma_grows() {
        let params = Params::default();
        let mut tracker = seeded_tracker(&[(1, 1700.0, 100.0, 20), (2, 1300.0, 100.0, 20)]);

        let input = singles_input(vec![game(1, 15, 21), game(2, 18, 21)], None);
        let result = rate_match(&input, &mut tracker, &params);

        assert!(result.win_probability > 0.85);
        let surprise = 0.0 - result.win_probability;
        assert!(surprise < -0.8);

        // Upset: mismatch multiplier must sit above 1.
        let mismatch = 1.0 + params.rating.mismatch_lambda * (2.0 * result.win_probability - 1.0);
        assert!(mismatch > 1.0);

        let a = tracker.player(1).unwrap();
        let b = tracker.player(2).unwrap();
        assert!(b.mu > 1300.0);
        assert!(a.mu < 1700.0);

        // |surprise| is over the threshold, so uncertainty grows.
        assert!(a.sigma > 100.0);
        assert!(b.sigma > 100.0);
    }

    #[test]
    fn test_zero_sum_within_tolerance() {
        let params = Params::default();
        let mut tracker = seeded_tracker(&[
            (1, 1550.0, 90.0, 15),
            (2, 1480.0, 220.0, 3),
            (3, 1390.0, 120.0, 40),
            (4, 1620.0, 60.0, 55),
        ]);

        let input = MatchInput {
            sport: Sport::Badminton,
            discipline: Discipline::Doubles,
            format: None,
            tier: None,
            side_a: side(&[(1, Sex::Male), (2, Sex::Male)]),
            side_b: side(&[(3, Sex::Female), (4, Sex::Female)]),
            games: vec![game(1, 21, 17), game(2, 19, 21), game(3, 21, 12)],
            mov_weight: None,
            winner: None
        };
        let result = rate_match(&input, &mut tracker, &params);

        let sum: f64 = result.per_player.iter().map(|p| p.delta).sum();
        assert_abs_diff_eq!(sum, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sigma_stays_in_bounds_under_repeated_updates() {
        let params = Params::default();
        let mut tracker = seeded_tracker(&[(1, 1500.0, 31.0, 50), (2, 1500.0, 31.0, 50)]);

        for i in 0..200 {
            let input = singles_input(vec![game(1, 21, 10)], Some(if i % 2 == 0 { Side::A } else { Side::B }));
            rate_match(&input, &mut tracker, &params);
        }

        for id in [1, 2] {
            let state = tracker.player(id).unwrap();
            assert!(state.sigma >= params.rating.sigma_min);
            assert!(state.sigma <= params.rating.sigma_max());
        }
    }

    #[test]
    fn test_rookie_boost_scales_the_step() {
        let params = Params::default();

        let mut veterans = seeded_tracker(&[(1, 1500.0, 100.0, 30), (2, 1500.0, 100.0, 30)]);
        let mut rookies = seeded_tracker(&[(1, 1500.0, 100.0, 0), (2, 1500.0, 100.0, 30)]);

        let input = singles_input(vec![game(1, 21, 15)], Some(Side::A));
        let veteran_result = rate_match(&input, &mut veterans, &params);
        let rookie_result = rate_match(&input, &mut rookies, &params);

        assert_abs_diff_eq!(
            rookie_result.team_delta,
            veteran_result.team_delta * params.rating.rookie_k_multiplier,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_supplied_mov_weight_is_used_verbatim() {
        let params = Params::default();
        let mut tracker = seeded_tracker(&[(1, 1500.0, 100.0, 20), (2, 1500.0, 100.0, 20)]);

        let mut input = singles_input(vec![game(1, 21, 15)], Some(Side::A));
        input.mov_weight = Some(1.25);
        let result = rate_match(&input, &mut tracker, &params);

        assert_abs_diff_eq!(result.mov_weight, 1.25, epsilon = 1e-12);
    }

    #[test]
    fn test_synergy_counts_before_activation_and_moves_after() {
        let params = Params::default();
        let mut tracker = LadderTracker::new("badminton:doubles");
        for id in 1..=4 {
            tracker.ensure_player(id, &params.rating);
        }
        tracker.ensure_pair(&[1, 2]);
        tracker.ensure_pair(&[3, 4]);

        let input = MatchInput {
            sport: Sport::Badminton,
            discipline: Discipline::Doubles,
            format: None,
            tier: None,
            side_a: side(&[(1, Sex::Male), (2, Sex::Male)]),
            side_b: side(&[(3, Sex::Male), (4, Sex::Male)]),
            games: vec![game(1, 21, 15), game(2, 21, 17)],
            mov_weight: None,
            winner: Some(Side::A)
        };

        for round in 1..=params.synergy.activation_matches {
            let result = rate_match(&input, &mut tracker, &params);
            let update = result
                .pair_updates
                .iter()
                .find(|u| u.pair_key == "1|2")
                .expect("winning pair should always report an update");

            assert_eq!(update.matches, round);
            if round < params.synergy.activation_matches {
                assert!(!update.activated);
                assert_eq!(update.delta, 0.0);
                assert_eq!(tracker.pair("1|2").unwrap().gamma, 0.0);
            } else {
                assert!(update.activated);
                assert!(update.delta > 0.0);
                assert!(tracker.pair("1|2").unwrap().gamma > 0.0);
            }
        }

        // The losing pair activated on the same match and bled synergy.
        let losers = tracker.pair("3|4").unwrap();
        assert_eq!(losers.matches, params.synergy.activation_matches);
        assert!(losers.gamma < 0.0);
    }

    #[test]
    fn test_singles_never_touch_synergy() {
        let params = Params::default();
        let mut tracker = seeded_tracker(&[(1, 1500.0, 100.0, 20), (2, 1500.0, 100.0, 20)]);

        let input = singles_input(vec![game(1, 21, 15)], Some(Side::A));
        let result = rate_match(&input, &mut tracker, &params);

        assert!(result.pair_updates.is_empty());
    }

    #[test]
    fn test_sex_offset_signal_counts_both_sides() {
        let params = Params::default();
        let mut tracker = seeded_tracker(&[
            (1, 1500.0, 100.0, 20),
            (2, 1500.0, 100.0, 20),
            (3, 1500.0, 100.0, 20),
            (4, 1500.0, 100.0, 20),
        ]);

        let input = MatchInput {
            sport: Sport::Pickleball,
            discipline: Discipline::MixedDoubles,
            format: None,
            tier: None,
            side_a: side(&[(1, Sex::Male), (2, Sex::Female)]),
            side_b: side(&[(3, Sex::Female), (4, Sex::Female)]),
            games: vec![game(1, 11, 7)],
            mov_weight: None,
            winner: Some(Side::A)
        };
        let result = rate_match(&input, &mut tracker, &params);

        let signal = result.sex_offset.expect("engine always emits the signal");
        assert_eq!(signal.counts_a.get(Sex::Male), 1);
        assert_eq!(signal.counts_a.get(Sex::Female), 1);
        assert_eq!(signal.counts_b.get(Sex::Female), 2);
        assert_abs_diff_eq!(signal.surprise, 1.0 - result.win_probability, epsilon = 1e-12);
    }
}
