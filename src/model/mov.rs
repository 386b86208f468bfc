use crate::model::{
    constants::MovParams,
    structures::{GameScore, MovStyle, Sport}
};

/// Margin-of-victory weight for a finished match.
///
/// Rally sports read the per-game point spread; set sports only count the
/// set differential, since individual set scores (6-4 vs 7-5) carry almost
/// no extra information about the gap between the sides.
pub fn mov_weight(sport: Sport, games: &[GameScore], params: &MovParams) -> f64 {
    if games.is_empty() {
        return 1.0;
    }

    match sport.mov_style() {
        MovStyle::RallyPoint => rally_weight(games, params),
        MovStyle::SetBased => set_weight(games, params)
    }
}

fn rally_weight(games: &[GameScore], params: &MovParams) -> f64 {
    let spread_sum: f64 = games
        .iter()
        .map(|g| ((g.score_a - g.score_b).abs() as f64).min(params.cap_per_game))
        .sum();
    let mean = (spread_sum / games.len() as f64).min(params.mean_cap);

    scale(mean / params.mean_cap, params)
}

fn set_weight(games: &[GameScore], params: &MovParams) -> f64 {
    let sets_a = games.iter().filter(|g| g.score_a > g.score_b).count() as f64;
    let sets_b = games.iter().filter(|g| g.score_b > g.score_a).count() as f64;
    let diff = (sets_a - sets_b).abs().min(params.cap_per_set);

    scale(diff / params.cap_per_set, params)
}

fn scale(normalized: f64, params: &MovParams) -> f64 {
    params.weight_min + (params.weight_max - params.weight_min) * normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn game(game_no: i32, score_a: i32, score_b: i32) -> GameScore {
        GameScore {
            game_no,
            score_a,
            score_b
        }
    }

    #[test]
    fn test_no_games_is_neutral() {
        assert_abs_diff_eq!(mov_weight(Sport::Badminton, &[], &MovParams::default()), 1.0);
    }

    #[test]
    fn test_rally_blowout_hits_the_cap() {
        let games = vec![game(1, 21, 3), game(2, 21, 5)];
        let w = mov_weight(Sport::Badminton, &games, &MovParams::default());
        assert_abs_diff_eq!(w, 1.3, epsilon = 1e-12);
    }

    #[test]
    fn test_rally_close_match_near_floor() {
        let games = vec![game(1, 21, 19), game(2, 19, 21), game(3, 21, 19)];
        let w = mov_weight(Sport::Pickleball, &games, &MovParams::default());
        // Mean spread 2 of a cap of 8.
        assert_abs_diff_eq!(w, 0.7 + 0.6 * (2.0 / 8.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rally_spread_clamped_per_game() {
        // One absurd 21-0 game cannot dominate: spread clamps at 11.
        let games = vec![game(1, 21, 0), game(2, 21, 20)];
        let w = mov_weight(Sport::Squash, &games, &MovParams::default());
        let expected_mean: f64 = (11.0 + 1.0) / 2.0;
        assert_abs_diff_eq!(w, 0.7 + 0.6 * (expected_mean.min(8.0) / 8.0), epsilon = 1e-12);
    }

    #[test]
    fn test_set_sweep_vs_split() {
        let params = MovParams::default();
        let sweep = vec![game(1, 6, 3), game(2, 6, 4)];
        let split = vec![game(1, 6, 3), game(2, 4, 6), game(3, 7, 5)];
        let w_sweep = mov_weight(Sport::Tennis, &sweep, &params);
        let w_split = mov_weight(Sport::Tennis, &split, &params);
        assert!(w_sweep > w_split);
        assert_abs_diff_eq!(w_sweep, 0.7 + 0.6 * (2.0 / 3.0), epsilon = 1e-12);
        assert_abs_diff_eq!(w_split, 0.7 + 0.6 * (1.0 / 3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_weights_stay_in_range() {
        let params = MovParams::default();
        for spread in 0..25 {
            let games = vec![game(1, 21, 21 - spread.min(21))];
            for sport in [Sport::Badminton, Sport::Tennis] {
                let w = mov_weight(sport, &games, &params);
                assert!((params.weight_min..=params.weight_max).contains(&w));
            }
        }
    }
}
