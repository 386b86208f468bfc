use crate::model::{
    replay::ReplayMatch,
    structures::{Discipline, GameScore, MatchInput, Sex, SideInput, SidePlayer, Sport}
};
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

pub struct TestConstants {
    pub float_leniency: f64
}

impl TestConstants {
    pub fn new() -> TestConstants {
        TestConstants {
            float_leniency: 0.000000001
        }
    }
}

impl Default for TestConstants {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_epoch() -> DateTime<FixedOffset> {
    Utc.with_ymd_and_hms(2025, 1, 6, 18, 0, 0).unwrap().fixed_offset()
}

pub fn generate_side(players: &[i64], sex: Sex) -> SideInput {
    SideInput {
        players: players
            .iter()
            .map(|&player_id| SidePlayer { player_id, sex })
            .collect()
    }
}

pub fn generate_singles_match(
    seq: u128,
    start_time: DateTime<FixedOffset>,
    sport: Sport,
    player_a: i64,
    player_b: i64,
    games: Vec<GameScore>
) -> ReplayMatch {
    ReplayMatch {
        match_id: Uuid::from_u128(seq),
        start_time,
        applied_at: start_time,
        input: MatchInput {
            sport,
            discipline: Discipline::Singles,
            format: None,
            tier: None,
            side_a: generate_side(&[player_a], Sex::Unknown),
            side_b: generate_side(&[player_b], Sex::Unknown),
            games,
            mov_weight: None,
            winner: None
        }
    }
}

/// Deterministic pseudo-random rally-scored match stream across a small
/// player pool. Seeded so every test run sees the identical schedule.
pub fn generate_match_stream(seed: u64, player_pool: &[i64], count: usize, sport: Sport) -> Vec<ReplayMatch> {
    assert!(player_pool.len() >= 2, "need at least two players");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let epoch = test_epoch();

    (0..count)
        .map(|i| {
            let a_index = rng.random_range(0..player_pool.len());
            let mut b_index = rng.random_range(0..player_pool.len());
            while b_index == a_index {
                b_index = rng.random_range(0..player_pool.len());
            }

            let best_of = 2 * rng.random_range(1..=2) - 1;
            let games = (1..=best_of)
                .map(|game_no| {
                    let winner_a: bool = rng.random_bool(0.5);
                    let loser_score = rng.random_range(5..=19);
                    GameScore {
                        game_no,
                        score_a: if winner_a { 21 } else { loser_score },
                        score_b: if winner_a { loser_score } else { 21 }
                    }
                })
                .collect();

            generate_singles_match(
                i as u128 + 1,
                epoch + Duration::hours(i as i64),
                sport,
                player_pool[a_index],
                player_pool[b_index],
                games
            )
        })
        .collect()
}
