use super::{discipline::Discipline, match_tier::MatchTier, sex::Sex, side::Side, sport::Sport};
use serde::{Deserialize, Serialize};

/// One participant on a side, with the sex group used by the offset
/// controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidePlayer {
    pub player_id: i64,
    #[serde(default)]
    pub sex: Sex
}

/// Ordered player list for one side of a match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideInput {
    pub players: Vec<SidePlayer>
}

impl SideInput {
    pub fn player_ids(&self) -> Vec<i64> {
        self.players.iter().map(|p| p.player_id).collect()
    }

    pub fn is_pair(&self) -> bool {
        self.players.len() >= 2
    }
}

/// Per-game scoreline, side A first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameScore {
    pub game_no: i32,
    pub score_a: i32,
    pub score_b: i32
}

impl GameScore {
    pub fn winner(&self) -> Option<Side> {
        match self.score_a.cmp(&self.score_b) {
            std::cmp::Ordering::Greater => Some(Side::A),
            std::cmp::Ordering::Less => Some(Side::B),
            std::cmp::Ordering::Equal => None
        }
    }
}

/// Everything the engine needs to rate one match.
///
/// The engine never reads storage; player and pair state arrive through the
/// state view passed alongside this input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchInput {
    pub sport: Sport,
    pub discipline: Discipline,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<MatchTier>,
    pub side_a: SideInput,
    pub side_b: SideInput,
    pub games: Vec<GameScore>,
    /// Pre-computed margin weight. When absent the sport profile derives it
    /// from the game scores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mov_weight: Option<f64>,
    /// Explicit winner. When absent the winner is the side with the game
    /// majority; an exact tie resolves to side A.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Side>
}

impl MatchInput {
    pub fn side(&self, side: Side) -> &SideInput {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b
        }
    }

    /// Winner of the match. Ties in game count deliberately resolve to side
    /// A; callers that care must submit an explicit winner.
    pub fn resolve_winner(&self) -> Side {
        if let Some(winner) = self.winner {
            return winner;
        }
        let wins_b = self
            .games
            .iter()
            .filter(|g| g.winner() == Some(Side::B))
            .count();
        let wins_a = self
            .games
            .iter()
            .filter(|g| g.winner() == Some(Side::A))
            .count();
        if wins_b > wins_a {
            Side::B
        } else {
            Side::A
        }
    }

    pub fn all_player_ids(&self) -> Vec<i64> {
        let mut ids = self.side_a.player_ids();
        ids.extend(self.side_b.player_ids());
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(ids: &[i64]) -> SideInput {
        SideInput {
            players: ids
                .iter()
                .map(|&player_id| SidePlayer {
                    player_id,
                    sex: Sex::Unknown
                })
                .collect()
        }
    }

    fn input(games: Vec<GameScore>, winner: Option<Side>) -> MatchInput {
        MatchInput {
            sport: Sport::Tennis,
            discipline: Discipline::Singles,
            format: None,
            tier: None,
            side_a: side(&[1]),
            side_b: side(&[2]),
            games,
            mov_weight: None,
            winner
        }
    }

    #[test]
    fn test_explicit_winner_wins_over_games() {
        let m = input(
            vec![GameScore {
                game_no: 1,
                score_a: 0,
                score_b: 21
            }],
            Some(Side::A)
        );
        assert_eq!(m.resolve_winner(), Side::A);
    }

    #[test]
    fn test_game_majority() {
        let m = input(
            vec![
                GameScore {
                    game_no: 1,
                    score_a: 21,
                    score_b: 15
                },
                GameScore {
                    game_no: 2,
                    score_a: 10,
                    score_b: 21
                },
                GameScore {
                    game_no: 3,
                    score_a: 12,
                    score_b: 21
                },
            ],
            None
        );
        assert_eq!(m.resolve_winner(), Side::B);
    }

    #[test]
    fn test_tie_defaults_to_side_a() {
        let m = input(
            vec![
                GameScore {
                    game_no: 1,
                    score_a: 21,
                    score_b: 15
                },
                GameScore {
                    game_no: 2,
                    score_a: 10,
                    score_b: 21
                },
            ],
            None
        );
        assert_eq!(m.resolve_winner(), Side::A);
    }
}
