use crate::model::constants::RatingParams;
use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;
use itertools::Itertools;

/// Canonical pair identity: sorted ids joined with `|`.
///
/// Derived from the ids alone so the key never depends on submission order
/// or object identity.
pub fn pair_key(players: &[i64]) -> String {
    players.iter().sorted().join("|")
}

/// Mutable rating state of one player on one ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub player_id: i64,
    pub mu: f64,
    pub sigma: f64,
    pub matches_count: u32,
    pub updated_at: Option<DateTime<FixedOffset>>
}

impl PlayerState {
    pub fn seeded(player_id: i64, params: &RatingParams) -> Self {
        Self {
            player_id,
            mu: params.base_mu,
            sigma: params.base_sigma,
            matches_count: 0,
            updated_at: None
        }
    }
}

/// Mutable synergy state of one doubles pair on one ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct PairState {
    pub pair_key: String,
    pub players: Vec<i64>,
    pub gamma: f64,
    pub matches: u32,
    pub updated_at: Option<DateTime<FixedOffset>>
}

impl PairState {
    pub fn seeded(players: &[i64]) -> Self {
        let players: Vec<i64> = players.iter().copied().sorted().collect();
        Self {
            pair_key: pair_key(&players),
            players,
            gamma: 0.0,
            matches: 0,
            updated_at: None
        }
    }
}

/// Capability view the engine rates through.
///
/// The engine never touches storage; whoever calls it materializes the
/// relevant states behind this trait. Production loads rows from the
/// database, tests and replay use [`LadderTracker`] directly.
pub trait EngineState {
    fn player(&self, player_id: i64) -> Option<&PlayerState>;
    fn player_mut(&mut self, player_id: i64) -> Option<&mut PlayerState>;
    fn pair(&self, pair_key: &str) -> Option<&PairState>;
    fn pair_mut(&mut self, pair_key: &str) -> Option<&mut PairState>;
}

/// In-memory state arena for a single ladder.
///
/// Iteration order is insertion order, which keeps batch writes and replay
/// output deterministic.
#[derive(Debug, Default)]
pub struct LadderTracker {
    ladder_id: String,
    players: IndexMap<i64, PlayerState>,
    pairs: IndexMap<String, PairState>
}

impl LadderTracker {
    pub fn new(ladder_id: impl Into<String>) -> Self {
        Self {
            ladder_id: ladder_id.into(),
            players: IndexMap::new(),
            pairs: IndexMap::new()
        }
    }

    pub fn ladder_id(&self) -> &str {
        &self.ladder_id
    }

    /// Returns the player's state, seeding the prior on first touch.
    pub fn ensure_player(&mut self, player_id: i64, params: &RatingParams) -> &mut PlayerState {
        self.players
            .entry(player_id)
            .or_insert_with(|| PlayerState::seeded(player_id, params))
    }

    /// Returns the pair's state, seeding zero synergy on first touch.
    pub fn ensure_pair(&mut self, players: &[i64]) -> &mut PairState {
        let key = pair_key(players);
        self.pairs.entry(key).or_insert_with(|| PairState::seeded(players))
    }

    pub fn insert_player(&mut self, state: PlayerState) {
        self.players.insert(state.player_id, state);
    }

    pub fn insert_pair(&mut self, state: PairState) {
        self.pairs.insert(state.pair_key.clone(), state);
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &PairState> {
        self.pairs.values()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, player_id: i64) -> Option<&PlayerState> {
        self.players.get(&player_id)
    }

    pub fn player_mut(&mut self, player_id: i64) -> Option<&mut PlayerState> {
        self.players.get_mut(&player_id)
    }

    pub fn pair(&self, pair_key: &str) -> Option<&PairState> {
        self.pairs.get(pair_key)
    }

    pub fn pair_mut(&mut self, pair_key: &str) -> Option<&mut PairState> {
        self.pairs.get_mut(pair_key)
    }
}

impl EngineState for LadderTracker {
    fn player(&self, player_id: i64) -> Option<&PlayerState> {
        LadderTracker::player(self, player_id)
    }

    fn player_mut(&mut self, player_id: i64) -> Option<&mut PlayerState> {
        LadderTracker::player_mut(self, player_id)
    }

    fn pair(&self, pair_key: &str) -> Option<&PairState> {
        LadderTracker::pair(self, pair_key)
    }

    fn pair_mut(&mut self, pair_key: &str) -> Option<&mut PairState> {
        LadderTracker::pair_mut(self, pair_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_independent() {
        assert_eq!(pair_key(&[42, 7]), "7|42");
        assert_eq!(pair_key(&[7, 42]), "7|42");
    }

    #[test]
    fn test_ensure_player_seeds_prior_once() {
        let params = RatingParams::default();
        let mut tracker = LadderTracker::new("tennis:singles");

        {
            let state = tracker.ensure_player(1, &params);
            assert_eq!(state.mu, params.base_mu);
            assert_eq!(state.sigma, params.base_sigma);
            assert_eq!(state.matches_count, 0);
            state.mu = 1600.0;
        }

        // Second ensure must not reset the mutated state.
        assert_eq!(tracker.ensure_player(1, &params).mu, 1600.0);
        assert_eq!(tracker.player_count(), 1);
    }

    #[test]
    fn test_ensure_pair_sorts_members() {
        let mut tracker = LadderTracker::new("padel:doubles");
        let state = tracker.ensure_pair(&[9, 3]);
        assert_eq!(state.pair_key, "3|9");
        assert_eq!(state.players, vec![3, 9]);
        assert_eq!(state.gamma, 0.0);
    }
}
