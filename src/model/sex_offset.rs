use crate::model::{
    constants::SexOffsetParams,
    structures::{Sex, SexOffsetSignal}
};
use chrono::{DateTime, FixedOffset};
use std::{
    collections::HashMap,
    time::{Duration, Instant}
};

/// Per-ladder sex bias state.
///
/// Biases are additive corrections applied to μ on read. The baseline sex is
/// re-centered to zero after every mutation, and the `Unknown` slot is never
/// adjusted; it exists so lookups for players without a registered sex
/// resolve to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetState {
    bias: [f64; 4],
    matches: [u32; 4],
    pub updated_at: Option<DateTime<FixedOffset>>
}

impl Default for OffsetState {
    fn default() -> Self {
        Self {
            bias: [0.0; 4],
            matches: [0; 4],
            updated_at: None
        }
    }
}

impl OffsetState {
    pub fn from_rows<I: IntoIterator<Item = (Sex, f64, u32)>>(rows: I) -> Self {
        let mut state = OffsetState::default();
        for (sex, bias, matches) in rows {
            state.bias[sex.index()] = bias;
            state.matches[sex.index()] = matches;
        }
        state
    }

    pub fn bias(&self, sex: Sex) -> f64 {
        self.bias[sex.index()]
    }

    pub fn matches(&self, sex: Sex) -> u32 {
        self.matches[sex.index()]
    }

    /// Max-min spread of the adjusted biases, the width the eligibility gate
    /// checks.
    pub fn width(&self) -> f64 {
        let values = Sex::ADJUSTED.map(|s| self.bias(s));
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        max - min
    }

    /// One match-level update. The caller has already decided eligibility.
    pub fn apply_signal(&mut self, signal: &SexOffsetSignal, params: &SexOffsetParams) {
        for sex in Sex::ADJUSTED {
            let diff = signal.counts_a.get(sex) as f64 - signal.counts_b.get(sex) as f64;
            if diff == 0.0 {
                continue;
            }
            let delta = (params.k_factor * signal.surprise * diff).clamp(-params.delta_max, params.delta_max);
            let i = sex.index();
            self.bias[i] = (self.bias[i] + delta).clamp(-params.max_abs, params.max_abs);
            self.matches[i] += diff.abs() as u32;
        }
        self.center(params);
    }

    /// Nightly regularization: multiplicative shrink toward zero, then
    /// re-center on the baseline.
    pub fn shrink(&mut self, params: &SexOffsetParams) {
        for sex in Sex::ADJUSTED {
            let i = sex.index();
            self.bias[i] = (self.bias[i] * (1.0 - params.regularization)).clamp(-params.max_abs, params.max_abs);
        }
        self.center(params);
    }

    fn center(&mut self, params: &SexOffsetParams) {
        let baseline = self.bias(params.baseline);
        for sex in Sex::ADJUSTED {
            let i = sex.index();
            self.bias[i] = (self.bias[i] - baseline).clamp(-params.max_abs, params.max_abs);
        }
        self.bias[Sex::Unknown.index()] = 0.0;
        debug_assert_eq!(self.bias(params.baseline), 0.0);
    }
}

/// The eligibility gate of the offset controller. `edges_90d` is the count
/// of inter-sex matches on the ladder in the trailing 90 days.
pub fn offsets_eligible(edges_90d: u32, state: &OffsetState, params: &SexOffsetParams) -> bool {
    params.enabled && edges_90d >= params.min_edges_90d && state.width() <= params.max_ci_width
}

/// Per-process memo of the eligibility decision, keyed by ladder.
///
/// Staleness across processes is fine: the authoritative offset row is
/// re-read under lock inside every match-write transaction, and the cache
/// is invalidated on every local write.
pub struct EligibilityCache {
    ttl: Duration,
    entries: HashMap<String, (bool, Instant)>
}

impl EligibilityCache {
    pub fn new(params: &SexOffsetParams) -> Self {
        Self {
            ttl: Duration::from_secs(params.eligibility_ttl_secs),
            entries: HashMap::new()
        }
    }

    pub fn get(&self, ladder_id: &str) -> Option<bool> {
        let (eligible, cached_at) = self.entries.get(ladder_id)?;
        if cached_at.elapsed() < self.ttl {
            Some(*eligible)
        } else {
            None
        }
    }

    pub fn put(&mut self, ladder_id: &str, eligible: bool) {
        self.entries.insert(ladder_id.to_string(), (eligible, Instant::now()));
    }

    pub fn invalidate(&mut self, ladder_id: &str) {
        self.entries.remove(ladder_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::structures::SexCounts;
    use approx::assert_abs_diff_eq;

    fn signal(surprise: f64, a: &[Sex], b: &[Sex]) -> SexOffsetSignal {
        SexOffsetSignal {
            surprise,
            counts_a: SexCounts::from_players(a.iter()),
            counts_b: SexCounts::from_players(b.iter())
        }
    }

    #[test]
    fn test_baseline_is_zero_after_every_update() {
        let params = SexOffsetParams::default();
        let mut state = OffsetState::default();

        for surprise in [0.4, -0.7, 0.2, 0.9] {
            state.apply_signal(
                &signal(surprise, &[Sex::Male, Sex::Female], &[Sex::Female, Sex::Female]),
                &params
            );
            assert_abs_diff_eq!(state.bias(params.baseline), 0.0);
            assert_abs_diff_eq!(state.bias(Sex::Unknown), 0.0);
        }
    }

    #[test]
    fn test_balanced_counts_produce_no_update() {
        let params = SexOffsetParams::default();
        let mut state = OffsetState::default();

        state.apply_signal(
            &signal(0.8, &[Sex::Male, Sex::Female], &[Sex::Female, Sex::Male]),
            &params
        );

        assert_abs_diff_eq!(state.bias(Sex::Female), 0.0);
        assert_eq!(state.matches(Sex::Female), 0);
    }

    #[test]
    fn test_bias_is_clamped() {
        let params = SexOffsetParams::default();
        let mut state = OffsetState::default();

        for _ in 0..200 {
            state.apply_signal(&signal(1.0, &[Sex::Female], &[Sex::Male]), &params);
        }

        assert!(state.bias(Sex::Female).abs() <= 2.0 * params.max_abs);
        assert!(state.width() <= 2.0 * params.max_abs);
    }

    #[test]
    fn test_match_counter_tracks_imbalance() {
        let params = SexOffsetParams::default();
        let mut state = OffsetState::default();

        state.apply_signal(
            &signal(0.3, &[Sex::Female, Sex::Female], &[Sex::Male, Sex::Male]),
            &params
        );

        assert_eq!(state.matches(Sex::Female), 2);
        assert_eq!(state.matches(Sex::Male), 2);
        assert_eq!(state.matches(Sex::NonBinary), 0);
    }

    #[test]
    fn test_shrink_pulls_toward_zero_and_recenters() {
        let params = SexOffsetParams::default();
        let mut state = OffsetState::from_rows([(Sex::Female, 10.0, 5), (Sex::NonBinary, -4.0, 2)]);

        state.shrink(&params);

        assert!(state.bias(Sex::Female).abs() < 10.0);
        assert_abs_diff_eq!(state.bias(params.baseline), 0.0);
    }

    #[test]
    fn test_eligibility_gates() {
        let params = SexOffsetParams::default();
        let state = OffsetState::default();

        assert!(offsets_eligible(params.min_edges_90d, &state, &params));
        assert!(!offsets_eligible(params.min_edges_90d - 1, &state, &params));

        let wide = OffsetState::from_rows([(Sex::Female, params.max_ci_width + 1.0, 1)]);
        assert!(!offsets_eligible(100, &wide, &params));

        let disabled = SexOffsetParams {
            enabled: false,
            ..SexOffsetParams::default()
        };
        assert!(!offsets_eligible(100, &state, &disabled));
    }

    #[test]
    fn test_cache_put_get_invalidate() {
        let params = SexOffsetParams::default();
        let mut cache = EligibilityCache::new(&params);

        assert_eq!(cache.get("tennis:singles"), None);
        cache.put("tennis:singles", true);
        assert_eq!(cache.get("tennis:singles"), Some(true));
        cache.invalidate("tennis:singles");
        assert_eq!(cache.get("tennis:singles"), None);
    }
}
