use crate::model::structures::{MatchTier, Sex};
use serde::{Deserialize, Serialize};

/// All tunables of the rating core, grouped by subsystem.
///
/// Every deployment shares these defaults unless an operator overrides them;
/// replay correctness requires that the values in force never change between
/// the online run and a later replay of the same ladder.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Params {
    pub rating: RatingParams,
    pub mov: MovParams,
    pub tier_weights: TierWeights,
    pub synergy: SynergyParams,
    pub idle: IdleParams,
    pub region: RegionParams,
    pub graph: GraphParams,
    pub drift: DriftParams,
    pub sex_offsets: SexOffsetParams,
    pub replay: ReplayParams
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RatingParams {
    /// Prior mean for a first-touch player.
    pub base_mu: f64,
    /// Prior uncertainty for a first-touch player; also the σ ceiling.
    pub base_sigma: f64,
    pub sigma_min: f64,
    /// Normalizer for the uncertainty scale in the K computation.
    pub sigma_ref: f64,
    pub k0: f64,
    pub k_min: f64,
    pub k_max: f64,
    /// σ² shrink per unit of match information.
    pub eta_down: f64,
    /// σ² growth per unit of excess surprise.
    pub eta_up: f64,
    /// |surprise| above which the η_up branch engages.
    pub surprise_threshold: f64,
    /// Players below this match count move on the boosted K.
    pub rookie_boost_matches: u32,
    pub rookie_k_multiplier: f64,
    /// Upset amplification factor λ.
    pub mismatch_lambda: f64,
    /// Cap on the combined MoV × tier multiplier.
    pub multiplier_cap: f64
}

impl RatingParams {
    pub fn sigma_max(&self) -> f64 {
        self.base_sigma
    }
}

impl Default for RatingParams {
    fn default() -> Self {
        Self {
            base_mu: 1500.0,
            base_sigma: 350.0,
            sigma_min: 30.0,
            sigma_ref: 200.0,
            k0: 40.0,
            k_min: 12.0,
            k_max: 96.0,
            eta_down: 0.06,
            eta_up: 0.12,
            surprise_threshold: 0.55,
            rookie_boost_matches: 10,
            rookie_k_multiplier: 1.5,
            mismatch_lambda: 0.25,
            multiplier_cap: 1.5
        }
    }
}

/// Margin-of-victory shaping, shared by both scoring styles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MovParams {
    /// Per-game point-spread cap for rally sports.
    pub cap_per_game: f64,
    /// Cap on the mean rally spread before scaling.
    pub mean_cap: f64,
    /// Absolute set-differential cap for set sports.
    pub cap_per_set: f64,
    pub weight_min: f64,
    pub weight_max: f64
}

impl Default for MovParams {
    fn default() -> Self {
        Self {
            cap_per_game: 11.0,
            mean_cap: 8.0,
            cap_per_set: 3.0,
            weight_min: 0.7,
            weight_max: 1.3
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TierWeights {
    pub sanctioned: f64,
    pub league: f64,
    pub social: f64,
    pub exhibition: f64,
    pub default_tier: f64,
    pub unspecified: f64
}

impl TierWeights {
    pub fn weight(&self, tier: Option<MatchTier>) -> f64 {
        match tier.unwrap_or_default() {
            MatchTier::Sanctioned => self.sanctioned,
            MatchTier::League => self.league,
            MatchTier::Social => self.social,
            MatchTier::Exhibition => self.exhibition,
            MatchTier::DefaultTier => self.default_tier,
            MatchTier::Unspecified => self.unspecified
        }
    }
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            sanctioned: 1.1,
            league: 1.0,
            social: 0.9,
            exhibition: 0.7,
            default_tier: 1.0,
            unspecified: 1.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SynergyParams {
    pub k0: f64,
    /// Per-match cap on |Δγ|.
    pub delta_max: f64,
    pub gamma_min: f64,
    pub gamma_max: f64,
    /// Appearances before γ is allowed to move.
    pub activation_matches: u32,
    pub decay_rate_per_week: f64,
    /// Nightly multiplicative pull toward zero.
    pub regularization: f64
}

impl Default for SynergyParams {
    fn default() -> Self {
        Self {
            k0: 8.0,
            delta_max: 6.0,
            gamma_min: -120.0,
            gamma_max: 120.0,
            activation_matches: 5,
            decay_rate_per_week: 0.05,
            regularization: 0.02
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdleParams {
    /// Grace period before inactivity starts growing σ.
    pub activation_days: f64,
    pub rate_per_week: f64
}

impl Default for IdleParams {
    fn default() -> Self {
        Self {
            activation_days: 28.0,
            rate_per_week: 0.04
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegionParams {
    /// Cap on the nightly per-region mean shift.
    pub max_shift_per_day: f64
}

impl Default for RegionParams {
    fn default() -> Self {
        Self { max_shift_per_day: 4.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphParams {
    pub smoothing_lambda: f64,
    /// Match recency window for the smoothing graph.
    pub horizon_days: i64,
    /// Players at or below this σ are subject to smoothing.
    pub sigma_provisional: f64
}

impl Default for GraphParams {
    fn default() -> Self {
        Self {
            smoothing_lambda: 0.08,
            horizon_days: 60,
            sigma_provisional: 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriftParams {
    pub target_std: f64,
    pub max_daily_delta: f64
}

impl Default for DriftParams {
    fn default() -> Self {
        Self {
            target_std: 250.0,
            max_daily_delta: 6.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SexOffsetParams {
    pub enabled: bool,
    pub k_factor: f64,
    pub delta_max: f64,
    pub max_abs: f64,
    /// Nightly multiplicative shrink toward zero.
    pub regularization: f64,
    /// The sex whose bias is pinned at zero after centering.
    pub baseline: Sex,
    /// Minimum inter-sex matches in the trailing 90 days.
    pub min_edges_90d: u32,
    /// Maximum allowed max-min spread of the adjusted biases.
    pub max_ci_width: f64,
    /// Eligibility cache lifetime in seconds.
    pub eligibility_ttl_secs: u64
}

impl Default for SexOffsetParams {
    fn default() -> Self {
        Self {
            enabled: true,
            k_factor: 4.0,
            delta_max: 3.0,
            max_abs: 80.0,
            regularization: 0.02,
            baseline: Sex::Male,
            min_edges_90d: 10,
            max_ci_width: 60.0,
            eligibility_ttl_secs: 6 * 60 * 60
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplayParams {
    /// History rows per insert batch.
    pub batch_size: usize,
    /// Ladders drained per queue pass.
    pub queue_limit: usize
}

impl Default for ReplayParams {
    fn default() -> Self {
        Self {
            batch_size: 500,
            queue_limit: 10
        }
    }
}

lazy_static! {
    /// Process-wide default parameter set.
    pub static ref DEFAULT_PARAMS: Params = Params::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigma_bounds_are_ordered() {
        let p = RatingParams::default();
        assert!(p.sigma_min < p.sigma_max());
        assert!(p.k_min < p.k_max);
    }

    #[test]
    fn test_tier_weight_lookup_defaults_unspecified() {
        let w = TierWeights::default();
        assert_eq!(w.weight(None), w.unspecified);
        assert_eq!(w.weight(Some(MatchTier::Exhibition)), 0.7);
    }

    #[test]
    fn test_params_survive_serde_round_trip() {
        let params = Params::default();
        let json = serde_json::to_string(&params).unwrap();
        let back: Params = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rating.base_mu, params.rating.base_mu);
        assert_eq!(back.sex_offsets.baseline, params.sex_offsets.baseline);
    }
}
