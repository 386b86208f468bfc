use crate::model::{
    constants::{DriftParams, GraphParams, IdleParams, RatingParams, RegionParams, SynergyParams},
    ladder_tracker::{PairState, PlayerState}
};
use chrono::{DateTime, Duration, FixedOffset};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Region code for players whose organization has no regional split.
/// Members of this region are never mean-shifted.
pub const DEFAULT_REGION: &str = "DEFAULT";

const CHANGE_EPSILON: f64 = 1e-12;
const SECONDS_PER_WEEK: f64 = 7.0 * 86_400.0;

/// Nightly Stabilization
///
/// Each step here is a pure transformation over one ladder's in-memory
/// state. The database executor loads a ladder snapshot, runs the steps in
/// the fixed order below, and persists every row whose `updated_at` was
/// stamped with `as_of`:
///
/// 1. Inactivity decay (σ grows while a player sits out)
/// 2. Synergy decay and regularization (γ drifts to zero)
/// 3. Region mean-centering
/// 4. Graph smoothing of provisional players
/// 5. Drift control (z-standardization, capped per day)
/// 6. Offset shrinkage (see [`crate::model::sex_offset`])
///
/// Stamping `updated_at = as_of` on every row a step writes is what makes a
/// same-day rerun a no-op: the decay steps see zero elapsed weeks, and the
/// executor skips ladders already stamped at `as_of`.
fn elapsed_weeks(updated_at: Option<DateTime<FixedOffset>>, as_of: DateTime<FixedOffset>) -> f64 {
    match updated_at {
        Some(t) if t < as_of => (as_of - t).num_seconds() as f64 / SECONDS_PER_WEEK,
        _ => 0.0
    }
}

/// Step 1: grow σ for idle players, after a grace period.
pub fn apply_inactivity_decay(
    players: &mut [PlayerState],
    as_of: DateTime<FixedOffset>,
    idle: &IdleParams,
    rating: &RatingParams
) -> usize {
    let grace_weeks = idle.activation_days / 7.0;
    let sigma_max = rating.sigma_max();

    players
        .par_iter_mut()
        .map(|state| {
            let weeks = elapsed_weeks(state.updated_at, as_of);
            let effective = (weeks - grace_weeks).max(0.0);
            if effective <= 0.0 {
                return 0;
            }

            let grown = (state.sigma * state.sigma * (1.0 + idle.rate_per_week).powf(effective)).sqrt();
            let new_sigma = grown.min(sigma_max);
            if (new_sigma - state.sigma).abs() <= CHANGE_EPSILON {
                return 0;
            }

            state.sigma = new_sigma;
            state.updated_at = Some(as_of);
            1
        })
        .sum()
}

/// Step 2: pull pair synergies toward zero.
pub fn apply_synergy_decay(pairs: &mut [PairState], as_of: DateTime<FixedOffset>, synergy: &SynergyParams) -> usize {
    let mut changed = 0;
    for pair in pairs.iter_mut() {
        let weeks = elapsed_weeks(pair.updated_at, as_of);
        if weeks <= 0.0 {
            continue;
        }

        let decayed = pair.gamma * (1.0 - synergy.decay_rate_per_week).powf(weeks) * (1.0 - synergy.regularization);
        let new_gamma = decayed.clamp(synergy.gamma_min, synergy.gamma_max);
        if (new_gamma - pair.gamma).abs() <= CHANGE_EPSILON {
            continue;
        }

        pair.gamma = new_gamma;
        pair.updated_at = Some(as_of);
        changed += 1;
    }
    changed
}

/// Step 3: remove per-region mean drift relative to the global mean.
pub fn apply_region_centering(
    players: &mut [PlayerState],
    regions: &HashMap<i64, String>,
    params: &RegionParams,
    as_of: DateTime<FixedOffset>
) -> usize {
    if players.is_empty() {
        return 0;
    }

    let global_mean = players.iter().map(|p| p.mu).sum::<f64>() / players.len() as f64;

    let mut region_sums: HashMap<&str, (f64, usize)> = HashMap::new();
    for player in players.iter() {
        let region = regions.get(&player.player_id).map(String::as_str).unwrap_or(DEFAULT_REGION);
        if region == DEFAULT_REGION {
            continue;
        }
        let entry = region_sums.entry(region).or_insert((0.0, 0));
        entry.0 += player.mu;
        entry.1 += 1;
    }

    let shifts: HashMap<&str, f64> = region_sums
        .into_iter()
        .map(|(region, (sum, count))| {
            let mean = sum / count as f64;
            let shift = (mean - global_mean).clamp(-params.max_shift_per_day, params.max_shift_per_day);
            (region, shift)
        })
        .collect();

    let mut changed = 0;
    for player in players.iter_mut() {
        let region = regions.get(&player.player_id).map(String::as_str).unwrap_or(DEFAULT_REGION);
        let Some(&shift) = shifts.get(region) else { continue };
        if shift.abs() <= CHANGE_EPSILON {
            continue;
        }
        player.mu -= shift;
        player.updated_at = Some(as_of);
        changed += 1;
    }
    changed
}

/// Step 4: pull settled (provisional-σ) players toward the mean of their
/// recent opponents and partners.
///
/// Neighbor means are computed from the pre-step snapshot so the outcome
/// does not depend on iteration order.
pub fn apply_graph_smoothing(
    players: &mut [PlayerState],
    edges: &[(i64, i64)],
    params: &GraphParams,
    as_of: DateTime<FixedOffset>
) -> usize {
    if edges.is_empty() {
        return 0;
    }

    let snapshot: HashMap<i64, f64> = players.iter().map(|p| (p.player_id, p.mu)).collect();

    let mut adjacency: HashMap<i64, HashSet<i64>> = HashMap::new();
    for &(a, b) in edges {
        if a == b {
            continue;
        }
        adjacency.entry(a).or_default().insert(b);
        adjacency.entry(b).or_default().insert(a);
    }

    let mut changed = 0;
    for player in players.iter_mut() {
        if player.sigma > params.sigma_provisional {
            continue;
        }
        let Some(neighbors) = adjacency.get(&player.player_id) else { continue };

        let known: Vec<f64> = neighbors.iter().filter_map(|id| snapshot.get(id).copied()).collect();
        if known.is_empty() {
            continue;
        }
        let neighbor_mean = known.iter().sum::<f64>() / known.len() as f64;

        let delta = params.smoothing_lambda * (player.mu - neighbor_mean);
        if delta.abs() <= CHANGE_EPSILON {
            continue;
        }
        player.mu -= delta;
        player.updated_at = Some(as_of);
        changed += 1;
    }
    changed
}

/// Step 5: z-standardize the ladder toward the target distribution, with
/// the per-player movement capped.
pub fn apply_drift_control(
    players: &mut [PlayerState],
    params: &DriftParams,
    base_mu: f64,
    as_of: DateTime<FixedOffset>
) -> usize {
    if players.len() < 2 {
        return 0;
    }

    let n = players.len() as f64;
    let mean = players.iter().map(|p| p.mu).sum::<f64>() / n;
    let variance = players.iter().map(|p| (p.mu - mean) * (p.mu - mean)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std <= CHANGE_EPSILON {
        debug!("drift control skipped: degenerate μ distribution");
        return 0;
    }

    let mut changed = 0;
    for player in players.iter_mut() {
        let target = base_mu + (player.mu - mean) / std * params.target_std;
        let delta = (target - player.mu).clamp(-params.max_daily_delta, params.max_daily_delta);
        if delta.abs() <= CHANGE_EPSILON {
            continue;
        }
        player.mu += delta;
        player.updated_at = Some(as_of);
        changed += 1;
    }
    changed
}

/// Runs the full nightly pass over every ladder inside one database
/// transaction: either the whole night applies or none of it does. A
/// ladder already stamped at `as_of` is skipped outright, which is what
/// makes a same-day rerun an exact no-op.
pub async fn run_nightly_stabilization(
    db: &crate::database::DbClient,
    params: &crate::model::constants::Params,
    as_of: Option<DateTime<FixedOffset>>,
    horizon_days: Option<i64>
) -> Result<(), crate::database::StoreError> {
    let as_of = as_of.unwrap_or_else(|| chrono::Utc::now().fixed_offset());
    let horizon_days = horizon_days.unwrap_or(params.graph.horizon_days);
    let ladders = db.all_ladders().await?;
    let offset_ladders: std::collections::HashSet<String> = db.ladders_with_offsets().await?.into_iter().collect();

    let bar = crate::utils::progress_utils::progress_bar(ladders.len() as u64);
    bar.println(format!("Nightly stabilization as of {as_of}"));

    db.begin().await?;
    for ladder in ladders {
        if ladder.updated_at >= as_of {
            debug!("ladder {} already stabilized at {}", ladder.ladder_id, as_of);
            bar.inc(1);
            continue;
        }

        if let Err(e) = stabilize_ladder(
            db,
            params,
            &ladder.ladder_id,
            as_of,
            horizon_days,
            offset_ladders.contains(&ladder.ladder_id)
        )
        .await
        {
            let _ = db.rollback().await;
            return Err(e);
        }
        bar.inc(1);
    }
    db.commit().await?;
    bar.finish();
    Ok(())
}

async fn stabilize_ladder(
    db: &crate::database::DbClient,
    params: &crate::model::constants::Params,
    ladder_id: &str,
    as_of: DateTime<FixedOffset>,
    horizon_days: i64,
    has_offsets: bool
) -> Result<(), crate::database::StoreError> {
    db.lock_ladder(ladder_id).await?;

    let mut players: Vec<PlayerState> = db
        .ladder_ratings(ladder_id)
        .await?
        .into_iter()
        .map(|row| PlayerState {
            player_id: row.player_id,
            mu: row.mu,
            sigma: row.sigma,
            matches_count: row.matches_count as u32,
            updated_at: Some(row.updated_at)
        })
        .collect();
    let mut pairs: Vec<PairState> = db
        .ladder_pair_synergies(ladder_id)
        .await?
        .into_iter()
        .map(|row| PairState {
            pair_key: row.pair_key,
            players: row.players,
            gamma: row.gamma,
            matches: row.matches as u32,
            updated_at: Some(row.updated_at)
        })
        .collect();

    let regions = db.player_regions(ladder_id).await?;
    let horizon = as_of - Duration::days(horizon_days);
    let edges: Vec<(i64, i64)> = db
        .recent_match_participants(ladder_id, horizon)
        .await?
        .iter()
        .flat_map(|participants| {
            use itertools::Itertools;
            participants.iter().copied().tuple_combinations::<(i64, i64)>().collect::<Vec<_>>()
        })
        .collect();

    let decayed = apply_inactivity_decay(&mut players, as_of, &params.idle, &params.rating);
    let pairs_decayed = apply_synergy_decay(&mut pairs, as_of, &params.synergy);
    let recentered = apply_region_centering(&mut players, &regions, &params.region, as_of);
    let smoothed = apply_graph_smoothing(&mut players, &edges, &params.graph, as_of);
    let drifted = apply_drift_control(&mut players, &params.drift, params.rating.base_mu, as_of);
    debug!(
        "ladder {}: decay {}, synergy {}, region {}, graph {}, drift {}",
        ladder_id, decayed, pairs_decayed, recentered, smoothed, drifted
    );

    for state in players.iter().filter(|p| p.updated_at == Some(as_of)) {
        db.upsert_player_rating(ladder_id, state, as_of).await?;
    }
    for state in pairs.iter().filter(|p| p.updated_at == Some(as_of)) {
        db.upsert_pair_synergy(ladder_id, state, as_of).await?;
    }

    if has_offsets {
        let mut offsets = db.get_sex_offsets(ladder_id).await?;
        offsets.shrink(&params.sex_offsets);
        db.upsert_sex_offsets(ladder_id, &offsets, as_of).await?;
    }

    db.stamp_ladder(ladder_id, as_of).await?;
    Ok(())
}
