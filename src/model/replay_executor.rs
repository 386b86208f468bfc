use crate::{
    database::{db_structs::StoredMatch, DbClient, StoreError},
    messaging::RabbitMqPublisher,
    model::{
        constants::Params,
        replay::{run_replay, ReplayMatch, ReplayOutcome, ReplayReport},
        structures::{MatchInput, RatingStatus, Side, SideInput, SidePlayer}
    },
    utils::progress_utils::progress_bar
};
use chrono::Utc;
use itertools::Itertools;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Replay Executor
///
/// Rebuilds one ladder at a time from its raw match stream, entirely inside
/// a single transaction: derived state is truncated, the pure replay core
/// recomputes everything, and the final rows are batch-written. On any
/// failure the transaction rolls back and the queue entry stays put for the
/// next pass.
pub struct ReplayExecutor {
    db: DbClient,
    params: Params,
    publisher: Option<RabbitMqPublisher>
}

impl ReplayExecutor {
    pub fn new(db: DbClient, params: Params, publisher: Option<RabbitMqPublisher>) -> Self {
        Self {
            db,
            params,
            publisher
        }
    }

    /// Replays one ladder. `from` narrows the stream for dry-run
    /// inspection; destructive runs always rebuild from the beginning so
    /// the truncated state can be fully reconstructed.
    pub async fn replay_ladder(
        &self,
        ladder_id: &str,
        from: Option<chrono::DateTime<chrono::FixedOffset>>,
        dry_run: bool
    ) -> Result<ReplayReport, StoreError> {
        let from = if dry_run { from } else { None };

        self.db.begin().await?;
        let result = self.replay_inner(ladder_id, from, dry_run).await;
        match result {
            Ok((report, outcome)) => {
                self.db.commit().await?;
                if !dry_run {
                    self.publish_insight_refresh(ladder_id, &outcome).await;
                }
                Ok(report)
            }
            Err(error) => {
                let _ = self.db.rollback().await;
                Err(error)
            }
        }
    }

    async fn replay_inner(
        &self,
        ladder_id: &str,
        from: Option<chrono::DateTime<chrono::FixedOffset>>,
        dry_run: bool
    ) -> Result<(ReplayReport, ReplayOutcome), StoreError> {
        self.db.lock_ladder(ladder_id).await?;

        let stored = self.db.load_ladder_matches(ladder_id, from).await?;
        let stored_weights = self.db.first_event_mov_weights(ladder_id).await?;

        let replay_matches: Vec<ReplayMatch> = stored
            .iter()
            .filter(|m| m.rating_status == RatingStatus::Rated)
            .map(|m| reconstruct_match(m, stored_weights.get(&m.match_id).copied()))
            .collect();

        info!(
            "replaying ladder {}: {} rated matches ({} stored){}",
            ladder_id,
            replay_matches.len(),
            stored.len(),
            if dry_run { " [dry run]" } else { "" }
        );

        let outcome = run_replay(ladder_id, &replay_matches, &self.params);
        let replay_timestamp = Utc::now().fixed_offset();

        let report = ReplayReport {
            ladder_id: ladder_id.to_string(),
            matches_processed: outcome.matches_processed,
            players_touched: outcome.tracker.player_count(),
            pair_updates: outcome.pair_history.len(),
            replay_from: replay_matches.first().map(|m| m.start_time),
            replay_to: replay_matches.last().map(|m| m.start_time),
            dry_run
        };

        if dry_run {
            return Ok((report, outcome));
        }

        // First (and only) mutation point: wipe the derived state, then
        // rewrite it from the outcome.
        self.db.truncate_ladder_derived_state(ladder_id).await?;
        self.db.delete_sex_offsets(ladder_id).await?;

        let bar = progress_bar(outcome.player_history.len() as u64);
        bar.println(format!("Writing replayed history for {ladder_id}"));
        for batch in outcome.player_history.chunks(self.params.replay.batch_size) {
            for row in batch {
                self.db
                    .insert_rating_event(
                        ladder_id,
                        row.match_id,
                        &crate::model::structures::PlayerRatingChange {
                            player_id: row.player_id,
                            mu_before: row.mu_before,
                            mu_after: row.mu_after,
                            delta: row.delta,
                            sigma_before: row.sigma_before,
                            sigma_after: row.sigma_after,
                            win_prob_pre: row.win_prob_pre
                        },
                        row.mov_weight,
                        row.created_at
                    )
                    .await?;
                bar.inc(1);
            }
        }
        bar.finish();

        for row in &outcome.pair_history {
            self.db
                .insert_pair_history(
                    ladder_id,
                    row.match_id,
                    &row.pair_key,
                    row.gamma_before,
                    row.gamma_after,
                    row.delta,
                    row.created_at
                )
                .await?;
        }

        for state in outcome.tracker.players() {
            let updated_at = state.updated_at.unwrap_or(replay_timestamp);
            self.db.upsert_player_rating(ladder_id, state, updated_at).await?;
        }
        for state in outcome.tracker.pairs() {
            let updated_at = state.updated_at.unwrap_or(replay_timestamp);
            self.db.upsert_pair_synergy(ladder_id, state, updated_at).await?;
        }
        self.db
            .upsert_sex_offsets(
                ladder_id,
                &outcome.offsets,
                outcome.offsets.updated_at.unwrap_or(replay_timestamp)
            )
            .await?;

        self.db.delete_replay_queue_entry(ladder_id).await?;

        Ok((report, outcome))
    }

    /// Drains up to `limit` queue entries, oldest first. A failed ladder is
    /// logged and left queued; the scheduler retries it on its own cadence.
    pub async fn process_queue(&self, limit: Option<usize>, dry_run: bool) -> Result<Vec<ReplayReport>, StoreError> {
        let limit = limit.unwrap_or(self.params.replay.queue_limit);
        let entries = self.db.replay_queue_entries(limit as i64).await?;
        info!("replay queue pass: {} ladder(s)", entries.len());

        let mut reports = Vec::new();
        for entry in entries {
            match self.replay_ladder(&entry.ladder_id, None, dry_run).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("replay of ladder {} failed, leaving queued: {}", entry.ladder_id, e);
                }
            }
        }
        Ok(reports)
    }

    /// Best-effort fanout so downstream insight generation picks up the
    /// rewritten histories. Failures are logged, never propagated: the
    /// replay itself already committed.
    async fn publish_insight_refresh(&self, ladder_id: &str, outcome: &ReplayOutcome) {
        let Some(publisher) = &self.publisher else {
            warn!("no message broker configured, skipping insight refresh for {}", ladder_id);
            return;
        };

        let Ok(Some(ladder)) = self.db.get_ladder(ladder_id).await else {
            warn!("ladder {} vanished before insight refresh", ladder_id);
            return;
        };

        let player_ids: Vec<i64> = outcome.tracker.players().map(|p| p.player_id).collect();
        let organizations = match self.db.player_organizations(&player_ids).await {
            Ok(map) => map,
            Err(e) => {
                warn!("failed to resolve organizations for insight refresh: {}", e);
                return;
            }
        };

        let targets: Vec<(i64, i64)> = player_ids
            .iter()
            .filter_map(|id| organizations.get(id).map(|org| (*id, *org)))
            .unique()
            .collect();

        for (player_id, organization_id) in targets {
            if let Err(e) = publisher
                .publish_insight_refresh(player_id, organization_id, ladder.sport, ladder.discipline, None)
                .await
            {
                warn!("insight refresh for player {} failed: {}", player_id, e);
            }
        }
    }
}

/// Rebuilds the engine input from a stored match. The winner comes from the
/// raw payload when present; the stored margin weight (if any) pins the MoV
/// so a replay cannot diverge from the online run.
fn reconstruct_match(stored: &StoredMatch, stored_mov: Option<f64>) -> ReplayMatch {
    let raw_winner = stored
        .raw_payload
        .get("winner")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Side>().ok());
    let raw_mov = stored.raw_payload.get("movWeight").and_then(|v| v.as_f64());

    ReplayMatch {
        match_id: stored.match_id,
        start_time: stored.start_time,
        applied_at: stored.applied_at(),
        input: MatchInput {
            sport: stored.sport,
            discipline: stored.discipline,
            format: None,
            tier: stored.tier,
            side_a: side_input(&stored.side_a),
            side_b: side_input(&stored.side_b),
            games: stored.games.clone(),
            mov_weight: raw_mov.or(stored_mov),
            winner: raw_winner.or(stored.winner_side)
        }
    }
}

fn side_input(players: &[(i64, crate::model::structures::Sex)]) -> SideInput {
    SideInput {
        players: players
            .iter()
            .map(|&(player_id, sex)| SidePlayer { player_id, sex })
            .collect()
    }
}
