use crate::{
    database::{
        db_structs::{MatchRow, MatchTiming},
        DbClient, StoreError
    },
    model::{
        constants::Params,
        engine::rate_match,
        ladder_tracker::{LadderTracker, PlayerState},
        replay::is_inter_sex,
        sex_offset::{offsets_eligible, EligibilityCache},
        structures::{LadderKey, MatchInput, RatingStatus, Side}
    }
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// Submission handed to the recorder after provider-side normalization.
#[derive(Debug, Clone)]
pub struct RecordMatchParams {
    pub provider_id: String,
    pub external_ref: Option<String>,
    pub organization_id: i64,
    pub ladder: LadderKey,
    pub input: MatchInput,
    pub start_time: Option<DateTime<FixedOffset>>,
    pub timing: Option<MatchTiming>,
    pub stage: Option<String>,
    pub raw_payload: Value,
    pub rating_status: RatingStatus,
    pub rating_skip_reason: Option<String>
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedRatingEvent {
    pub player_id: i64,
    pub rating_event_id: i64,
    pub applied_at: DateTime<FixedOffset>
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedMatch {
    pub match_id: Uuid,
    pub rating_events: Vec<RecordedRatingEvent>
}

/// Match Recorder
///
/// Persists one submission atomically: the match itself, the rating update,
/// history rows, pair updates, the sex-offset write and — when the match
/// arrived out of order — the replay enqueue. Identical resubmissions by
/// `(provider_id, external_ref)` return the original result without
/// touching any state.
pub struct MatchRecorder {
    db: DbClient,
    params: Params,
    eligibility: EligibilityCache
}

impl MatchRecorder {
    pub fn new(db: DbClient, params: Params) -> Self {
        let eligibility = EligibilityCache::new(&params.sex_offsets);
        Self {
            db,
            params,
            eligibility
        }
    }

    pub async fn record(&mut self, submission: RecordMatchParams) -> Result<RecordedMatch, StoreError> {
        let start_time = submission.start_time.ok_or(StoreError::MissingStartTime)?;
        let ladder_id = submission.ladder.ladder_id();

        self.db.begin().await?;
        match self.record_inner(&submission, start_time, &ladder_id).await {
            Ok(recorded) => {
                self.db.commit().await?;
                Ok(recorded)
            }
            Err(error) => {
                let _ = self.db.rollback().await;
                Err(error)
            }
        }
    }

    async fn record_inner(
        &mut self,
        submission: &RecordMatchParams,
        start_time: DateTime<FixedOffset>,
        ladder_id: &str
    ) -> Result<RecordedMatch, StoreError> {
        self.db.lock_ladder(ladder_id).await?;

        // Full idempotency: a known external ref returns the original
        // events in their original order, with no writes at all.
        if let Some(external_ref) = &submission.external_ref {
            if let Some(match_id) = self
                .db
                .find_match_by_external_ref(&submission.provider_id, external_ref)
                .await?
            {
                debug!("duplicate submission for match {}, replaying stored result", match_id);
                let events = self.db.rating_events_for_match(match_id).await?;
                return Ok(RecordedMatch {
                    match_id,
                    rating_events: events
                        .into_iter()
                        .map(|event| RecordedRatingEvent {
                            player_id: event.player_id,
                            rating_event_id: event.id,
                            applied_at: event.created_at
                        })
                        .collect()
                });
            }
        }

        let match_id = Uuid::new_v4();
        let applied_at = submission
            .timing
            .as_ref()
            .and_then(|t| t.completed_at)
            .unwrap_or(start_time);

        self.db.ensure_ladder(&submission.ladder).await?;

        // Registry is authoritative for sex; override whatever the provider
        // sent before the engine counts anything.
        let mut input = submission.input.clone();
        let player_ids = input.all_player_ids();
        let players = self
            .db
            .get_players_checked(&player_ids, submission.organization_id)
            .await?;
        for (slot, player) in input
            .side_a
            .players
            .iter_mut()
            .chain(input.side_b.players.iter_mut())
            .zip(players.iter())
        {
            slot.sex = player.sex;
        }

        let rating_rows = self
            .db
            .ensure_player_ratings(ladder_id, &player_ids, &self.params.rating, applied_at)
            .await?;
        let mut tracker = LadderTracker::new(ladder_id);
        for row in &rating_rows {
            tracker.insert_player(PlayerState {
                player_id: row.player_id,
                mu: row.mu,
                sigma: row.sigma,
                matches_count: row.matches_count as u32,
                updated_at: Some(row.updated_at)
            });
        }

        let pairs: Vec<Vec<i64>> = [&input.side_a, &input.side_b]
            .into_iter()
            .filter(|side| side.is_pair())
            .map(|side| side.player_ids())
            .collect();
        if !pairs.is_empty() {
            for state in self
                .db
                .ensure_pair_synergies(ladder_id, &pairs, applied_at)
                .await?
                .into_values()
            {
                tracker.insert_pair(state);
            }
        }

        let mut rating_events = Vec::new();
        let mut winner_side = input.winner;

        if submission.rating_status == RatingStatus::Rated {
            let result = rate_match(&input, &mut tracker, &self.params);
            winner_side = Some(input.resolve_winner());

            self.apply_offset_signal(ladder_id, &result, applied_at).await?;

            for change in &result.per_player {
                let state = tracker
                    .player(change.player_id)
                    .expect("engine participants are loaded above");
                self.db.upsert_player_rating(ladder_id, state, applied_at).await?;

                let event_id = self
                    .db
                    .insert_rating_event(ladder_id, match_id, change, result.mov_weight, applied_at)
                    .await?;
                rating_events.push(RecordedRatingEvent {
                    player_id: change.player_id,
                    rating_event_id: event_id,
                    applied_at
                });
            }

            for update in &result.pair_updates {
                let state = tracker.pair(&update.pair_key).expect("pair states are loaded above");
                self.db.upsert_pair_synergy(ladder_id, state, applied_at).await?;
                self.db
                    .insert_pair_history(
                        ladder_id,
                        match_id,
                        &update.pair_key,
                        update.gamma_before,
                        update.gamma_after,
                        update.delta,
                        applied_at
                    )
                    .await?;
            }

            // The stored history must reflect every change we just made; a
            // gap here would silently corrupt any future replay.
            let stored = self.db.rating_events_for_match(match_id).await?;
            if stored.len() != result.per_player.len() {
                return Err(StoreError::ReplayIntegrity(format!(
                    "match {}: wrote {} rating events, found {}",
                    match_id,
                    result.per_player.len(),
                    stored.len()
                )));
            }
        }

        self.db
            .insert_match(&MatchRow {
                match_id,
                ladder_id: ladder_id.to_string(),
                provider_id: submission.provider_id.clone(),
                external_ref: submission.external_ref.clone(),
                organization_id: submission.organization_id,
                sport: input.sport,
                discipline: input.discipline,
                format: input.format.clone(),
                tier: input.tier,
                stage: submission.stage.clone(),
                start_time,
                timing: submission.timing.clone(),
                raw_payload: submission.raw_payload.clone(),
                rating_status: submission.rating_status,
                rating_skip_reason: submission.rating_skip_reason.clone(),
                winner_side,
                created_at: Utc::now().fixed_offset()
            })
            .await?;
        self.db
            .insert_match_side(match_id, Side::A, &input.side_a.player_ids())
            .await?;
        self.db
            .insert_match_side(match_id, Side::B, &input.side_b.player_ids())
            .await?;
        self.db.insert_match_games(match_id, &input.games).await?;

        // A match older than the ladder's newest one invalidates everything
        // after it; queue a rebuild from the earliest affected point.
        if let Some(max_start) = self.db.max_start_time(ladder_id).await? {
            if start_time < max_start {
                info!(
                    "late arrival on ladder {} ({} < {}), queueing replay",
                    ladder_id, start_time, max_start
                );
                self.db.enqueue_replay(ladder_id, start_time).await?;
            }
        }

        Ok(RecordedMatch {
            match_id,
            rating_events
        })
    }

    /// Offset handling for one rated match: gate (with the cached
    /// eligibility decision), apply, persist, invalidate.
    async fn apply_offset_signal(
        &mut self,
        ladder_id: &str,
        result: &crate::model::structures::MatchRatingResult,
        applied_at: DateTime<FixedOffset>
    ) -> Result<(), StoreError> {
        let Some(signal) = result.sex_offset else {
            return Ok(());
        };
        if !self.params.sex_offsets.enabled {
            return Ok(());
        }

        // The row is authoritative and is re-read under the ladder lock;
        // the cache only memoizes the (expensive) edge-count decision.
        let mut offsets = self.db.get_sex_offsets(ladder_id).await?;

        let eligible = match self.eligibility.get(ladder_id) {
            Some(cached) => cached,
            None => {
                let edges = self
                    .db
                    .inter_sex_edge_count_90d(ladder_id, Utc::now().fixed_offset())
                    .await?;
                let eligible = offsets_eligible(edges, &offsets, &self.params.sex_offsets);
                self.eligibility.put(ladder_id, eligible);
                eligible
            }
        };

        if eligible && is_inter_sex(&signal) {
            offsets.apply_signal(&signal, &self.params.sex_offsets);
            self.db.upsert_sex_offsets(ladder_id, &offsets, applied_at).await?;
            self.eligibility.invalidate(ladder_id);
        }

        Ok(())
    }
}
