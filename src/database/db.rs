use crate::{
    database::db_structs::{
        Ladder, MatchRow, PairSynergyRow, Player, PlayerRatingRow, PlayerRatingView, RatingEvent, RatingEventPage,
        RatingSnapshot, ReplayQueueEntry, StoredMatch
    },
    model::{
        constants::RatingParams,
        ladder_tracker::{PairState, PlayerState},
        sex_offset::OffsetState,
        structures::{GameScore, LadderKey, Sex, Side}
    }
};
use chrono::{DateTime, FixedOffset};
use futures::{pin_mut, TryStreamExt};
use postgres_types::ToSql;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{info, warn};

/// Errors surfaced by the ladder store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("unknown or cross-tenant players (missing: {missing:?}, wrong organization: {wrong_organization:?})")]
    PlayerLookup {
        missing: Vec<i64>,
        wrong_organization: Vec<i64>
    },

    #[error("match {0} not found for this organization")]
    MatchLookup(String),

    #[error("competition/event mismatch: {0}")]
    EventLookup(String),

    #[error("rating history integrity violation: {0}")]
    ReplayIntegrity(String),

    #[error("match has neither completedAt nor startTime")]
    MissingStartTime,

    #[error("failed to decode stored payload: {0}")]
    Payload(#[from] serde_json::Error)
}

/// Filter for the rating-event listing API.
#[derive(Debug, Clone, Default)]
pub struct RatingEventQuery {
    pub player_id: Option<i64>,
    pub ladder_id: Option<String>,
    pub limit: i64,
    pub offset: i64
}

/// Ladder Store
///
/// Owns every persistence contract of the rating core: ladders, ratings,
/// history, pair synergies, sex offsets, matches and the replay queue.
/// Transactions are session-scoped (`BEGIN`/`COMMIT` on the single
/// connection), and the per-ladder critical section is a transaction-scoped
/// advisory lock, so two writers can never interleave inside one ladder.
#[derive(Clone)]
pub struct DbClient {
    client: Arc<Client>
}

impl DbClient {
    // Connect to the database and return a DbClient instance
    pub async fn connect(connection_str: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(connection_str, NoTls).await?;

        // Spawn the connection object to run in the background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("connection error: {}", e);
            }
        });

        Ok(DbClient {
            client: Arc::new(client)
        })
    }

    /// Creates every table the core relies on. Idempotent.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        self.client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS rating_ladders (
            ladder_id TEXT PRIMARY KEY,
            sport TEXT NOT NULL,
            discipline TEXT NOT NULL,
            default_age_cutoff DATE,
            age_bands JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE TABLE IF NOT EXISTS players (
            player_id BIGINT PRIMARY KEY,
            organization_id BIGINT NOT NULL,
            sex TEXT NOT NULL DEFAULT 'U',
            region TEXT NOT NULL DEFAULT 'DEFAULT',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE TABLE IF NOT EXISTS player_ratings (
            player_id BIGINT NOT NULL,
            ladder_id TEXT NOT NULL,
            mu DOUBLE PRECISION NOT NULL,
            sigma DOUBLE PRECISION NOT NULL,
            matches_count INT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (player_id, ladder_id)
        );
        CREATE TABLE IF NOT EXISTS player_rating_history (
            id BIGSERIAL PRIMARY KEY,
            player_id BIGINT NOT NULL,
            ladder_id TEXT NOT NULL,
            match_id UUID NOT NULL,
            mu_before DOUBLE PRECISION NOT NULL,
            mu_after DOUBLE PRECISION NOT NULL,
            sigma_before DOUBLE PRECISION NOT NULL,
            sigma_after DOUBLE PRECISION NOT NULL,
            delta DOUBLE PRECISION NOT NULL,
            win_prob_pre DOUBLE PRECISION NOT NULL,
            mov_weight DOUBLE PRECISION NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_ladder_time
            ON player_rating_history (ladder_id, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_history_player
            ON player_rating_history (player_id, ladder_id, created_at, id);
        CREATE TABLE IF NOT EXISTS pair_synergies (
            ladder_id TEXT NOT NULL,
            pair_key TEXT NOT NULL,
            players BIGINT[] NOT NULL,
            gamma DOUBLE PRECISION NOT NULL,
            matches INT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (ladder_id, pair_key)
        );
        CREATE TABLE IF NOT EXISTS pair_synergy_history (
            id BIGSERIAL PRIMARY KEY,
            ladder_id TEXT NOT NULL,
            pair_key TEXT NOT NULL,
            match_id UUID NOT NULL,
            gamma_before DOUBLE PRECISION NOT NULL,
            gamma_after DOUBLE PRECISION NOT NULL,
            delta DOUBLE PRECISION NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        );
        CREATE TABLE IF NOT EXISTS ladder_sex_offsets (
            ladder_id TEXT NOT NULL,
            sex TEXT NOT NULL,
            bias DOUBLE PRECISION NOT NULL,
            matches INT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (ladder_id, sex)
        );
        CREATE TABLE IF NOT EXISTS rating_replay_queue (
            ladder_id TEXT PRIMARY KEY,
            earliest_start_time TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE TABLE IF NOT EXISTS matches (
            match_id UUID PRIMARY KEY,
            ladder_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            external_ref TEXT,
            organization_id BIGINT NOT NULL,
            sport TEXT NOT NULL,
            discipline TEXT NOT NULL,
            format TEXT,
            tier SMALLINT,
            stage TEXT,
            start_time TIMESTAMPTZ NOT NULL,
            timing JSONB,
            raw_payload JSONB NOT NULL,
            rating_status SMALLINT NOT NULL,
            rating_skip_reason TEXT,
            winner_side TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_provider_ref
            ON matches (provider_id, external_ref) WHERE external_ref IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_matches_ladder_time
            ON matches (ladder_id, start_time, match_id);
        CREATE TABLE IF NOT EXISTS match_sides (
            id BIGSERIAL PRIMARY KEY,
            match_id UUID NOT NULL,
            side TEXT NOT NULL,
            players_count INT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS match_side_players (
            match_side_id BIGINT NOT NULL,
            player_id BIGINT NOT NULL,
            position INT NOT NULL,
            PRIMARY KEY (match_side_id, player_id)
        );
        CREATE TABLE IF NOT EXISTS match_games (
            match_id UUID NOT NULL,
            game_no INT NOT NULL,
            score_a INT NOT NULL,
            score_b INT NOT NULL,
            statistics JSONB,
            segments JSONB,
            PRIMARY KEY (match_id, game_no)
        );
        "
            )
            .await?;
        info!("schema applied");
        Ok(())
    }

    // Transaction control. The client holds one connection, so session
    // transactions serialize naturally.

    pub async fn begin(&self) -> Result<(), StoreError> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<(), StoreError> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), StoreError> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    /// Per-ladder critical section, released automatically on commit or
    /// rollback.
    pub async fn lock_ladder(&self, ladder_id: &str) -> Result<(), StoreError> {
        self.client
            .execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&ladder_id])
            .await?;
        Ok(())
    }

    // Ladders

    pub async fn ensure_ladder(&self, key: &LadderKey) -> Result<Ladder, StoreError> {
        let ladder_id = key.ladder_id();
        self.client
            .execute(
                "INSERT INTO rating_ladders (ladder_id, sport, discipline)
                 VALUES ($1, $2, $3) ON CONFLICT (ladder_id) DO NOTHING",
                &[&ladder_id, &key.sport, &key.discipline]
            )
            .await?;

        let row = self
            .client
            .query_one("SELECT * FROM rating_ladders WHERE ladder_id = $1", &[&ladder_id])
            .await?;
        Ok(ladder_from_row(&row))
    }

    pub async fn get_ladder(&self, ladder_id: &str) -> Result<Option<Ladder>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM rating_ladders WHERE ladder_id = $1", &[&ladder_id])
            .await?;
        Ok(row.as_ref().map(ladder_from_row))
    }

    pub async fn all_ladders(&self) -> Result<Vec<Ladder>, StoreError> {
        let rows = self
            .client
            .query("SELECT * FROM rating_ladders ORDER BY ladder_id", &[])
            .await?;
        Ok(rows.iter().map(ladder_from_row).collect())
    }

    pub async fn stamp_ladder(&self, ladder_id: &str, as_of: DateTime<FixedOffset>) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE rating_ladders SET updated_at = $2 WHERE ladder_id = $1",
                &[&ladder_id, &as_of]
            )
            .await?;
        Ok(())
    }

    // Players

    /// Loads the registry rows for the given players and verifies that all
    /// of them exist and belong to the caller's organization.
    pub async fn get_players_checked(&self, ids: &[i64], organization_id: i64) -> Result<Vec<Player>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT player_id, organization_id, sex, region FROM players WHERE player_id = ANY($1)",
                &[&ids]
            )
            .await?;

        let by_id: HashMap<i64, Player> = rows
            .iter()
            .map(|row| {
                let player = Player {
                    player_id: row.get("player_id"),
                    organization_id: row.get("organization_id"),
                    sex: row.get("sex"),
                    region: row.get("region")
                };
                (player.player_id, player)
            })
            .collect();

        let missing: Vec<i64> = ids.iter().copied().filter(|id| !by_id.contains_key(id)).collect();
        let wrong_organization: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| {
                by_id
                    .get(id)
                    .is_some_and(|player| player.organization_id != organization_id)
            })
            .collect();

        if !missing.is_empty() || !wrong_organization.is_empty() {
            return Err(StoreError::PlayerLookup {
                missing,
                wrong_organization
            });
        }

        // Preserve the caller's ordering.
        Ok(ids.iter().map(|id| by_id[id].clone()).collect())
    }

    /// One-call bootstrap: resolves (and creates, if needed) the ladder,
    /// verifies tenant membership for every player, and seeds missing
    /// rating rows. Returns the ladder id and the states in caller order.
    pub async fn ensure_players(
        &self,
        ids: &[i64],
        key: &LadderKey,
        organization_id: i64,
        params: &RatingParams
    ) -> Result<(String, Vec<PlayerRatingRow>), StoreError> {
        let ladder = self.ensure_ladder(key).await?;
        self.get_players_checked(ids, organization_id).await?;
        let states = self
            .ensure_player_ratings(&ladder.ladder_id, ids, params, chrono::Utc::now().fixed_offset())
            .await?;
        Ok((ladder.ladder_id, states))
    }

    pub async fn player_regions(&self, ladder_id: &str) -> Result<HashMap<i64, String>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT pr.player_id, p.region FROM player_ratings pr
                 JOIN players p ON p.player_id = pr.player_id
                 WHERE pr.ladder_id = $1",
                &[&ladder_id]
            )
            .await?;
        Ok(rows.iter().map(|row| (row.get("player_id"), row.get("region"))).collect())
    }

    // Player ratings

    /// Seeds the prior for any first-touch players, then returns the
    /// current state rows in the caller's order.
    pub async fn ensure_player_ratings(
        &self,
        ladder_id: &str,
        ids: &[i64],
        params: &RatingParams,
        now: DateTime<FixedOffset>
    ) -> Result<Vec<PlayerRatingRow>, StoreError> {
        self.client
            .execute(
                "INSERT INTO player_ratings (player_id, ladder_id, mu, sigma, matches_count, updated_at)
                 SELECT pid, $2, $3, $4, 0, $5 FROM unnest($1::bigint[]) AS pid
                 ON CONFLICT (player_id, ladder_id) DO NOTHING",
                &[&ids, &ladder_id, &params.base_mu, &params.base_sigma, &now]
            )
            .await?;

        let rows = self
            .client
            .query(
                "SELECT * FROM player_ratings WHERE ladder_id = $2 AND player_id = ANY($1)",
                &[&ids, &ladder_id]
            )
            .await?;

        let by_id: HashMap<i64, PlayerRatingRow> = rows
            .iter()
            .map(|row| {
                let rating = player_rating_from_row(row);
                (rating.player_id, rating)
            })
            .collect();
        Ok(ids.iter().map(|id| by_id[id].clone()).collect())
    }

    pub async fn upsert_player_rating(
        &self,
        ladder_id: &str,
        state: &PlayerState,
        updated_at: DateTime<FixedOffset>
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO player_ratings (player_id, ladder_id, mu, sigma, matches_count, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (player_id, ladder_id) DO UPDATE
                 SET mu = EXCLUDED.mu, sigma = EXCLUDED.sigma,
                     matches_count = EXCLUDED.matches_count, updated_at = EXCLUDED.updated_at",
                &[
                    &state.player_id,
                    &ladder_id,
                    &state.mu,
                    &state.sigma,
                    &(state.matches_count as i32),
                    &updated_at
                ]
            )
            .await?;
        Ok(())
    }

    pub async fn ladder_ratings(&self, ladder_id: &str) -> Result<Vec<PlayerRatingRow>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM player_ratings WHERE ladder_id = $1 ORDER BY player_id",
                &[&ladder_id]
            )
            .await?;
        Ok(rows.iter().map(player_rating_from_row).collect())
    }

    /// Current rating with the sex bias already resolved.
    pub async fn get_player_rating(
        &self,
        player_id: i64,
        key: &LadderKey
    ) -> Result<Option<PlayerRatingView>, StoreError> {
        let ladder_id = key.ladder_id();
        let row = self
            .client
            .query_opt(
                "SELECT pr.mu, pr.sigma, pr.matches_count, p.sex,
                        COALESCE(o.bias, 0.0) AS sex_bias
                 FROM player_ratings pr
                 JOIN players p ON p.player_id = pr.player_id
                 LEFT JOIN ladder_sex_offsets o ON o.ladder_id = pr.ladder_id AND o.sex = p.sex
                 WHERE pr.player_id = $1 AND pr.ladder_id = $2",
                &[&player_id, &ladder_id]
            )
            .await?;

        Ok(row.map(|row| {
            let mu: f64 = row.get("mu");
            let sex_bias: f64 = row.get("sex_bias");
            PlayerRatingView {
                mu: mu + sex_bias,
                sigma: row.get("sigma"),
                matches: row.get("matches_count"),
                sex: row.get("sex"),
                sex_bias
            }
        }))
    }

    // Rating history

    pub async fn insert_rating_event(
        &self,
        ladder_id: &str,
        match_id: uuid::Uuid,
        change: &crate::model::structures::PlayerRatingChange,
        mov_weight: f64,
        created_at: DateTime<FixedOffset>
    ) -> Result<i64, StoreError> {
        let row = self
            .client
            .query_one(
                "INSERT INTO player_rating_history
                 (player_id, ladder_id, match_id, mu_before, mu_after, sigma_before, sigma_after,
                  delta, win_prob_pre, mov_weight, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 RETURNING id",
                &[
                    &change.player_id,
                    &ladder_id,
                    &match_id,
                    &change.mu_before,
                    &change.mu_after,
                    &change.sigma_before,
                    &change.sigma_after,
                    &change.delta,
                    &change.win_prob_pre,
                    &mov_weight,
                    &created_at
                ]
            )
            .await?;
        Ok(row.get("id"))
    }

    pub async fn rating_events_for_match(&self, match_id: uuid::Uuid) -> Result<Vec<RatingEvent>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM player_rating_history WHERE match_id = $1 ORDER BY id",
                &[&match_id]
            )
            .await?;
        Ok(rows.iter().map(rating_event_from_row).collect())
    }

    pub async fn get_rating_event(&self, id: i64) -> Result<Option<RatingEvent>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM player_rating_history WHERE id = $1", &[&id])
            .await?;
        Ok(row.as_ref().map(rating_event_from_row))
    }

    pub async fn list_rating_events(&self, query: &RatingEventQuery) -> Result<RatingEventPage, StoreError> {
        let limit = if query.limit > 0 { query.limit } else { 50 };
        let rows = self
            .client
            .query(
                "SELECT * FROM player_rating_history
                 WHERE ($1::bigint IS NULL OR player_id = $1)
                   AND ($2::text IS NULL OR ladder_id = $2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT $3 OFFSET $4",
                &[&query.player_id, &query.ladder_id, &limit, &query.offset]
            )
            .await?;

        let total_row = self
            .client
            .query_one(
                "SELECT count(*) AS total FROM player_rating_history
                 WHERE ($1::bigint IS NULL OR player_id = $1)
                   AND ($2::text IS NULL OR ladder_id = $2)",
                &[&query.player_id, &query.ladder_id]
            )
            .await?;

        Ok(RatingEventPage {
            events: rows.iter().map(rating_event_from_row).collect(),
            total: total_row.get("total")
        })
    }

    /// Rating as of a point in time, reconstructed from history.
    pub async fn get_rating_snapshot(
        &self,
        player_id: i64,
        key: &LadderKey,
        as_of: Option<DateTime<FixedOffset>>
    ) -> Result<Option<RatingSnapshot>, StoreError> {
        let ladder_id = key.ladder_id();
        let row = self
            .client
            .query_opt(
                "SELECT h.*, p.sex, COALESCE(o.bias, 0.0) AS sex_bias
                 FROM player_rating_history h
                 JOIN players p ON p.player_id = h.player_id
                 LEFT JOIN ladder_sex_offsets o ON o.ladder_id = h.ladder_id AND o.sex = p.sex
                 WHERE h.player_id = $1 AND h.ladder_id = $2
                   AND ($3::timestamptz IS NULL OR h.created_at <= $3)
                 ORDER BY h.created_at DESC, h.id DESC
                 LIMIT 1",
                &[&player_id, &ladder_id, &as_of]
            )
            .await?;

        Ok(row.map(|row| {
            let event = rating_event_from_row(&row);
            let sex_bias: f64 = row.get("sex_bias");
            RatingSnapshot {
                mu: event.mu_after + sex_bias,
                mu_raw: event.mu_after,
                sigma: event.sigma_after,
                rating_event: event
            }
        }))
    }

    // Pair synergies

    pub async fn ensure_pair_synergies(
        &self,
        ladder_id: &str,
        pairs: &[Vec<i64>],
        now: DateTime<FixedOffset>
    ) -> Result<HashMap<String, PairState>, StoreError> {
        let mut out = HashMap::new();
        for players in pairs {
            let state = PairState::seeded(players);
            self.client
                .execute(
                    "INSERT INTO pair_synergies (ladder_id, pair_key, players, gamma, matches, updated_at)
                     VALUES ($1, $2, $3, 0.0, 0, $4)
                     ON CONFLICT (ladder_id, pair_key) DO NOTHING",
                    &[&ladder_id, &state.pair_key, &state.players, &now]
                )
                .await?;

            let row = self
                .client
                .query_one(
                    "SELECT * FROM pair_synergies WHERE ladder_id = $1 AND pair_key = $2",
                    &[&ladder_id, &state.pair_key]
                )
                .await?;
            let state = pair_state_from_row(&row);
            out.insert(state.pair_key.clone(), state);
        }
        Ok(out)
    }

    pub async fn upsert_pair_synergy(
        &self,
        ladder_id: &str,
        state: &PairState,
        updated_at: DateTime<FixedOffset>
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO pair_synergies (ladder_id, pair_key, players, gamma, matches, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (ladder_id, pair_key) DO UPDATE
                 SET gamma = EXCLUDED.gamma, matches = EXCLUDED.matches, updated_at = EXCLUDED.updated_at",
                &[
                    &ladder_id,
                    &state.pair_key,
                    &state.players,
                    &state.gamma,
                    &(state.matches as i32),
                    &updated_at
                ]
            )
            .await?;
        Ok(())
    }

    pub async fn ladder_pair_synergies(&self, ladder_id: &str) -> Result<Vec<PairSynergyRow>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM pair_synergies WHERE ladder_id = $1 ORDER BY pair_key",
                &[&ladder_id]
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PairSynergyRow {
                ladder_id: row.get("ladder_id"),
                pair_key: row.get("pair_key"),
                players: row.get("players"),
                gamma: row.get("gamma"),
                matches: row.get("matches"),
                updated_at: row.get("updated_at")
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_pair_history(
        &self,
        ladder_id: &str,
        match_id: uuid::Uuid,
        pair_key: &str,
        gamma_before: f64,
        gamma_after: f64,
        delta: f64,
        created_at: DateTime<FixedOffset>
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO pair_synergy_history
                 (ladder_id, pair_key, match_id, gamma_before, gamma_after, delta, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &ladder_id,
                    &pair_key,
                    &match_id,
                    &gamma_before,
                    &gamma_after,
                    &delta,
                    &created_at
                ]
            )
            .await?;
        Ok(())
    }

    // Sex offsets

    pub async fn get_sex_offsets(&self, ladder_id: &str) -> Result<OffsetState, StoreError> {
        let rows = self
            .client
            .query("SELECT * FROM ladder_sex_offsets WHERE ladder_id = $1", &[&ladder_id])
            .await?;
        Ok(OffsetState::from_rows(rows.iter().map(|row| {
            (
                row.get::<_, Sex>("sex"),
                row.get::<_, f64>("bias"),
                row.get::<_, i32>("matches") as u32
            )
        })))
    }

    pub async fn ladders_with_offsets(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .client
            .query("SELECT DISTINCT ladder_id FROM ladder_sex_offsets ORDER BY ladder_id", &[])
            .await?;
        Ok(rows.iter().map(|row| row.get("ladder_id")).collect())
    }

    pub async fn upsert_sex_offsets(
        &self,
        ladder_id: &str,
        state: &OffsetState,
        updated_at: DateTime<FixedOffset>
    ) -> Result<(), StoreError> {
        for sex in Sex::ADJUSTED {
            self.client
                .execute(
                    "INSERT INTO ladder_sex_offsets (ladder_id, sex, bias, matches, updated_at)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (ladder_id, sex) DO UPDATE
                     SET bias = EXCLUDED.bias, matches = EXCLUDED.matches, updated_at = EXCLUDED.updated_at",
                    &[
                        &ladder_id,
                        &sex,
                        &state.bias(sex),
                        &(state.matches(sex) as i32),
                        &updated_at
                    ]
                )
                .await?;
        }
        Ok(())
    }

    pub async fn delete_sex_offsets(&self, ladder_id: &str) -> Result<(), StoreError> {
        self.client
            .execute("DELETE FROM ladder_sex_offsets WHERE ladder_id = $1", &[&ladder_id])
            .await?;
        Ok(())
    }

    /// Inter-sex matches on the ladder in the trailing 90 days, the edge
    /// count the offset eligibility gate requires.
    pub async fn inter_sex_edge_count_90d(
        &self,
        ladder_id: &str,
        now: DateTime<FixedOffset>
    ) -> Result<u32, StoreError> {
        let horizon = now - chrono::Duration::days(90);
        let rows = self
            .client
            .query(
                "SELECT m.match_id, ms.side, p.sex, count(*)::int AS n
                 FROM matches m
                 JOIN match_sides ms ON ms.match_id = m.match_id
                 JOIN match_side_players msp ON msp.match_side_id = ms.id
                 JOIN players p ON p.player_id = msp.player_id
                 WHERE m.ladder_id = $1 AND m.start_time >= $2
                 GROUP BY m.match_id, ms.side, p.sex",
                &[&ladder_id, &horizon]
            )
            .await?;

        let mut per_match: HashMap<uuid::Uuid, (HashMap<Sex, i32>, HashMap<Sex, i32>)> = HashMap::new();
        for row in &rows {
            let match_id: uuid::Uuid = row.get("match_id");
            let side: Side = row.get("side");
            let sex: Sex = row.get("sex");
            let n: i32 = row.get("n");
            let entry = per_match.entry(match_id).or_default();
            let counts = match side {
                Side::A => &mut entry.0,
                Side::B => &mut entry.1
            };
            *counts.entry(sex).or_insert(0) += n;
        }

        Ok(per_match.values().filter(|(a, b)| a != b).count() as u32)
    }

    // Matches

    pub async fn find_match_by_external_ref(
        &self,
        provider_id: &str,
        external_ref: &str
    ) -> Result<Option<uuid::Uuid>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT match_id FROM matches WHERE provider_id = $1 AND external_ref = $2",
                &[&provider_id, &external_ref]
            )
            .await?;
        Ok(row.map(|row| row.get("match_id")))
    }

    /// Fetches one match, enforcing tenant scoping.
    pub async fn get_match(&self, match_id: uuid::Uuid, organization_id: i64) -> Result<MatchRow, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT * FROM matches WHERE match_id = $1 AND organization_id = $2",
                &[&match_id, &organization_id]
            )
            .await?
            .ok_or_else(|| StoreError::MatchLookup(match_id.to_string()))?;

        let timing: Option<serde_json::Value> = row.get("timing");
        let timing = match timing {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None
        };

        Ok(MatchRow {
            match_id: row.get("match_id"),
            ladder_id: row.get("ladder_id"),
            provider_id: row.get("provider_id"),
            external_ref: row.get("external_ref"),
            organization_id: row.get("organization_id"),
            sport: row.get("sport"),
            discipline: row.get("discipline"),
            format: row.get("format"),
            tier: row.get("tier"),
            stage: row.get("stage"),
            start_time: row.get("start_time"),
            timing,
            raw_payload: row.get("raw_payload"),
            rating_status: row.get("rating_status"),
            rating_skip_reason: row.get("rating_skip_reason"),
            winner_side: row.get("winner_side"),
            created_at: row.get("created_at")
        })
    }

    pub async fn insert_match(&self, match_row: &MatchRow) -> Result<(), StoreError> {
        let timing = match &match_row.timing {
            Some(timing) => Some(serde_json::to_value(timing)?),
            None => None
        };
        self.client
            .execute(
                "INSERT INTO matches
                 (match_id, ladder_id, provider_id, external_ref, organization_id, sport, discipline,
                  format, tier, stage, start_time, timing, raw_payload, rating_status,
                  rating_skip_reason, winner_side, created_at)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)",
                &[
                    &match_row.match_id,
                    &match_row.ladder_id,
                    &match_row.provider_id,
                    &match_row.external_ref,
                    &match_row.organization_id,
                    &match_row.sport,
                    &match_row.discipline,
                    &match_row.format,
                    &match_row.tier,
                    &match_row.stage,
                    &match_row.start_time,
                    &timing,
                    &match_row.raw_payload,
                    &match_row.rating_status,
                    &match_row.rating_skip_reason,
                    &match_row.winner_side,
                    &match_row.created_at
                ]
            )
            .await?;
        Ok(())
    }

    pub async fn insert_match_side(
        &self,
        match_id: uuid::Uuid,
        side: Side,
        player_ids: &[i64]
    ) -> Result<(), StoreError> {
        let row = self
            .client
            .query_one(
                "INSERT INTO match_sides (match_id, side, players_count)
                 VALUES ($1, $2, $3) RETURNING id",
                &[&match_id, &side, &(player_ids.len() as i32)]
            )
            .await?;
        let side_id: i64 = row.get("id");

        for (position, player_id) in player_ids.iter().enumerate() {
            self.client
                .execute(
                    "INSERT INTO match_side_players (match_side_id, player_id, position)
                     VALUES ($1, $2, $3)",
                    &[&side_id, player_id, &(position as i32)]
                )
                .await?;
        }
        Ok(())
    }

    pub async fn insert_match_games(&self, match_id: uuid::Uuid, games: &[GameScore]) -> Result<(), StoreError> {
        for game in games {
            self.client
                .execute(
                    "INSERT INTO match_games (match_id, game_no, score_a, score_b)
                     VALUES ($1, $2, $3, $4)",
                    &[&match_id, &game.game_no, &game.score_a, &game.score_b]
                )
                .await?;
        }
        Ok(())
    }

    /// Latest start time on the ladder, used to detect late arrivals.
    pub async fn max_start_time(&self, ladder_id: &str) -> Result<Option<DateTime<FixedOffset>>, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT max(start_time) AS max_start FROM matches WHERE ladder_id = $1",
                &[&ladder_id]
            )
            .await?;
        Ok(row.get("max_start"))
    }

    /// Streams the full match history of a ladder in replay order.
    pub async fn load_ladder_matches(
        &self,
        ladder_id: &str,
        from: Option<DateTime<FixedOffset>>
    ) -> Result<Vec<StoredMatch>, StoreError> {
        // Streamed rather than collected by the driver: replayed ladders
        // can hold years of matches.
        let match_stream = self
            .client
            .query_raw(
                "SELECT match_id, start_time, timing, sport, discipline, tier, rating_status,
                        winner_side, raw_payload
                 FROM matches
                 WHERE ladder_id = $1 AND ($2::timestamptz IS NULL OR start_time >= $2)
                 ORDER BY start_time, match_id",
                [&ladder_id as &dyn ToSql, &from as &dyn ToSql]
            )
            .await?;
        pin_mut!(match_stream);
        let mut match_rows: Vec<Row> = Vec::new();
        while let Some(row) = match_stream.try_next().await? {
            match_rows.push(row);
        }

        let side_rows = self
            .client
            .query(
                "SELECT m.match_id, ms.side, msp.player_id, msp.position, p.sex
                 FROM matches m
                 JOIN match_sides ms ON ms.match_id = m.match_id
                 JOIN match_side_players msp ON msp.match_side_id = ms.id
                 JOIN players p ON p.player_id = msp.player_id
                 WHERE m.ladder_id = $1
                 ORDER BY m.match_id, ms.side, msp.position",
                &[&ladder_id]
            )
            .await?;

        let game_rows = self
            .client
            .query(
                "SELECT g.match_id, g.game_no, g.score_a, g.score_b
                 FROM match_games g
                 JOIN matches m ON m.match_id = g.match_id
                 WHERE m.ladder_id = $1
                 ORDER BY g.match_id, g.game_no",
                &[&ladder_id]
            )
            .await?;

        let mut sides: HashMap<uuid::Uuid, (Vec<(i64, Sex)>, Vec<(i64, Sex)>)> = HashMap::new();
        for row in &side_rows {
            let match_id: uuid::Uuid = row.get("match_id");
            let side: Side = row.get("side");
            let entry = sides.entry(match_id).or_default();
            let players = match side {
                Side::A => &mut entry.0,
                Side::B => &mut entry.1
            };
            players.push((row.get("player_id"), row.get("sex")));
        }

        let mut games: HashMap<uuid::Uuid, Vec<GameScore>> = HashMap::new();
        for row in &game_rows {
            let match_id: uuid::Uuid = row.get("match_id");
            games.entry(match_id).or_default().push(GameScore {
                game_no: row.get("game_no"),
                score_a: row.get("score_a"),
                score_b: row.get("score_b")
            });
        }

        let mut out = Vec::with_capacity(match_rows.len());
        for row in &match_rows {
            let match_id: uuid::Uuid = row.get("match_id");
            let timing: Option<serde_json::Value> = row.get("timing");
            let completed_at = match timing {
                Some(value) => {
                    let timing: crate::database::db_structs::MatchTiming = serde_json::from_value(value)?;
                    timing.completed_at
                }
                None => None
            };
            let (side_a, side_b) = sides.remove(&match_id).unwrap_or_default();

            out.push(StoredMatch {
                match_id,
                start_time: row.get("start_time"),
                completed_at,
                sport: row.get("sport"),
                discipline: row.get("discipline"),
                tier: row.get("tier"),
                rating_status: row.get("rating_status"),
                winner_side: row.get("winner_side"),
                raw_payload: row.get("raw_payload"),
                side_a,
                side_b,
                games: games.remove(&match_id).unwrap_or_default()
            });
        }
        Ok(out)
    }

    /// First stored history row per match, keyed by match. Replay reads the
    /// margin weight back from here when the raw payload does not carry one.
    pub async fn first_event_mov_weights(
        &self,
        ladder_id: &str
    ) -> Result<HashMap<uuid::Uuid, f64>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT ON (match_id) match_id, mov_weight
                 FROM player_rating_history
                 WHERE ladder_id = $1
                 ORDER BY match_id, id",
                &[&ladder_id]
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<_, uuid::Uuid>("match_id"), row.get::<_, f64>("mov_weight")))
            .collect())
    }

    /// Participant lists of recent matches, as edges for graph smoothing.
    pub async fn recent_match_participants(
        &self,
        ladder_id: &str,
        since: DateTime<FixedOffset>
    ) -> Result<Vec<Vec<i64>>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT m.match_id, msp.player_id
                 FROM matches m
                 JOIN match_sides ms ON ms.match_id = m.match_id
                 JOIN match_side_players msp ON msp.match_side_id = ms.id
                 WHERE m.ladder_id = $1 AND m.start_time >= $2
                 ORDER BY m.match_id",
                &[&ladder_id, &since]
            )
            .await?;

        let mut per_match: HashMap<uuid::Uuid, Vec<i64>> = HashMap::new();
        for row in &rows {
            per_match
                .entry(row.get("match_id"))
                .or_default()
                .push(row.get("player_id"));
        }
        Ok(per_match.into_values().collect())
    }

    /// Organization lookup for the insight-refresh fanout after a replay.
    pub async fn player_organizations(&self, ids: &[i64]) -> Result<HashMap<i64, i64>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT player_id, organization_id FROM players WHERE player_id = ANY($1)",
                &[&ids]
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("player_id"), row.get("organization_id")))
            .collect())
    }

    // Replay queue

    pub async fn enqueue_replay(
        &self,
        ladder_id: &str,
        earliest_start_time: DateTime<FixedOffset>
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO rating_replay_queue (ladder_id, earliest_start_time)
                 VALUES ($1, $2)
                 ON CONFLICT (ladder_id) DO UPDATE
                 SET earliest_start_time = LEAST(rating_replay_queue.earliest_start_time,
                                                 EXCLUDED.earliest_start_time),
                     updated_at = now()",
                &[&ladder_id, &earliest_start_time]
            )
            .await?;
        Ok(())
    }

    pub async fn replay_queue_entries(&self, limit: i64) -> Result<Vec<ReplayQueueEntry>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM rating_replay_queue ORDER BY earliest_start_time LIMIT $1",
                &[&limit]
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ReplayQueueEntry {
                ladder_id: row.get("ladder_id"),
                earliest_start_time: row.get("earliest_start_time"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at")
            })
            .collect())
    }

    pub async fn delete_replay_queue_entry(&self, ladder_id: &str) -> Result<(), StoreError> {
        self.client
            .execute("DELETE FROM rating_replay_queue WHERE ladder_id = $1", &[&ladder_id])
            .await?;
        Ok(())
    }

    /// Drops all rating-derived state of a ladder ahead of a rebuild. Raw
    /// matches are untouched.
    pub async fn truncate_ladder_derived_state(&self, ladder_id: &str) -> Result<(), StoreError> {
        for table in [
            "player_rating_history",
            "pair_synergy_history",
            "pair_synergies",
            "player_ratings"
        ] {
            self.client
                .execute(&format!("DELETE FROM {table} WHERE ladder_id = $1"), &[&ladder_id])
                .await?;
        }
        info!("cleared rating-derived state for ladder {}", ladder_id);
        Ok(())
    }

    // Access the underlying Client
    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }
}

fn ladder_from_row(row: &Row) -> Ladder {
    Ladder {
        ladder_id: row.get("ladder_id"),
        sport: row.get("sport"),
        discipline: row.get("discipline"),
        default_age_cutoff: row.get("default_age_cutoff"),
        age_bands: row.get("age_bands"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at")
    }
}

fn player_rating_from_row(row: &Row) -> PlayerRatingRow {
    PlayerRatingRow {
        player_id: row.get("player_id"),
        ladder_id: row.get("ladder_id"),
        mu: row.get("mu"),
        sigma: row.get("sigma"),
        matches_count: row.get("matches_count"),
        updated_at: row.get("updated_at")
    }
}

fn rating_event_from_row(row: &Row) -> RatingEvent {
    RatingEvent {
        id: row.get("id"),
        player_id: row.get("player_id"),
        ladder_id: row.get("ladder_id"),
        match_id: row.get("match_id"),
        mu_before: row.get("mu_before"),
        mu_after: row.get("mu_after"),
        sigma_before: row.get("sigma_before"),
        sigma_after: row.get("sigma_after"),
        delta: row.get("delta"),
        win_prob_pre: row.get("win_prob_pre"),
        mov_weight: row.get("mov_weight"),
        created_at: row.get("created_at")
    }
}

fn pair_state_from_row(row: &Row) -> PairState {
    PairState {
        pair_key: row.get("pair_key"),
        players: row.get("players"),
        gamma: row.get("gamma"),
        matches: row.get::<_, i32>("matches") as u32,
        updated_at: Some(row.get("updated_at"))
    }
}
