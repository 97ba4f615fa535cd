use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, error};

use super::models::{
    encode_signatures, to_db_int, CheckpointRow, EventRecordRow, RECORD_COLUMNS,
};
use super::{DestTxUpdate, Ledger, RecordFilter, ScanCommit, Transition};
use crate::error::RelayerError;
use crate::types::{BridgeEvent, ChainSide, Checkpoint, EventKey, EventRecord, EventState};

/// Map a database failure to the fatal storage error
fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> eyre::Report {
    move |e| {
        error!(error = ?e, "{}", context);
        RelayerError::StorageUnavailable(format!("{}: {}", context, e)).into()
    }
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(storage("Failed to connect to database"))
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Ledger backed by Postgres
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, migrate, and return a ready ledger
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = create_pool(database_url, max_connections).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn rows_to_records(rows: Vec<EventRecordRow>) -> Result<Vec<EventRecord>> {
        rows.into_iter().map(EventRecord::try_from).collect()
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn checkpoint(&self, chain: ChainSide) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT chain, block_height, block_hash, updated_at FROM chain_checkpoints WHERE chain = $1",
        )
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("Failed to load checkpoint"))?;

        row.map(Checkpoint::try_from).transpose()
    }

    async fn commit_scan(
        &self,
        chain: ChainSide,
        events: &[BridgeEvent],
        checkpoint: Checkpoint,
    ) -> Result<ScanCommit> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage("Failed to begin scan transaction"))?;

        let current = sqlx::query_as::<_, (i64,)>(
            "SELECT block_height FROM chain_checkpoints WHERE chain = $1 FOR UPDATE",
        )
        .bind(chain.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage("Failed to lock checkpoint"))?;

        let height = to_db_int(checkpoint.height, "checkpoint")?;
        if let Some((current,)) = current {
            if height < current {
                return Err(RelayerError::CheckpointRegression {
                    chain,
                    current: current as u64,
                    requested: checkpoint.height,
                }
                .into());
            }
        }

        let mut commit = ScanCommit::default();
        for event in events {
            let key = event.key();
            let nonce = to_db_int(event.nonce, "nonce")?;
            let inserted = sqlx::query_as::<_, (i64,)>(
                r#"
                INSERT INTO event_records (source_chain, event_type, nonce, sender, recipient,
                    amount, source_tx_hash, source_block_height, observed_at, checkpoint_block)
                VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8, $9, $10)
                ON CONFLICT (source_chain, event_type, nonce) DO NOTHING
                RETURNING nonce
                "#,
            )
            .bind(event.source_chain.as_str())
            .bind(event.event_type.as_str())
            .bind(nonce)
            .bind(event.sender.as_slice())
            .bind(event.recipient.as_slice())
            .bind(event.amount.to_string())
            .bind(event.source_tx_hash.as_slice())
            .bind(to_db_int(event.source_block_height, "source_block_height")?)
            .bind(event.observed_at)
            .bind(height)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage("Failed to insert event record"))?;

            if inserted.is_some() {
                commit.inserted.push(key);
                continue;
            }

            let (existing_tx,) = sqlx::query_as::<_, (Vec<u8>,)>(
                r#"SELECT source_tx_hash FROM event_records
                   WHERE source_chain = $1 AND event_type = $2 AND nonce = $3"#,
            )
            .bind(event.source_chain.as_str())
            .bind(event.event_type.as_str())
            .bind(nonce)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage("Failed to load existing event record"))?;

            if existing_tx.as_slice() == event.source_tx_hash.as_slice() {
                commit.duplicates.push(key);
            } else {
                commit.conflicts.push(key);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, block_height, block_hash, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (chain) DO UPDATE SET
                block_height = EXCLUDED.block_height,
                block_hash = EXCLUDED.block_hash,
                updated_at = NOW()
            "#,
        )
        .bind(chain.as_str())
        .bind(height)
        .bind(checkpoint.block_hash.as_slice())
        .execute(&mut *tx)
        .await
        .map_err(storage("Failed to advance checkpoint"))?;

        tx.commit()
            .await
            .map_err(storage("Failed to commit scan transaction"))?;

        debug!(
            chain = %chain,
            checkpoint = checkpoint.height,
            inserted = commit.inserted.len(),
            duplicates = commit.duplicates.len(),
            "Committed scan range"
        );
        Ok(commit)
    }

    async fn get(&self, key: &EventKey) -> Result<Option<EventRecord>> {
        let row = sqlx::query_as::<_, EventRecordRow>(&format!(
            "SELECT {} FROM event_records WHERE source_chain = $1 AND event_type = $2 AND nonce = $3",
            RECORD_COLUMNS
        ))
        .bind(key.source_chain.as_str())
        .bind(key.event_type.as_str())
        .bind(to_db_int(key.nonce, "nonce")?)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("Failed to load event record"))?;

        row.map(EventRecord::try_from).transpose()
    }

    async fn transition(&self, key: &EventKey, transition: Transition) -> Result<EventRecord> {
        transition.check_legal(*key)?;

        let signatures = transition
            .signatures
            .as_ref()
            .map(encode_signatures)
            .transpose()?;
        let (dest_mode, dest_hash) = match transition.dest_tx {
            DestTxUpdate::Keep => ("keep", None),
            DestTxUpdate::Set(hash) => ("set", Some(hash.to_vec())),
            DestTxUpdate::Clear => ("clear", None),
        };
        let counted = transition.count_attempt || transition.count_signature_cycle;

        let row = sqlx::query_as::<_, EventRecordRow>(&format!(
            r#"
            UPDATE event_records SET
                state = $5,
                signatures = COALESCE($6, signatures),
                dest_tx_hash = CASE $7 WHEN 'set' THEN $8 WHEN 'clear' THEN NULL ELSE dest_tx_hash END,
                attempts = attempts + $9,
                signature_cycles = signature_cycles + $10,
                last_attempt_at = CASE WHEN $11 THEN NOW() ELSE last_attempt_at END,
                retry_after = $12,
                last_error = $13,
                updated_at = NOW()
            WHERE source_chain = $1 AND event_type = $2 AND nonce = $3 AND state = $4
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(key.source_chain.as_str())
        .bind(key.event_type.as_str())
        .bind(to_db_int(key.nonce, "nonce")?)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(signatures)
        .bind(dest_mode)
        .bind(dest_hash)
        .bind(transition.count_attempt as i32)
        .bind(transition.count_signature_cycle as i32)
        .bind(counted)
        .bind(transition.retry_after)
        .bind(&transition.last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("Failed to apply record transition"))?;

        match row {
            Some(row) => EventRecord::try_from(row),
            None => match self.get(key).await? {
                Some(_) => Err(RelayerError::StaleRecord {
                    key: *key,
                    expected: transition.from,
                }
                .into()),
                None => Err(RelayerError::RecordNotFound(*key).into()),
            },
        }
    }

    async fn due_records(
        &self,
        states: &[EventState],
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, EventRecordRow>(&format!(
            r#"SELECT {} FROM event_records
               WHERE state = ANY($1) AND (retry_after IS NULL OR retry_after <= $2)
               ORDER BY observed_at ASC, source_chain, event_type, nonce
               LIMIT $3"#,
            RECORD_COLUMNS
        ))
        .bind(&states)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to load due records"))?;

        Self::rows_to_records(rows)
    }

    async fn unsent_records(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecordRow>(&format!(
            r#"SELECT {} FROM event_records
               WHERE (state = 'quorum_reached'
                      OR (state = 'submitted' AND dest_tx_hash IS NULL))
                 AND (retry_after IS NULL OR retry_after <= $1)
               ORDER BY observed_at ASC, source_chain, event_type, nonce
               LIMIT $2"#,
            RECORD_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to load unsent records"))?;

        Self::rows_to_records(rows)
    }

    async fn in_flight_records(&self, limit: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecordRow>(&format!(
            r#"SELECT {} FROM event_records
               WHERE state = 'submitted' AND dest_tx_hash IS NOT NULL
               ORDER BY last_attempt_at ASC NULLS FIRST, source_chain, event_type, nonce
               LIMIT $1"#,
            RECORD_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to load in-flight records"))?;

        Self::rows_to_records(rows)
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecordRow>(&format!(
            r#"SELECT {} FROM event_records
               WHERE ($1::VARCHAR IS NULL OR state = $1)
                 AND ($2::VARCHAR IS NULL OR source_chain = $2)
                 AND ($3::TIMESTAMPTZ IS NULL OR observed_at >= $3)
                 AND ($4::TIMESTAMPTZ IS NULL OR observed_at < $4)
               ORDER BY observed_at DESC, source_chain DESC, event_type DESC, nonce DESC
               LIMIT $5 OFFSET $6"#,
            RECORD_COLUMNS
        ))
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.source_chain.map(|c| c.as_str()))
        .bind(filter.observed_from)
        .bind(filter.observed_to)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to query event records"))?;

        Self::rows_to_records(rows)
    }

    async fn count_by_state(&self) -> Result<BTreeMap<EventState, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM event_records GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to count event records"))?;

        let mut counts: BTreeMap<EventState, i64> =
            EventState::ALL.iter().map(|s| (*s, 0)).collect();
        for (state, count) in rows {
            counts.insert(state.parse()?, count);
        }
        Ok(counts)
    }

    async fn stale_records(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecordRow>(&format!(
            r#"SELECT {} FROM event_records
               WHERE state NOT IN ('confirmed', 'failed') AND updated_at < $1
               ORDER BY updated_at ASC
               LIMIT $2"#,
            RECORD_COLUMNS
        ))
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to load stale records"))?;

        Self::rows_to_records(rows)
    }
}
