//! Postgres-backed repository for transfer records.

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use soulgate_events::{
    TransferDirection, TransferOutcome, TransferPhase, state_pair_is_legal,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::model::{Transfer, TransferFilter, TransferSummary};

/// Exception text written by [`TransferStore::startup_cleanup`].
pub const SHUTDOWN_EXCEPTION: &str = "Application shut down";

/// Database-backed repository for transfer records.
#[derive(Clone)]
pub struct TransferStore {
    pool: PgPool,
}

const INSERT_TRANSFER_SQL: &str = r"
    INSERT INTO transfers (
        id,
        direction,
        username,
        remote_path,
        local_path,
        size,
        start_offset,
        bytes_transferred,
        phase,
        outcome,
        requested_at,
        enqueued_at,
        started_at,
        ended_at,
        exception,
        average_speed,
        removed
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
";

const UPSERT_TRANSFER_SQL: &str = r"
    INSERT INTO transfers (
        id,
        direction,
        username,
        remote_path,
        local_path,
        size,
        start_offset,
        bytes_transferred,
        phase,
        outcome,
        requested_at,
        enqueued_at,
        started_at,
        ended_at,
        exception,
        average_speed,
        removed
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
    ON CONFLICT (id) DO UPDATE
    SET
        local_path = EXCLUDED.local_path,
        size = EXCLUDED.size,
        start_offset = EXCLUDED.start_offset,
        bytes_transferred = EXCLUDED.bytes_transferred,
        phase = EXCLUDED.phase,
        outcome = EXCLUDED.outcome,
        enqueued_at = EXCLUDED.enqueued_at,
        started_at = EXCLUDED.started_at,
        ended_at = EXCLUDED.ended_at,
        exception = EXCLUDED.exception,
        average_speed = EXCLUDED.average_speed,
        removed = EXCLUDED.removed
";

const SUPERSEDE_SQL: &str = r"
    UPDATE transfers
    SET removed = TRUE
    WHERE direction = $1
      AND username = $2
      AND remote_path = $3
      AND NOT removed
";

const FIND_TRANSFER_SQL: &str = r"
    SELECT * FROM transfers WHERE id = $1
";

const STARTUP_CLEANUP_SQL: &str = r"
    UPDATE transfers
    SET phase = 'completed',
        outcome = 'errored',
        ended_at = $1,
        exception = $2
    WHERE ended_at IS NULL OR phase <> 'completed'
";

const PRUNE_SQL: &str = r"
    UPDATE transfers
    SET removed = TRUE
    WHERE NOT removed
      AND direction = $1
      AND phase = 'completed'
      AND outcome = ANY($2)
      AND ended_at IS NOT NULL
      AND ended_at < $3
";

impl TransferStore {
    /// Initialise the store, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail or the database is unreachable.
    pub async fn new(pool: PgPool) -> Result<Self> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&pool)
            .await
            .context("failed to run transfer migrations")?;
        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a fresh record, soft-deleting any prior non-removed record for
    /// the same `(direction, username, remote_path)` in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if either statement or the commit fails.
    pub async fn add_or_supersede(&self, transfer: &Transfer) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open supersede transaction")?;

        sqlx::query(SUPERSEDE_SQL)
            .bind(transfer.direction.as_str())
            .bind(&transfer.username)
            .bind(&transfer.remote_path)
            .execute(&mut *tx)
            .await
            .context("failed to supersede prior transfer record")?;

        bind_transfer(sqlx::query(INSERT_TRANSFER_SQL), transfer)
            .execute(&mut *tx)
            .await
            .context("failed to insert transfer record")?;

        tx.commit()
            .await
            .context("failed to commit supersede transaction")?;
        Ok(())
    }

    /// Blind upsert by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn update(&self, transfer: &Transfer) -> Result<()> {
        bind_transfer(sqlx::query(UPSERT_TRANSFER_SQL), transfer)
            .execute(&self.pool)
            .await
            .context("failed to upsert transfer record")?;
        Ok(())
    }

    /// Fetch a record by id, including soft-deleted rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn find(&self, id: Uuid) -> Result<Option<Transfer>> {
        let row = sqlx::query(FIND_TRANSFER_SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load transfer record")?;
        row.map(|row| transfer_from_row(&row)).transpose()
    }

    /// List records matching the filter, newest request first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM transfers WHERE TRUE");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY requested_at DESC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list transfer records")?;
        rows.iter().map(transfer_from_row).collect()
    }

    /// Aggregate matching rows into `(files, total_bytes)` in one query.
    ///
    /// This backs the admission limit checks, so the filter fields must map
    /// onto the indexed columns.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn summarize(&self, filter: &TransferFilter) -> Result<TransferSummary> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT COUNT(*) AS files, COALESCE(SUM(size), 0) AS total_bytes \
             FROM transfers WHERE TRUE",
        );
        push_filter(&mut builder, filter);

        let row = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .context("failed to summarize transfer records")?;
        Ok(TransferSummary {
            files: read_u64(&row, "files")?,
            total_bytes: read_u64(&row, "total_bytes")?,
        })
    }

    /// Soft-delete terminal records older than `age_minutes` whose outcome is
    /// one of `outcomes`. Returns the number of rows marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter targets non-terminal records or the
    /// statement fails.
    pub async fn prune(
        &self,
        direction: TransferDirection,
        age_minutes: i64,
        outcomes: &[TransferOutcome],
    ) -> Result<u64> {
        validate_prune_outcomes(outcomes)?;

        let cutoff = Utc::now() - Duration::minutes(age_minutes);
        let labels: Vec<String> = outcomes
            .iter()
            .map(|outcome| outcome.as_str().to_string())
            .collect();
        let result = sqlx::query(PRUNE_SQL)
            .bind(direction.as_str())
            .bind(&labels)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to prune transfer records")?;
        Ok(result.rows_affected())
    }

    /// Re-disposition every record left unfinished by a previous process
    /// instance. Returns the number of rows rewritten.
    ///
    /// In-flight uploads are never resumed across restarts; this is the only
    /// recovery path for records interrupted by an unclean shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn startup_cleanup(&self) -> Result<u64> {
        let result = sqlx::query(STARTUP_CLEANUP_SQL)
            .bind(Utc::now())
            .bind(SHUTDOWN_EXCEPTION)
            .execute(&self.pool)
            .await
            .context("failed to reconcile unfinished transfer records")?;
        let rewritten = result.rows_affected();
        if rewritten > 0 {
            tracing::info!(rewritten, "re-dispositioned unfinished transfers from a prior run");
        }
        Ok(rewritten)
    }
}

fn validate_prune_outcomes(outcomes: &[TransferOutcome]) -> Result<()> {
    if outcomes.is_empty() {
        bail!("prune filter must name at least one terminal outcome");
    }
    if outcomes.contains(&TransferOutcome::None) {
        bail!("prune filter must target terminal outcomes only");
    }
    Ok(())
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_transfer<'q>(query: PgQuery<'q>, transfer: &'q Transfer) -> PgQuery<'q> {
    query
        .bind(transfer.id)
        .bind(transfer.direction.as_str())
        .bind(&transfer.username)
        .bind(&transfer.remote_path)
        .bind(transfer.local_path.as_deref())
        .bind(clamp_i64(transfer.size))
        .bind(clamp_i64(transfer.start_offset))
        .bind(clamp_i64(transfer.bytes_transferred))
        .bind(transfer.phase.as_str())
        .bind(transfer.outcome.as_str())
        .bind(transfer.requested_at)
        .bind(transfer.enqueued_at)
        .bind(transfer.started_at)
        .bind(transfer.ended_at)
        .bind(transfer.exception.as_deref())
        .bind(transfer.average_speed)
        .bind(transfer.removed)
}

fn push_filter(builder: &mut QueryBuilder<Postgres>, filter: &TransferFilter) {
    if let Some(direction) = filter.direction {
        builder.push(" AND direction = ");
        builder.push_bind(direction.as_str());
    }
    if let Some(username) = &filter.username {
        builder.push(" AND username = ");
        builder.push_bind(username.clone());
    }
    if let Some(remote_path) = &filter.remote_path {
        builder.push(" AND remote_path = ");
        builder.push_bind(remote_path.clone());
    }
    if !filter.include_removed {
        builder.push(" AND NOT removed");
    }
    if let Some(terminal) = filter.terminal {
        if terminal {
            builder.push(" AND phase = 'completed'");
        } else {
            builder.push(" AND phase <> 'completed'");
        }
    }
    if let Some(outcomes) = &filter.outcomes {
        let labels: Vec<String> = outcomes
            .iter()
            .map(|outcome| outcome.as_str().to_string())
            .collect();
        builder.push(" AND outcome = ANY(");
        builder.push_bind(labels);
        builder.push(")");
    }
    if let Some(excluded) = &filter.exclude_outcomes {
        let labels: Vec<String> = excluded
            .iter()
            .map(|outcome| outcome.as_str().to_string())
            .collect();
        builder.push(" AND outcome <> ALL(");
        builder.push_bind(labels);
        builder.push(")");
    }
    if let Some(cutoff) = filter.started_at_or_after {
        builder.push(" AND started_at IS NOT NULL AND started_at >= ");
        builder.push_bind(cutoff);
    }
    if let Some(ended) = filter.ended {
        if ended {
            builder.push(" AND ended_at IS NOT NULL");
        } else {
            builder.push(" AND ended_at IS NULL");
        }
    }
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer> {
    let direction_label: String = row.try_get("direction")?;
    let direction = direction_label
        .parse::<TransferDirection>()
        .map_err(anyhow::Error::msg)?;
    let phase_label: String = row.try_get("phase")?;
    let outcome_label: String = row.try_get("outcome")?;
    let (phase, outcome) = decode_state(&phase_label, &outcome_label);

    Ok(Transfer {
        id: row.try_get("id")?,
        direction,
        username: row.try_get("username")?,
        remote_path: row.try_get("remote_path")?,
        local_path: row.try_get("local_path")?,
        size: read_u64(row, "size")?,
        start_offset: read_u64(row, "start_offset")?,
        bytes_transferred: read_u64(row, "bytes_transferred")?,
        phase,
        outcome,
        requested_at: row.try_get("requested_at")?,
        enqueued_at: row.try_get("enqueued_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        exception: row.try_get("exception")?,
        average_speed: row.try_get("average_speed")?,
        removed: row.try_get("removed")?,
    })
}

fn decode_state(phase_label: &str, outcome_label: &str) -> (TransferPhase, TransferOutcome) {
    let phase = phase_label.parse::<TransferPhase>().unwrap_or_else(|_| {
        tracing::warn!(phase = %phase_label, "unknown transfer phase in store; treating as completed");
        TransferPhase::Completed
    });
    let outcome = outcome_label.parse::<TransferOutcome>().unwrap_or_else(|_| {
        tracing::warn!(outcome = %outcome_label, "unknown transfer outcome in store; treating as errored");
        TransferOutcome::Errored
    });
    if state_pair_is_legal(phase, outcome) {
        (phase, outcome)
    } else if phase.is_terminal() {
        tracing::warn!(
            phase = %phase_label,
            outcome = %outcome_label,
            "terminal row without outcome; coercing to errored"
        );
        (phase, TransferOutcome::Errored)
    } else {
        tracing::warn!(
            phase = %phase_label,
            outcome = %outcome_label,
            "live row with terminal outcome; dropping outcome"
        );
        (phase, TransferOutcome::None)
    }
}

fn read_u64(row: &PgRow, column: &str) -> Result<u64> {
    let value: i64 = row.try_get(column)?;
    Ok(u64::try_from(value).unwrap_or_default())
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_filter_requires_terminal_outcomes() {
        assert!(validate_prune_outcomes(&[]).is_err());
        assert!(validate_prune_outcomes(&[TransferOutcome::None]).is_err());
        assert!(
            validate_prune_outcomes(&[TransferOutcome::Succeeded, TransferOutcome::None]).is_err()
        );
        assert!(
            validate_prune_outcomes(&[TransferOutcome::Succeeded, TransferOutcome::Errored])
                .is_ok()
        );
    }

    #[test]
    fn decode_state_coerces_illegal_pairs() {
        assert_eq!(
            decode_state("completed", "succeeded"),
            (TransferPhase::Completed, TransferOutcome::Succeeded)
        );
        assert_eq!(
            decode_state("completed", "none"),
            (TransferPhase::Completed, TransferOutcome::Errored)
        );
        assert_eq!(
            decode_state("queued", "succeeded"),
            (TransferPhase::Queued, TransferOutcome::None)
        );
        assert_eq!(
            decode_state("sideways", "none"),
            (TransferPhase::Completed, TransferOutcome::Errored)
        );
    }

    #[test]
    fn clamp_handles_large_values() {
        assert_eq!(clamp_i64(42), 42);
        assert_eq!(clamp_i64(u64::MAX), i64::MAX);
    }
}
