use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tranche_core::job::{BatchedJob, JobClaim, JobFailure, JobStatus, NewBatchedJob};
use tranche_core::migration::{
    BatchedMigration, MigrationKey, MigrationStatus, NewBatchedMigration, UnknownStatus,
};
use tranche_core::store::{LEASE_EXPIRED_ERROR, MigrationStore};
use uuid::Uuid;

const MIGRATION_COLUMNS: &str = "id, job_class_name, table_name, column_name, schema_name, \
    job_arguments, min_value, max_value, batch_size, sub_batch_size, max_batch_size, \
    interval_ms, status, created_at, updated_at";

const JOB_COLUMNS: &str = "id, batched_background_migration_id, min_value, max_value, \
    batch_size, sub_batch_size, status, attempts, execution_id, created_at, started_at, \
    finished_at, lease_expires_at, retry_at, last_error";

/// Errors raised by [`PgMigrationStore`].
#[derive(Debug, thiserror::Error)]
pub enum PgStoreError {
    /// The database failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A row holds a status code this version does not know.
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),
}

/// Postgres representation of a batched migration.
#[derive(Debug, FromRow)]
struct PgMigrationRow {
    id: i64,
    job_class_name: String,
    table_name: String,
    column_name: String,
    schema_name: String,
    job_arguments: Json<Vec<Value>>,
    min_value: i64,
    max_value: i64,
    batch_size: i64,
    sub_batch_size: i64,
    max_batch_size: Option<i64>,
    interval_ms: i64,
    status: i16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PgMigrationRow> for BatchedMigration {
    type Error = PgStoreError;

    fn try_from(row: PgMigrationRow) -> Result<Self, Self::Error> {
        Ok(BatchedMigration {
            id: row.id,
            job_class_name: row.job_class_name,
            table_name: row.table_name,
            column_name: row.column_name,
            schema_name: row.schema_name,
            job_arguments: row.job_arguments.0,
            min_value: row.min_value,
            max_value: row.max_value,
            batch_size: row.batch_size,
            sub_batch_size: row.sub_batch_size,
            max_batch_size: row.max_batch_size,
            interval: Duration::from_millis(u64::try_from(row.interval_ms).unwrap_or(0)),
            status: MigrationStatus::try_from(row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres representation of a batched job.
#[derive(Debug, FromRow)]
struct PgJobRow {
    id: i64,
    batched_background_migration_id: i64,
    min_value: i64,
    max_value: i64,
    batch_size: i64,
    sub_batch_size: i64,
    status: i16,
    attempts: i32,
    execution_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<PgJobRow> for BatchedJob {
    type Error = PgStoreError;

    fn try_from(row: PgJobRow) -> Result<Self, Self::Error> {
        Ok(BatchedJob {
            id: row.id,
            batched_migration_id: row.batched_background_migration_id,
            min_value: row.min_value,
            max_value: row.max_value,
            batch_size: row.batch_size,
            sub_batch_size: row.sub_batch_size,
            status: JobStatus::try_from(row.status)?,
            attempts: row.attempts,
            execution_id: row.execution_id,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            lease_expires_at: row.lease_expires_at,
            retry_at: row.retry_at,
            last_error: row.last_error,
        })
    }
}

fn interval_ms(interval: Duration) -> i64 {
    i64::try_from(interval.as_millis()).unwrap_or(i64::MAX)
}

fn status_codes(statuses: &[MigrationStatus]) -> Vec<i16> {
    statuses.iter().map(|status| i16::from(*status)).collect()
}

/// Codes of the statuses in `from` that may legally move to `to`.
fn legal_sources(from: &[MigrationStatus], to: MigrationStatus) -> Vec<i16> {
    from.iter()
        .filter(|status| status.can_transition_to(to))
        .map(|status| i16::from(*status))
        .collect()
}

const CLAIMABLE: &str = r#"
    id = $1 AND status = $2
    AND EXISTS (
        SELECT 1 FROM batched_background_migrations m
        WHERE m.id = batched_background_migration_id AND m.status = $3
    )
"#;

/// A postgres backed [`MigrationStore`].
///
/// The tables are created by [`Migrator`](crate::Migrator). Status changes are single
/// `UPDATE ... WHERE status = ANY(...)` statements, so runners sharing the database never
/// apply the same change twice.
#[derive(Clone, Debug)]
pub struct PgMigrationStore {
    postgres: PgPool,
}

impl PgMigrationStore {
    /// Creates a new `PgMigrationStore`.
    pub fn new(postgres: PgPool) -> Self {
        log::debug!("Creating a new PgMigrationStore");
        Self { postgres }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.postgres
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    type Error = PgStoreError;

    async fn create_migration(
        &self,
        migration: NewBatchedMigration,
    ) -> Result<Option<BatchedMigration>, Self::Error> {
        let row = sqlx::query_as::<_, PgMigrationRow>(&format!(
            r#"
            INSERT INTO batched_background_migrations (
                job_class_name, table_name, column_name, schema_name, job_arguments,
                min_value, max_value, batch_size, sub_batch_size, max_batch_size,
                interval_ms, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            ON CONFLICT ON CONSTRAINT batched_background_migrations_configuration DO NOTHING
            RETURNING {MIGRATION_COLUMNS}
            "#
        ))
        .bind(&migration.job_class_name)
        .bind(&migration.table_name)
        .bind(&migration.column_name)
        .bind(&migration.schema_name)
        .bind(Json(&migration.job_arguments))
        .bind(migration.min_value)
        .bind(migration.max_value)
        .bind(migration.batch_size)
        .bind(migration.sub_batch_size)
        .bind(migration.max_batch_size)
        .bind(interval_ms(migration.interval))
        .bind(i16::from(migration.status))
        .bind(migration.created_at)
        .fetch_optional(&self.postgres)
        .await?;

        row.map(BatchedMigration::try_from).transpose()
    }

    async fn find_migration(
        &self,
        key: &MigrationKey,
    ) -> Result<Option<BatchedMigration>, Self::Error> {
        let row = sqlx::query_as::<_, PgMigrationRow>(&format!(
            r#"
            SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations
            WHERE job_class_name = $1 AND table_name = $2 AND column_name = $3
            "#
        ))
        .bind(&key.job_class_name)
        .bind(&key.table_name)
        .bind(&key.column_name)
        .fetch_optional(&self.postgres)
        .await?;

        row.map(BatchedMigration::try_from).transpose()
    }

    async fn get_migration(&self, id: i64) -> Result<Option<BatchedMigration>, Self::Error> {
        let row = sqlx::query_as::<_, PgMigrationRow>(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.postgres)
        .await?;

        row.map(BatchedMigration::try_from).transpose()
    }

    async fn list_migrations(
        &self,
        statuses: &[MigrationStatus],
    ) -> Result<Vec<BatchedMigration>, Self::Error> {
        let rows = if statuses.is_empty() {
            sqlx::query_as::<_, PgMigrationRow>(&format!(
                "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations ORDER BY id"
            ))
            .fetch_all(&self.postgres)
            .await?
        } else {
            sqlx::query_as::<_, PgMigrationRow>(&format!(
                r#"
                SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations
                WHERE status = ANY($1)
                ORDER BY id
                "#
            ))
            .bind(status_codes(statuses))
            .fetch_all(&self.postgres)
            .await?
        };

        rows.into_iter().map(BatchedMigration::try_from).collect()
    }

    async fn transition_migration(
        &self,
        id: i64,
        from: &[MigrationStatus],
        to: MigrationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let from = legal_sources(from, to);
        if from.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(i16::from(to))
        .bind(now)
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_batch_size(
        &self,
        id: i64,
        batch_size: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "UPDATE batched_background_migrations SET batch_size = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(batch_size)
        .bind(now)
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_migration(&self, id: i64) -> Result<bool, Self::Error> {
        let result = sqlx::query("DELETE FROM batched_background_migrations WHERE id = $1")
            .bind(id)
            .execute(&self.postgres)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn create_job(&self, job: NewBatchedJob) -> Result<Option<BatchedJob>, Self::Error> {
        let row = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"
            INSERT INTO batched_background_migration_jobs (
                batched_background_migration_id, min_value, max_value, batch_size,
                sub_batch_size, status, attempts, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
            ON CONFLICT ON CONSTRAINT batched_background_migration_jobs_window DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.batched_migration_id)
        .bind(job.window.min_value)
        .bind(job.window.max_value)
        .bind(job.batch_size)
        .bind(job.sub_batch_size)
        .bind(i16::from(JobStatus::Pending))
        .bind(job.created_at)
        .fetch_optional(&self.postgres)
        .await?;

        row.map(BatchedJob::try_from).transpose()
    }

    async fn get_job(&self, id: i64) -> Result<Option<BatchedJob>, Self::Error> {
        let row = sqlx::query_as::<_, PgJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.postgres)
        .await?;

        row.map(BatchedJob::try_from).transpose()
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>, Self::Error> {
        let row = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
            ORDER BY max_value DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(migration_id)
        .fetch_optional(&self.postgres)
        .await?;

        row.map(BatchedJob::try_from).transpose()
    }

    async fn list_jobs(&self, migration_id: i64) -> Result<Vec<BatchedJob>, Self::Error> {
        let rows = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
            ORDER BY min_value
            "#
        ))
        .bind(migration_id)
        .fetch_all(&self.postgres)
        .await?;

        rows.into_iter().map(BatchedJob::try_from).collect()
    }

    async fn claim_job(
        &self,
        id: i64,
        from: JobStatus,
        migration_status: MigrationStatus,
        claim: &JobClaim,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE batched_background_migration_jobs
            SET status = $4, execution_id = $5, started_at = $6, lease_expires_at = $7,
                finished_at = NULL
            WHERE {CLAIMABLE}
            "#
        ))
        .bind(id)
        .bind(i16::from(from))
        .bind(i16::from(migration_status))
        .bind(i16::from(JobStatus::Running))
        .bind(claim.execution_id)
        .bind(claim.started_at)
        .bind(claim.lease_expires_at)
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn skip_job(
        &self,
        id: i64,
        from: JobStatus,
        migration_status: MigrationStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE batched_background_migration_jobs
            SET status = $4, execution_id = NULL, started_at = NULL, finished_at = $5,
                lease_expires_at = NULL, retry_at = NULL
            WHERE {CLAIMABLE}
            "#
        ))
        .bind(id)
        .bind(i16::from(from))
        .bind(i16::from(migration_status))
        .bind(i16::from(JobStatus::Succeeded))
        .bind(finished_at)
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_job_lease(
        &self,
        id: i64,
        execution_id: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migration_jobs
            SET lease_expires_at = $4
            WHERE id = $1 AND status = $2 AND execution_id = $3
            "#,
        )
        .bind(id)
        .bind(i16::from(JobStatus::Running))
        .bind(execution_id)
        .bind(lease_expires_at)
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(
        &self,
        id: i64,
        execution_id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migration_jobs
            SET status = $3, finished_at = $4, retry_at = NULL
            WHERE id = $1 AND status = $2 AND execution_id = $5
            "#,
        )
        .bind(id)
        .bind(i16::from(JobStatus::Running))
        .bind(i16::from(JobStatus::Succeeded))
        .bind(finished_at)
        .bind(execution_id)
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(
        &self,
        id: i64,
        execution_id: Uuid,
        failure: &JobFailure,
    ) -> Result<Option<BatchedJob>, Self::Error> {
        let row = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"
            UPDATE batched_background_migration_jobs
            SET status = $3, attempts = attempts + 1, finished_at = $4, retry_at = $5,
                last_error = $6
            WHERE id = $1 AND status = $2 AND execution_id = $7
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(i16::from(JobStatus::Running))
        .bind(i16::from(JobStatus::Failed))
        .bind(failure.finished_at)
        .bind(failure.retry_at)
        .bind(&failure.error)
        .bind(execution_id)
        .fetch_optional(&self.postgres)
        .await?;

        row.map(BatchedJob::try_from).transpose()
    }

    async fn expire_stale_jobs(
        &self,
        migration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchedJob>, Self::Error> {
        let rows = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"
            UPDATE batched_background_migration_jobs
            SET status = $3, attempts = attempts + 1, finished_at = $4, retry_at = $4,
                last_error = $5
            WHERE batched_background_migration_id = $1
              AND status = $2
              AND lease_expires_at <= $4
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(migration_id)
        .bind(i16::from(JobStatus::Running))
        .bind(i16::from(JobStatus::Failed))
        .bind(now)
        .bind(LEASE_EXPIRED_ERROR)
        .fetch_all(&self.postgres)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(BatchedJob::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| job.min_value);
        Ok(jobs)
    }

    async fn reset_failed_jobs(&self, migration_id: i64) -> Result<u64, Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migration_jobs
            SET status = $3, attempts = 0, retry_at = NULL
            WHERE batched_background_migration_id = $1 AND status = $2
            "#,
        )
        .bind(migration_id)
        .bind(i16::from(JobStatus::Failed))
        .bind(i16::from(JobStatus::Pending))
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_sources_are_dropped() {
        assert_eq!(
            legal_sources(
                &[MigrationStatus::Finished, MigrationStatus::Active],
                MigrationStatus::Paused
            ),
            vec![1]
        );
        assert!(legal_sources(&[MigrationStatus::Finalized], MigrationStatus::Active).is_empty());
    }
}
