//! Migration 003: Add lease and retry bookkeeping to batched jobs.
//!
//! - `execution_id`: token of the worker holding the job
//! - `lease_expires_at`: when a running job is considered abandoned
//! - `retry_at`: earliest retry of a failed job
//! - `last_error`: message of the latest failed attempt

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Adds the columns used to claim, lease and retry jobs.
pub struct AddJobLeaseColumns;

#[async_trait]
impl Migration for AddJobLeaseColumns {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &'static str {
        "add_job_lease_columns"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            ALTER TABLE batched_background_migration_jobs
                ADD COLUMN IF NOT EXISTS execution_id UUID,
                ADD COLUMN IF NOT EXISTS lease_expires_at TIMESTAMPTZ,
                ADD COLUMN IF NOT EXISTS retry_at TIMESTAMPTZ,
                ADD COLUMN IF NOT EXISTS last_error TEXT
            "#,
        )
        .execute(&mut **tx)
        .await?;

        // Partial index for the stale lease sweep
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS batched_background_migration_jobs_lease_idx
            ON batched_background_migration_jobs (batched_background_migration_id, lease_expires_at)
            WHERE status = 1
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
