//! Migration 002: Create the batched background migration jobs table.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the table holding one row per batch window. Jobs are deleted with their
/// migration.
pub struct CreateBatchedBackgroundMigrationJobs;

#[async_trait]
impl Migration for CreateBatchedBackgroundMigrationJobs {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_batched_background_migration_jobs"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batched_background_migration_jobs (
                id BIGSERIAL PRIMARY KEY,
                batched_background_migration_id BIGINT NOT NULL
                    REFERENCES batched_background_migrations (id) ON DELETE CASCADE,
                min_value BIGINT NOT NULL,
                max_value BIGINT NOT NULL,
                batch_size BIGINT NOT NULL,
                sub_batch_size BIGINT NOT NULL,
                status SMALLINT NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                CHECK (min_value <= max_value),
                CONSTRAINT batched_background_migration_jobs_window
                    UNIQUE (batched_background_migration_id, min_value)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS batched_background_migration_jobs_max_value_idx
            ON batched_background_migration_jobs (batched_background_migration_id, max_value)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
