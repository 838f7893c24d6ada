//! Migration 001: Create the batched background migrations table.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the table holding one row per registered batched migration.
pub struct CreateBatchedBackgroundMigrations;

#[async_trait]
impl Migration for CreateBatchedBackgroundMigrations {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_batched_background_migrations"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batched_background_migrations (
                id BIGSERIAL PRIMARY KEY,
                job_class_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                schema_name TEXT NOT NULL DEFAULT 'main',
                job_arguments JSONB NOT NULL DEFAULT '[]',
                min_value BIGINT NOT NULL,
                max_value BIGINT NOT NULL,
                batch_size BIGINT NOT NULL CHECK (batch_size > 0),
                sub_batch_size BIGINT NOT NULL CHECK (sub_batch_size > 0),
                max_batch_size BIGINT,
                interval_ms BIGINT NOT NULL,
                status SMALLINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CHECK (min_value <= max_value),
                CONSTRAINT batched_background_migrations_configuration
                    UNIQUE (job_class_name, table_name, column_name)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS batched_background_migrations_status_idx
            ON batched_background_migrations (status)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
