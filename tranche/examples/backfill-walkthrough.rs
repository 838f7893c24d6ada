//! Backfills a copy of the `id` column of a small in-memory table.
//!
//! Run with `RUST_LOG=info` to follow each batch.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tranche::prelude::*;
use tranche_mem::{InMemoryCopyColumnJob, InMemoryDatabase, InMemoryMigrationStore, Row};

/// Lowercases `name` into `display_name`.
#[derive(JobClassName)]
#[job_class_name(namespace = "Backfills")]
struct NormalizeDisplayNames {
    database: InMemoryDatabase,
}

#[async_trait]
impl BatchJob for NormalizeDisplayNames {
    async fn perform(&self, batch: &BatchContext) -> Result<(), BoxError> {
        for sub_batch in batch.sub_batches() {
            self.database
                .update_rows(&batch.table_name, &batch.column_name, sub_batch, |row| {
                    let display_name = row
                        .get("name")
                        .and_then(|name| name.as_str())
                        .map(str::to_lowercase);
                    row.insert("display_name".to_string(), json!(display_name));
                })
                .await?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let database = InMemoryDatabase::new();
    database
        .create_table("users", &["id", "name", "display_name", "id_convert_to_bigint"])
        .await;
    for id in 1..=23 {
        let row = Row::from([
            ("id".to_string(), json!(id)),
            ("name".to_string(), json!(format!("User {id}"))),
        ]);
        database.insert("users", row).await?;
    }

    let store = InMemoryMigrationStore::new();
    let registry = JobRegistry::new()
        .with_job(InMemoryCopyColumnJob::new(database.clone()))
        .with_job(NormalizeDisplayNames {
            database: database.clone(),
        });
    let helpers = MigrationHelpers::new(
        store,
        database.clone(),
        Arc::new(registry),
        SchedulerConfig::default(),
        RunnerConfig::default(),
    );

    let copy_arguments = vec![json!(["id"]), json!(["id_convert_to_bigint"])];
    let queued = helpers
        .queue_batched_background_migration(
            "CopyColumnUsingBackgroundMigrationJob",
            "users",
            "id",
            copy_arguments.clone(),
            QueueOptions {
                batch_size: 5,
                sub_batch_size: 2,
                ..QueueOptions::default()
            },
        )
        .await?;
    helpers
        .queue_batched_background_migration(
            "::Backfills::NormalizeDisplayNames",
            "users",
            "id",
            vec![],
            QueueOptions {
                batch_size: 10,
                sub_batch_size: 5,
                max_batch_size: Some(20),
                ..QueueOptions::default()
            },
        )
        .await?;

    // Simulate a worker polling every two minutes.
    let runner = helpers.finalizer().runner();
    let mut now = Utc::now();
    for _ in 0..3 {
        for (id, result) in runner.run_due_migrations_at(now).await? {
            println!("migration {id}: {:?}", result?);
        }
        now += Duration::minutes(2);
    }

    let progress = helpers.scheduler().progress(queued.migration().id).await?;
    println!(
        "copy column: {:.0}% done through {:?}",
        progress.percent_complete, progress.completed_through
    );

    // A later schema migration requires both backfills to be complete.
    let copy = helpers
        .ensure_batched_background_migration_is_finished(
            "CopyColumnUsingBackgroundMigrationJob",
            "users",
            "id",
            copy_arguments,
        )
        .await?;
    let names = helpers
        .finalize_batched_background_migration("Backfills::NormalizeDisplayNames", "users", "id", vec![])
        .await?;
    println!("{} is {}, {} is {}", copy.key(), copy.status, names.key(), names.status);

    for row in database.rows("users").await?.iter().take(3) {
        println!("{row:?}");
    }
    Ok(())
}
