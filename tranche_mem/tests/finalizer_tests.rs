mod common;

use common::{COPY_JOB, FlakyJob, Harness, options};
use serde_json::json;
use tranche_core::prelude::*;

fn copy_arguments() -> Vec<serde_json::Value> {
    vec![json!(["id"]), json!(["id_copy"])]
}

#[tokio::test]
async fn finalize_drains_the_remaining_batches() {
    let harness = Harness::new();
    harness.seed_users(1..=25).await;
    harness
        .helpers
        .queue_batched_background_migration(COPY_JOB, "users", "id", copy_arguments(), options(10))
        .await
        .unwrap();

    let migration = harness
        .helpers
        .finalize_batched_background_migration(COPY_JOB, "users", "id", copy_arguments())
        .await
        .unwrap();

    assert_eq!(migration.status, MigrationStatus::Finalized);
    assert_eq!(
        harness.windows(migration.id).await,
        vec![(1, 10), (11, 20), (21, 25)]
    );
    for row in harness.database.rows("users").await.unwrap() {
        assert_eq!(row.get("id_copy"), row.get("id"));
    }
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let harness = Harness::new();
    harness.seed_users(1..=5).await;
    harness
        .helpers
        .queue_batched_background_migration(COPY_JOB, "users", "id", copy_arguments(), options(2))
        .await
        .unwrap();

    let first = harness
        .helpers
        .ensure_batched_background_migration_is_finished(COPY_JOB, "users", "id", copy_arguments())
        .await
        .unwrap();
    let second = harness
        .helpers
        .ensure_batched_background_migration_is_finished(COPY_JOB, "users", "id", copy_arguments())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.windows(first.id).await.len(), 3);
}

#[tokio::test]
async fn finalize_runs_paused_migrations_and_ignores_the_interval() {
    let harness = Harness::new();
    harness.seed_users(1..=6).await;
    let migration = harness
        .queue(
            "RecordingJob",
            QueueOptions {
                paused: true,
                ..options(2)
            },
        )
        .await;

    let finalized = harness
        .helpers
        .finalize_batched_background_migration("RecordingJob", "users", "id", vec![])
        .await
        .unwrap();

    assert_eq!(finalized.id, migration.id);
    assert_eq!(finalized.status, MigrationStatus::Finalized);
    assert_eq!(
        harness.recording.windows().await,
        vec![(1, 2), (3, 4), (5, 6)]
    );
}

#[tokio::test]
async fn finalize_gives_failed_batches_another_chance() {
    let config = RunnerConfig {
        retry_limit: 1,
        ..RunnerConfig::default()
    };
    let harness = Harness::with_config(config, FlakyJob::failing(1));
    harness.seed_users(1..=4).await;
    let migration = harness.queue("FlakyJob", options(2)).await;
    harness
        .run_to_completion(migration.id, chrono::Utc::now())
        .await;
    assert_eq!(
        harness.migration(migration.id).await.status,
        MigrationStatus::Failed
    );

    let finalized = harness
        .helpers
        .finalize_batched_background_migration("FlakyJob", "users", "id", vec![])
        .await
        .unwrap();

    assert_eq!(finalized.status, MigrationStatus::Finalized);
    assert_eq!(harness.windows(migration.id).await, vec![(1, 2), (3, 4)]);
}

#[tokio::test]
async fn finalize_reports_a_batch_that_keeps_failing() {
    let config = RunnerConfig {
        retry_limit: 2,
        ..RunnerConfig::default()
    };
    let harness = Harness::with_config(config, FlakyJob::failing(u32::MAX));
    harness.seed_users(1..=4).await;
    let migration = harness.queue("FlakyJob", options(2)).await;

    let result = harness
        .helpers
        .finalize_batched_background_migration("FlakyJob", "users", "id", vec![])
        .await;

    assert!(matches!(result, Err(FinalizeError::Failed { id, .. }) if id == migration.id));
    assert_eq!(harness.flaky.calls(), 2);
    assert_eq!(
        harness.migration(migration.id).await.status,
        MigrationStatus::Failed
    );
}

#[tokio::test]
async fn finalize_of_an_unknown_migration_is_an_error() {
    let harness = Harness::new();
    harness.seed_users(1..=4).await;

    let result = harness
        .helpers
        .finalize_batched_background_migration("RecordingJob", "users", "id", vec![])
        .await;

    assert!(matches!(result, Err(FinalizeError::NotFound(_))));
}

#[tokio::test]
async fn finalize_matches_job_arguments() {
    let harness = Harness::new();
    harness.seed_users(1..=4).await;
    harness
        .helpers
        .queue_batched_background_migration(COPY_JOB, "users", "id", copy_arguments(), options(2))
        .await
        .unwrap();

    let result = harness
        .helpers
        .finalize_batched_background_migration(COPY_JOB, "users", "id", vec![json!(["name"])])
        .await;

    assert!(matches!(result, Err(FinalizeError::NotFound(_))));
}

#[tokio::test]
async fn deleting_through_the_helpers() {
    let harness = Harness::new();
    harness.seed_users(1..=4).await;
    harness
        .helpers
        .queue_batched_background_migration(COPY_JOB, "users", "id", copy_arguments(), options(2))
        .await
        .unwrap();

    assert!(
        harness
            .helpers
            .delete_batched_background_migration(COPY_JOB, "users", "id", copy_arguments())
            .await
            .unwrap()
    );
    assert!(harness.store.list_migrations(&[]).await.unwrap().is_empty());
}
