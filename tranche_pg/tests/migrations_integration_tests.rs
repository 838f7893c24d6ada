mod common;

use serial_test::serial;
use sqlx::PgPool;
use tranche_pg::migrations::Migrator;

async fn table_exists(pool: &PgPool, table: &str) -> bool {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .expect("Failed to query information_schema");
    count.0 == 1
}

async fn column_exists(pool: &PgPool, table: &str, column: &str) -> bool {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM information_schema.columns WHERE table_name = $1 AND column_name = $2",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await
    .expect("Failed to query information_schema");
    count.0 == 1
}

#[tokio::test]
#[serial]
async fn test_migrator_creates_tracking_table() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let version = migrator
        .current_version()
        .await
        .expect("Should get version");

    assert_eq!(version, 0, "Initial version should be 0");
    assert!(table_exists(&pool, "_tranche_migrations").await);

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_creates_schema() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let applied = migrator.run().await.expect("Should run migrations");
    assert_eq!(applied, 3);
    assert_eq!(migrator.current_version().await.unwrap(), 3);

    assert!(table_exists(&pool, "batched_background_migrations").await);
    assert!(table_exists(&pool, "batched_background_migration_jobs").await);
    for column in ["execution_id", "lease_expires_at", "retry_at", "last_error"] {
        assert!(
            column_exists(&pool, "batched_background_migration_jobs", column).await,
            "{column} should exist"
        );
    }

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_is_idempotent() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    assert!(!migrator.is_up_to_date().await.unwrap());
    assert_eq!(migrator.pending().await.unwrap().len(), 3);

    assert_eq!(migrator.run().await.unwrap(), 3);
    assert_eq!(migrator.run().await.unwrap(), 0);

    assert!(migrator.is_up_to_date().await.unwrap());
    assert!(migrator.pending().await.unwrap().is_empty());
    let applied = migrator.applied().await.unwrap();
    assert_eq!(
        applied.iter().map(|m| m.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(applied[0].name, "create_batched_background_migrations");

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_detects_checksum_mismatch() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    migrator.run().await.expect("Should run migrations");

    sqlx::query("UPDATE _tranche_migrations SET checksum = 'tampered' WHERE version = 2")
        .execute(&pool)
        .await
        .expect("Failed to tamper checksum");

    let result = migrator.run().await;
    assert!(matches!(
        result,
        Err(tranche_pg::MigrationError::ChecksumMismatch { version: 2, .. })
    ));

    common::teardown(&pool).await;
}
