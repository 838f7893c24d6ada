//! Schema of the PostgreSQL backend.
//!
//! The tables backing [`PgMigrationStore`](crate::PgMigrationStore) are created by a small
//! embedded migrator. Schema migrations are versioned, checksummed, and tracked in the
//! `_tranche_migrations` table.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tranche_pg::migrations::Migrator;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://...").await?;
//! let migrator = Migrator::new(pool);
//!
//! let applied = migrator.run().await?;
//! log::info!("Applied {} schema migrations, now at {}", applied, migrator.current_version().await?);
//! ```
//!
//! # Adding New Migrations
//!
//! 1. Create a new file `mXXX_description.rs` in this directory
//! 2. Implement the `Migration` trait
//! 3. Add the migration to the `MIGRATIONS` array in this file

mod m001_create_batched_background_migrations;
mod m002_create_batched_background_migration_jobs;
mod m003_add_job_lease_columns;

use m001_create_batched_background_migrations::CreateBatchedBackgroundMigrations;
use m002_create_batched_background_migration_jobs::CreateBatchedBackgroundMigrationJobs;
use m003_add_job_lease_columns::AddJobLeaseColumns;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};

/// All migrations in order. Add new migrations to the end.
///
/// There is no `down()`: a change to the schema ships as a new forward migration.
const MIGRATIONS: &[&dyn Migration] = &[
    &CreateBatchedBackgroundMigrations,
    &CreateBatchedBackgroundMigrationJobs,
    &AddJobLeaseColumns,
];

/// Errors raised while applying the schema.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The database failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An applied migration no longer matches its definition.
    #[error("Migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: String,
        /// Checksum recorded when it was applied.
        expected: String,
        /// Checksum of the current definition.
        found: String,
    },

    /// A migration's statements failed.
    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: String,
        /// The database error.
        reason: String,
    },
}

/// One forward step of the schema.
///
/// ```rust,ignore
/// pub struct AddJobMetricsColumn;
///
/// #[async_trait]
/// impl Migration for AddJobMetricsColumn {
///     fn version(&self) -> i64 { 4 }
///
///     fn name(&self) -> &'static str { "add_job_metrics_column" }
///
///     async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
///         sqlx::query("ALTER TABLE batched_background_migration_jobs ADD COLUMN metrics JSONB")
///             .execute(&mut **tx)
///             .await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, increasing version.
    fn version(&self) -> i64;

    /// Human-readable name (e.g., "create_batched_background_migrations").
    fn name(&self) -> &'static str;

    /// Applies the step inside `tx`. The migrator commits.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// SHA-256 of the version and name, recorded when the step is applied.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A row of `_tranche_migrations`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    /// Version of the migration.
    pub version: i64,
    /// Name of the migration.
    pub name: String,
    /// When it was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Checksum recorded when it was applied.
    pub checksum: String,
}

/// Applies the schema of the PostgreSQL backend, each step exactly once and in order.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _tranche_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn verify_checksums(applied: &[AppliedMigration]) -> Result<(), MigrationError> {
        for record in applied {
            let Some(migration) = MIGRATIONS.iter().find(|m| m.version() == record.version) else {
                continue;
            };
            let found = migration.checksum();
            if found != record.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    version: record.version,
                    name: record.name.clone(),
                    expected: record.checksum.clone(),
                    found,
                });
            }
        }
        Ok(())
    }

    /// Applies every pending migration, each in its own transaction.
    ///
    /// A failing migration is rolled back; those before it stay applied. Returns the number
    /// of migrations applied.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        let applied = self.applied().await?;
        Self::verify_checksums(&applied)?;

        let mut count = 0;
        for migration in MIGRATIONS {
            if applied.iter().any(|record| record.version == migration.version()) {
                log::debug!(
                    "Schema migration {} ({}) already applied",
                    migration.version(),
                    migration.name()
                );
                continue;
            }

            log::info!(
                "Applying schema migration {} ({})",
                migration.version(),
                migration.name()
            );

            let mut tx = self.pool.begin().await?;
            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query("INSERT INTO _tranche_migrations (version, name, checksum) VALUES ($1, $2, $3)")
                .bind(migration.version())
                .bind(migration.name())
                .bind(migration.checksum())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            count += 1;
        }

        if count > 0 {
            log::info!("Applied {} schema migrations", count);
        }
        Ok(count)
    }

    /// Highest applied version, 0 when none.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _tranche_migrations")
                .fetch_one(&self.pool)
                .await?;

        Ok(version.unwrap_or(0))
    }

    /// Whether every known migration has been applied.
    pub async fn is_up_to_date(&self) -> Result<bool, MigrationError> {
        Ok(self.pending().await?.is_empty())
    }

    /// Migrations not yet applied, in order.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        let applied = self.applied().await?;

        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied.iter().any(|record| record.version == m.version()))
            .copied()
            .collect())
    }

    /// Applied migrations, in version order.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;

        Ok(sqlx::query_as::<_, AppliedMigration>(
            "SELECT version, name, applied_at, checksum FROM _tranche_migrations ORDER BY version ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
