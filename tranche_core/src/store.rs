//! Persistence of batched migrations and their jobs.
//!
//! Every state change is a compare-and-set: the caller states the status it expects and
//! the store reports whether the change applied. Concurrent runners coordinate only through
//! these operations.

use crate::job::{BatchedJob, JobClaim, JobFailure, JobStatus, NewBatchedJob};
use crate::migration::{BatchedMigration, MigrationKey, MigrationStatus, NewBatchedMigration};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Error recorded on jobs whose runner stopped renewing its lease.
pub const LEASE_EXPIRED_ERROR: &str = "job lease expired";

/// Storage backend for batched migrations.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// The error when a store operation fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Inserts a migration unless one with the same key exists.
    ///
    /// Returns `None` when the key is taken.
    async fn create_migration(
        &self,
        migration: NewBatchedMigration,
    ) -> Result<Option<BatchedMigration>, Self::Error>;

    /// The migration registered under `key`.
    async fn find_migration(
        &self,
        key: &MigrationKey,
    ) -> Result<Option<BatchedMigration>, Self::Error>;

    /// The migration with `id`.
    async fn get_migration(&self, id: i64) -> Result<Option<BatchedMigration>, Self::Error>;

    /// Migrations in any of `statuses`, ordered by id. An empty slice lists all of them.
    async fn list_migrations(
        &self,
        statuses: &[MigrationStatus],
    ) -> Result<Vec<BatchedMigration>, Self::Error>;

    /// Moves the migration to `to` if its status is one of `from`.
    ///
    /// Statuses in `from` that cannot legally move to `to` (see
    /// [`MigrationStatus::can_transition_to`]) never match.
    async fn transition_migration(
        &self,
        id: i64,
        from: &[MigrationStatus],
        to: MigrationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Sets the batch size used for the migration's next window.
    async fn update_batch_size(
        &self,
        id: i64,
        batch_size: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Deletes the migration and all its jobs.
    async fn delete_migration(&self, id: i64) -> Result<bool, Self::Error>;

    /// Inserts a pending job unless the migration already has one starting at the same value.
    ///
    /// Returns `None` when another runner created the window first.
    async fn create_job(&self, job: NewBatchedJob) -> Result<Option<BatchedJob>, Self::Error>;

    /// The job with `id`.
    async fn get_job(&self, id: i64) -> Result<Option<BatchedJob>, Self::Error>;

    /// The job covering the highest window of the migration.
    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>, Self::Error>;

    /// All jobs of the migration, ordered by `min_value`.
    async fn list_jobs(&self, migration_id: i64) -> Result<Vec<BatchedJob>, Self::Error>;

    /// Marks the job running under `claim` if its status is `from` and its migration's
    /// status is `migration_status`.
    ///
    /// Both conditions are checked in the same atomic step, so a migration paused after the
    /// runner read it never gets a new batch claimed.
    async fn claim_job(
        &self,
        id: i64,
        from: JobStatus,
        migration_status: MigrationStatus,
        claim: &JobClaim,
    ) -> Result<bool, Self::Error>;

    /// Marks a job whose window holds no rows succeeded without running it.
    ///
    /// Applies under the same conditions as [`claim_job`](Self::claim_job). The job keeps no
    /// `started_at`, which tells runners that no batch executed for it.
    async fn skip_job(
        &self,
        id: i64,
        from: JobStatus,
        migration_status: MigrationStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Extends the lease of a job still running under `execution_id`.
    async fn renew_job_lease(
        &self,
        id: i64,
        execution_id: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Marks the job succeeded if it is still running under `execution_id`.
    async fn complete_job(
        &self,
        id: i64,
        execution_id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Records a failed attempt if the job is still running under `execution_id`.
    ///
    /// Returns the updated job, with `attempts` incremented.
    async fn fail_job(
        &self,
        id: i64,
        execution_id: Uuid,
        failure: &JobFailure,
    ) -> Result<Option<BatchedJob>, Self::Error>;

    /// Fails every running job of the migration whose lease expired at `now`.
    ///
    /// Each expired job gets a failed attempt with [`LEASE_EXPIRED_ERROR`] and may be retried
    /// immediately.
    async fn expire_stale_jobs(
        &self,
        migration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchedJob>, Self::Error>;

    /// Returns failed jobs of the migration to pending with a fresh attempt budget.
    async fn reset_failed_jobs(&self, migration_id: i64) -> Result<u64, Self::Error>;
}
