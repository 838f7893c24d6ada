use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use tranche_core::job::{BatchedJob, JobClaim, JobFailure, JobStatus, NewBatchedJob};
use tranche_core::migration::{
    BatchedMigration, MigrationKey, MigrationStatus, NewBatchedMigration,
};
use tranche_core::store::{LEASE_EXPIRED_ERROR, MigrationStore};

#[derive(Debug, Default)]
struct StoreData {
    migrations: BTreeMap<i64, BatchedMigration>,
    jobs: BTreeMap<i64, BatchedJob>,
    next_migration_id: i64,
    next_job_id: i64,
}

impl StoreData {
    fn jobs_of(&self, migration_id: i64) -> impl Iterator<Item = &BatchedJob> {
        self.jobs
            .values()
            .filter(move |job| job.batched_migration_id == migration_id)
    }

    /// The job, if it is in `from` and its migration in `migration_status`.
    fn claimable_job(
        &mut self,
        id: i64,
        from: JobStatus,
        migration_status: MigrationStatus,
    ) -> Option<&mut BatchedJob> {
        let job = self.jobs.get_mut(&id).filter(|job| job.status == from)?;
        self.migrations
            .get(&job.batched_migration_id)
            .is_some_and(|migration| migration.status == migration_status)
            .then_some(job)
    }
}

/// An in-memory migration store.
///
/// Every operation holds a single lock for its whole duration, which makes each
/// compare-and-set atomic. Useful for tests and local development. Nothing is persisted.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMigrationStore {
    data: Arc<Mutex<StoreData>>,
}

impl InMemoryMigrationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryMigrationStore");
        Self::default()
    }
}

/// Errors returned by the [`InMemoryMigrationStore`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryStoreError {
    /// A job was created for a migration that does not exist.
    #[error("batched migration {0} not found")]
    MigrationNotFound(i64),
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    type Error = InMemoryStoreError;

    async fn create_migration(
        &self,
        migration: NewBatchedMigration,
    ) -> Result<Option<BatchedMigration>, Self::Error> {
        let mut data = self.data.lock().await;
        let key = migration.key();
        if data.migrations.values().any(|existing| existing.key() == key) {
            log::debug!("Batched migration {} already exists", key);
            return Ok(None);
        }
        data.next_migration_id += 1;
        let migration = migration.into_migration(data.next_migration_id);
        data.migrations.insert(migration.id, migration.clone());
        Ok(Some(migration))
    }

    async fn find_migration(
        &self,
        key: &MigrationKey,
    ) -> Result<Option<BatchedMigration>, Self::Error> {
        let data = self.data.lock().await;
        Ok(data
            .migrations
            .values()
            .find(|migration| &migration.key() == key)
            .cloned())
    }

    async fn get_migration(&self, id: i64) -> Result<Option<BatchedMigration>, Self::Error> {
        let data = self.data.lock().await;
        Ok(data.migrations.get(&id).cloned())
    }

    async fn list_migrations(
        &self,
        statuses: &[MigrationStatus],
    ) -> Result<Vec<BatchedMigration>, Self::Error> {
        let data = self.data.lock().await;
        Ok(data
            .migrations
            .values()
            .filter(|migration| statuses.is_empty() || statuses.contains(&migration.status))
            .cloned()
            .collect())
    }

    async fn transition_migration(
        &self,
        id: i64,
        from: &[MigrationStatus],
        to: MigrationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().await;
        match data.migrations.get_mut(&id) {
            Some(migration)
                if from.contains(&migration.status) && migration.status.can_transition_to(to) =>
            {
                log::debug!(
                    "Batched migration {}: {} -> {}",
                    id,
                    migration.status,
                    to
                );
                migration.status = to;
                migration.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_batch_size(
        &self,
        id: i64,
        batch_size: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().await;
        match data.migrations.get_mut(&id) {
            Some(migration) => {
                migration.batch_size = batch_size;
                migration.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_migration(&self, id: i64) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().await;
        if data.migrations.remove(&id).is_none() {
            return Ok(false);
        }
        data.jobs.retain(|_, job| job.batched_migration_id != id);
        Ok(true)
    }

    async fn create_job(&self, job: NewBatchedJob) -> Result<Option<BatchedJob>, Self::Error> {
        let mut data = self.data.lock().await;
        if !data.migrations.contains_key(&job.batched_migration_id) {
            return Err(InMemoryStoreError::MigrationNotFound(
                job.batched_migration_id,
            ));
        }
        if data
            .jobs_of(job.batched_migration_id)
            .any(|existing| existing.min_value == job.window.min_value)
        {
            return Ok(None);
        }
        data.next_job_id += 1;
        let job = job.into_job(data.next_job_id);
        data.jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn get_job(&self, id: i64) -> Result<Option<BatchedJob>, Self::Error> {
        let data = self.data.lock().await;
        Ok(data.jobs.get(&id).cloned())
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>, Self::Error> {
        let data = self.data.lock().await;
        Ok(data
            .jobs_of(migration_id)
            .max_by_key(|job| job.max_value)
            .cloned())
    }

    async fn list_jobs(&self, migration_id: i64) -> Result<Vec<BatchedJob>, Self::Error> {
        let data = self.data.lock().await;
        let mut jobs: Vec<BatchedJob> = data.jobs_of(migration_id).cloned().collect();
        jobs.sort_by_key(|job| job.min_value);
        Ok(jobs)
    }

    async fn claim_job(
        &self,
        id: i64,
        from: JobStatus,
        migration_status: MigrationStatus,
        claim: &JobClaim,
    ) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().await;
        let Some(job) = data.claimable_job(id, from, migration_status) else {
            return Ok(false);
        };
        job.status = JobStatus::Running;
        job.execution_id = Some(claim.execution_id);
        job.started_at = Some(claim.started_at);
        job.finished_at = None;
        job.lease_expires_at = Some(claim.lease_expires_at);
        Ok(true)
    }

    async fn skip_job(
        &self,
        id: i64,
        from: JobStatus,
        migration_status: MigrationStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().await;
        let Some(job) = data.claimable_job(id, from, migration_status) else {
            return Ok(false);
        };
        job.status = JobStatus::Succeeded;
        job.execution_id = None;
        job.started_at = None;
        job.finished_at = Some(finished_at);
        job.lease_expires_at = None;
        job.retry_at = None;
        Ok(true)
    }

    async fn renew_job_lease(
        &self,
        id: i64,
        execution_id: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().await;
        match data.jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.execution_id == Some(execution_id) =>
            {
                job.lease_expires_at = Some(lease_expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(
        &self,
        id: i64,
        execution_id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().await;
        match data.jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.execution_id == Some(execution_id) =>
            {
                job.status = JobStatus::Succeeded;
                job.finished_at = Some(finished_at);
                job.retry_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(
        &self,
        id: i64,
        execution_id: Uuid,
        failure: &JobFailure,
    ) -> Result<Option<BatchedJob>, Self::Error> {
        let mut data = self.data.lock().await;
        match data.jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.execution_id == Some(execution_id) =>
            {
                job.status = JobStatus::Failed;
                job.attempts += 1;
                job.finished_at = Some(failure.finished_at);
                job.retry_at = Some(failure.retry_at);
                job.last_error = Some(failure.error.clone());
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire_stale_jobs(
        &self,
        migration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchedJob>, Self::Error> {
        let mut data = self.data.lock().await;
        let mut expired = Vec::new();
        for job in data.jobs.values_mut() {
            if job.batched_migration_id == migration_id && job.lease_expired(now) {
                job.status = JobStatus::Failed;
                job.attempts += 1;
                job.finished_at = Some(now);
                job.retry_at = Some(now);
                job.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                expired.push(job.clone());
            }
        }
        Ok(expired)
    }

    async fn reset_failed_jobs(&self, migration_id: i64) -> Result<u64, Self::Error> {
        let mut data = self.data.lock().await;
        let mut reset = 0;
        for job in data.jobs.values_mut() {
            if job.batched_migration_id == migration_id && job.status == JobStatus::Failed {
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.retry_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }
}
