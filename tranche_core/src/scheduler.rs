//! Registration and operator control of batched migrations.

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_SUB_BATCH_SIZE, MINIMUM_INTERVAL, SchedulerConfig};
use crate::introspection::{IntrospectionError, TableIntrospector};
use crate::job::JobStatus;
use crate::migration::{
    BatchedMigration, MigrationConfiguration, MigrationKey, MigrationStatus, NewBatchedMigration,
};
use crate::registry::JobRegistry;
use crate::store::MigrationStore;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Per-call options of [`Scheduler::queue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Width of each batch window.
    pub batch_size: i64,
    /// Width of each inner chunk.
    pub sub_batch_size: i64,
    /// Minimum delay between batches. Raised to the scheduler's minimum if lower.
    pub interval: Duration,
    /// Enables adaptive batch sizing up to this ceiling.
    pub max_batch_size: Option<i64>,
    /// Lower bound to use instead of the column's current minimum.
    pub batch_min_value: Option<i64>,
    /// Upper bound to use instead of the column's current maximum.
    pub batch_max_value: Option<i64>,
    /// Register the migration paused.
    pub paused: bool,
    /// The database the table lives in.
    pub schema_name: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            interval: MINIMUM_INTERVAL,
            max_batch_size: None,
            batch_min_value: None,
            batch_max_value: None,
            paused: false,
            schema_name: "main".to_string(),
        }
    }
}

impl QueueOptions {
    /// Checks the sizing options are consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size <= 0 {
            return Err(format!("batch_size must be positive, got {}", self.batch_size));
        }
        if self.sub_batch_size <= 0 {
            return Err(format!(
                "sub_batch_size must be positive, got {}",
                self.sub_batch_size
            ));
        }
        if self.sub_batch_size > self.batch_size {
            return Err(format!(
                "sub_batch_size {} exceeds batch_size {}",
                self.sub_batch_size, self.batch_size
            ));
        }
        if let Some(max_batch_size) = self.max_batch_size {
            if max_batch_size < self.batch_size {
                return Err(format!(
                    "max_batch_size {} is below batch_size {}",
                    max_batch_size, self.batch_size
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.batch_min_value, self.batch_max_value) {
            if min > max {
                return Err(format!("batch_min_value {min} exceeds batch_max_value {max}"));
            }
        }
        Ok(())
    }
}

/// Result of [`Scheduler::queue`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// A new migration was registered.
    Queued(BatchedMigration),
    /// A migration with the same configuration already existed. Nothing changed.
    AlreadyQueued(BatchedMigration),
}

impl QueueOutcome {
    /// The registered migration.
    pub fn migration(&self) -> &BatchedMigration {
        match self {
            QueueOutcome::Queued(migration) | QueueOutcome::AlreadyQueued(migration) => migration,
        }
    }

    /// Whether this call registered the migration.
    pub fn is_new(&self) -> bool {
        matches!(self, QueueOutcome::Queued(_))
    }
}

/// Errors when queueing a migration.
#[derive(Debug, thiserror::Error)]
pub enum QueueError<E>
where
    E: std::error::Error + 'static,
{
    /// The job class is not registered.
    #[error("job class {0} is not registered")]
    UnknownJobClass(String),
    /// The options are inconsistent.
    #[error("invalid queue options: {0}")]
    InvalidOptions(String),
    /// A migration with the same key exists with other job arguments.
    #[error("batched migration {key} already exists with job arguments {existing}")]
    ArgumentsMismatch {
        /// The contested key.
        key: MigrationKey,
        /// Arguments of the existing migration.
        existing: Value,
    },
    /// The table extent could not be read.
    #[error(transparent)]
    Introspection(#[from] IntrospectionError),
    /// The store failed.
    #[error("migration store error: {0}")]
    Store(#[source] E),
}

/// Errors of the operator controls.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError<E>
where
    E: std::error::Error + 'static,
{
    /// No migration has the requested id.
    #[error("batched migration {0} not found")]
    NotFound(i64),
    /// The migration's status does not allow the change.
    #[error("batched migration {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The migration.
        id: i64,
        /// Its current status.
        from: MigrationStatus,
        /// The requested status.
        to: MigrationStatus,
    },
    /// The store failed.
    #[error("migration store error: {0}")]
    Store(#[source] E),
}

/// Progress of a migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationProgress {
    /// Current status.
    pub status: MigrationStatus,
    /// Every value up to and including this one has been processed.
    pub completed_through: Option<i64>,
    /// Batches that succeeded.
    pub succeeded_batches: usize,
    /// Failed attempts recorded across all batches.
    pub failed_attempts: i64,
    /// Share of the range processed, from 0 to 100.
    pub percent_complete: f64,
}

/// Registers batched migrations and exposes operator controls over them.
pub struct Scheduler<S, I> {
    store: S,
    introspector: I,
    registry: Arc<JobRegistry>,
    config: SchedulerConfig,
}

impl<S, I> Scheduler<S, I>
where
    S: MigrationStore,
    I: TableIntrospector,
{
    /// Creates a scheduler accepting the job classes in `registry`.
    pub fn new(store: S, introspector: I, registry: Arc<JobRegistry>, config: SchedulerConfig) -> Self {
        Self {
            store,
            introspector,
            registry,
            config,
        }
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registers a migration covering the column's current extent.
    ///
    /// Queueing a configuration that is already registered returns the existing migration
    /// unchanged. A table without rows is registered directly as `finished`.
    pub async fn queue(
        &self,
        configuration: MigrationConfiguration,
        options: QueueOptions,
    ) -> Result<QueueOutcome, QueueError<S::Error>> {
        self.queue_at(configuration, options, Utc::now()).await
    }

    /// [`queue`](Self::queue) as of `now`.
    pub async fn queue_at(
        &self,
        configuration: MigrationConfiguration,
        options: QueueOptions,
        now: DateTime<Utc>,
    ) -> Result<QueueOutcome, QueueError<S::Error>> {
        let configuration = MigrationConfiguration::new(
            &configuration.job_class_name,
            configuration.table_name,
            configuration.column_name,
            configuration.job_arguments,
        );

        if !self.registry.contains(&configuration.job_class_name) {
            return Err(QueueError::UnknownJobClass(configuration.job_class_name));
        }
        options.validate().map_err(QueueError::InvalidOptions)?;

        if let Some(outcome) = self.existing(&configuration).await? {
            return Ok(outcome);
        }

        let bounds = self
            .introspector
            .column_bounds(&configuration.table_name, &configuration.column_name)
            .await?;
        let (status, min_value, max_value) = match (bounds, options.batch_max_value) {
            (None, None) => {
                let value = options.batch_min_value.unwrap_or(1);
                (MigrationStatus::Finished, value, value)
            }
            (bounds, batch_max_value) => {
                let min_value = options
                    .batch_min_value
                    .or(bounds.map(|(min, _)| min))
                    .unwrap_or(1);
                let max_value = batch_max_value
                    .or(bounds.map(|(_, max)| max))
                    .unwrap_or(min_value);
                let status = if options.paused {
                    MigrationStatus::Paused
                } else {
                    MigrationStatus::Active
                };
                (status, min_value, max_value)
            }
        };
        if min_value > max_value {
            return Err(QueueError::InvalidOptions(format!(
                "min_value {min_value} exceeds max_value {max_value}"
            )));
        }

        let interval = if options.interval < self.config.minimum_interval {
            debug!(
                "Raising interval of {} from {:?} to {:?}",
                configuration.key(),
                options.interval,
                self.config.minimum_interval
            );
            self.config.minimum_interval
        } else {
            options.interval
        };

        let new_migration = NewBatchedMigration {
            job_class_name: configuration.job_class_name.clone(),
            table_name: configuration.table_name.clone(),
            column_name: configuration.column_name.clone(),
            schema_name: options.schema_name,
            job_arguments: configuration.job_arguments.clone(),
            min_value,
            max_value,
            batch_size: options.batch_size,
            sub_batch_size: options.sub_batch_size,
            max_batch_size: options.max_batch_size,
            interval,
            status,
            created_at: now,
        };

        match self
            .store
            .create_migration(new_migration)
            .await
            .map_err(QueueError::Store)?
        {
            Some(migration) => {
                info!(
                    "Queued batched migration {} ({}) over {}..={} as {}",
                    migration.id,
                    migration.key(),
                    migration.min_value,
                    migration.max_value,
                    migration.status
                );
                Ok(QueueOutcome::Queued(migration))
            }
            None => self.existing(&configuration).await?.ok_or_else(|| {
                QueueError::InvalidOptions(format!(
                    "batched migration {} vanished while being queued",
                    configuration.key()
                ))
            }),
        }
    }

    async fn existing(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<QueueOutcome>, QueueError<S::Error>> {
        let Some(migration) = self
            .store
            .find_migration(&configuration.key())
            .await
            .map_err(QueueError::Store)?
        else {
            return Ok(None);
        };

        if migration.job_arguments != configuration.job_arguments {
            return Err(QueueError::ArgumentsMismatch {
                key: migration.key(),
                existing: Value::Array(migration.job_arguments),
            });
        }

        warn!(
            "Batched migration not queued because it already exists: {}",
            configuration
        );
        Ok(Some(QueueOutcome::AlreadyQueued(migration)))
    }

    /// The migration described by `configuration`.
    pub async fn find(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>, S::Error> {
        let migration = self.store.find_migration(&configuration.key()).await?;
        Ok(migration.filter(|migration| configuration.matches(migration)))
    }

    /// Deletes the migration described by `configuration` along with its jobs.
    ///
    /// Returns `false` when no such migration exists.
    pub async fn dequeue(&self, configuration: &MigrationConfiguration) -> Result<bool, S::Error> {
        let Some(migration) = self.find(configuration).await? else {
            debug!("No batched migration to delete for {}", configuration);
            return Ok(false);
        };
        let deleted = self.store.delete_migration(migration.id).await?;
        if deleted {
            info!(
                "Deleted batched migration {} ({})",
                migration.id,
                migration.key()
            );
        }
        Ok(deleted)
    }

    /// Stops scheduling new batches of an active migration.
    pub async fn pause(&self, id: i64) -> Result<BatchedMigration, SchedulerError<S::Error>> {
        self.transition(id, MigrationStatus::Active, MigrationStatus::Paused)
            .await
    }

    /// Resumes a paused migration.
    pub async fn resume(&self, id: i64) -> Result<BatchedMigration, SchedulerError<S::Error>> {
        self.transition(id, MigrationStatus::Paused, MigrationStatus::Active)
            .await
    }

    /// Reactivates a failed migration, giving its failed batches a fresh attempt budget.
    pub async fn retry(&self, id: i64) -> Result<BatchedMigration, SchedulerError<S::Error>> {
        let migration = self.get(id).await?;
        if migration.status != MigrationStatus::Failed {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: migration.status,
                to: MigrationStatus::Active,
            });
        }
        let reset = self
            .store
            .reset_failed_jobs(id)
            .await
            .map_err(SchedulerError::Store)?;
        debug!("Reset {} failed batches of batched migration {}", reset, id);
        self.transition(id, MigrationStatus::Failed, MigrationStatus::Active)
            .await
    }

    /// Reports how far the migration has progressed.
    pub async fn progress(&self, id: i64) -> Result<MigrationProgress, SchedulerError<S::Error>> {
        let migration = self.get(id).await?;
        let jobs = self
            .store
            .list_jobs(id)
            .await
            .map_err(SchedulerError::Store)?;

        let mut completed_through = None;
        let mut expected_min = migration.min_value;
        for job in jobs.iter().filter(|job| job.status == JobStatus::Succeeded) {
            if job.min_value != expected_min {
                break;
            }
            completed_through = Some(job.max_value);
            match job.max_value.checked_add(1) {
                Some(next) => expected_min = next,
                None => break,
            }
        }

        let percent_complete = match migration.status {
            MigrationStatus::Finished | MigrationStatus::Finalized => 100.0,
            _ => {
                let total = (migration.max_value as f64 - migration.min_value as f64) + 1.0;
                let done = completed_through
                    .map(|through| (through as f64 - migration.min_value as f64) + 1.0)
                    .unwrap_or(0.0);
                (done / total * 100.0).clamp(0.0, 100.0)
            }
        };

        Ok(MigrationProgress {
            status: migration.status,
            completed_through,
            succeeded_batches: jobs
                .iter()
                .filter(|job| job.status == JobStatus::Succeeded)
                .count(),
            failed_attempts: jobs.iter().map(|job| i64::from(job.attempts)).sum(),
            percent_complete,
        })
    }

    async fn get(&self, id: i64) -> Result<BatchedMigration, SchedulerError<S::Error>> {
        self.store
            .get_migration(id)
            .await
            .map_err(SchedulerError::Store)?
            .ok_or(SchedulerError::NotFound(id))
    }

    async fn transition(
        &self,
        id: i64,
        from: MigrationStatus,
        to: MigrationStatus,
    ) -> Result<BatchedMigration, SchedulerError<S::Error>> {
        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition { id, from, to });
        }
        let applied = self
            .store
            .transition_migration(id, &[from], to, Utc::now())
            .await
            .map_err(SchedulerError::Store)?;
        let migration = self.get(id).await?;
        if !applied {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: migration.status,
                to,
            });
        }
        info!(
            "Batched migration {} ({}) moved from {} to {}",
            id,
            migration.key(),
            from,
            to
        );
        Ok(migration)
    }
}
