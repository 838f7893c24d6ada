//! Executes batched migrations one window at a time.
//!
//! A step of the runner advances a single migration by at most one executed batch:
//!
//! 1. Skip unless the migration is `active`.
//! 2. Fail running jobs whose lease expired.
//! 3. Wait while a batch is held, a failed batch is backing off, or the interval since the
//!    previous batch has not elapsed.
//! 4. Pick the window: retry the failed or pending job, or create the next one.
//!    No next window means the migration is finished.
//! 5. Claim the job with a fresh execution id and run the registered [`BatchJob`], renewing
//!    the claim's lease while it runs. Windows without rows are recorded without running it.
//! 6. Record the outcome and adjust the batch size.
//!
//! Steps are safe to run concurrently from several workers. Claims, completions and
//! failures are compare-and-set operations on the store, and claims also require the
//! migration to still be in the status the step started from. At most one worker executes a
//! given window at a time, and none does once the migration is paused.

use crate::boundary::BatchBoundaryCalculator;
use crate::config::{MigrationFailureInfo, RunnerConfig};
use crate::introspection::{IntrospectionError, TableIntrospector};
use crate::job::{BatchedJob, JobClaim, JobFailure, JobStatus, NewBatchedJob};
use crate::migration::{BatchedMigration, MigrationStatus};
use crate::optimizer::BatchOptimizer;
use crate::registry::{BatchContext, BatchJob, BoxError, JobRegistry};
use crate::retry::calculate_retry_delay;
use crate::store::MigrationStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Errors that abort a runner step.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError<E>
where
    E: std::error::Error + 'static,
{
    /// The store failed.
    #[error("migration store error: {0}")]
    Store(#[source] E),
    /// No migration has the requested id.
    #[error("batched migration {0} not found")]
    MigrationNotFound(i64),
    /// The migration names a job class missing from the registry. The migration is marked
    /// failed.
    #[error("job class {0} is not registered")]
    UnknownJobClass(String),
    /// The table could not be inspected. The migration is marked failed.
    #[error("boundary computation failed for batched migration {migration_id}: {source}")]
    Boundary {
        /// The failed migration.
        migration_id: i64,
        /// The introspection error.
        #[source]
        source: IntrospectionError,
    },
}

/// What a runner step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The migration is not in a schedulable state.
    NotActive(MigrationStatus),
    /// The interval since the previous batch has not elapsed.
    Throttled {
        /// When the next batch becomes eligible.
        next_run_at: DateTime<Utc>,
    },
    /// Another worker holds the current batch.
    BatchInFlight {
        /// The held job.
        job_id: i64,
    },
    /// The current batch failed and waits for its retry time.
    BackingOff {
        /// The failed job.
        job_id: i64,
        /// When it may be retried.
        retry_at: DateTime<Utc>,
    },
    /// Another worker created or claimed the window first.
    ClaimLost,
    /// A batch ran and succeeded.
    BatchSucceeded(BatchedJob),
    /// A batch ran and failed.
    BatchFailed {
        /// The job, with the failed attempt recorded.
        job: BatchedJob,
        /// Whether another attempt is allowed.
        will_retry: bool,
    },
    /// Windows without rows were recorded as succeeded without running the job.
    EmptyWindowsSkipped {
        /// Highest value covered by the skipped windows.
        through: i64,
        /// Number of windows skipped.
        windows: u32,
    },
    /// Every window has been processed.
    MigrationFinished,
    /// The migration was marked failed.
    MigrationFailed {
        /// Why it failed.
        reason: String,
    },
}

/// Result of stepping one migration inside [`BatchedMigrationRunner::run_due_migrations`].
pub type MigrationRun<E> = (i64, Result<StepOutcome, RunnerError<E>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepMode {
    Scheduled,
    Finalizing,
}

impl StepMode {
    fn expected_status(self) -> MigrationStatus {
        match self {
            StepMode::Scheduled => MigrationStatus::Active,
            StepMode::Finalizing => MigrationStatus::Finalizing,
        }
    }

    fn admits(self, status: MigrationStatus) -> bool {
        match self {
            StepMode::Scheduled => status.allows_scheduling(),
            StepMode::Finalizing => status == MigrationStatus::Finalizing,
        }
    }
}

/// Advances batched migrations by executing their batches.
pub struct BatchedMigrationRunner<S, I> {
    store: S,
    introspector: I,
    registry: Arc<JobRegistry>,
    config: RunnerConfig,
}

impl<S, I> BatchedMigrationRunner<S, I>
where
    S: MigrationStore,
    I: TableIntrospector,
{
    /// Creates a runner resolving job classes through `registry`.
    pub fn new(store: S, introspector: I, registry: Arc<JobRegistry>, config: RunnerConfig) -> Self {
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

    /// The runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs one step of the migration.
    pub async fn run_migration_job(
        &self,
        migration_id: i64,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        self.run_migration_job_at(migration_id, Utc::now()).await
    }

    /// Runs one step of the migration as of `now`.
    pub async fn run_migration_job_at(
        &self,
        migration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        self.step(migration_id, now, StepMode::Scheduled).await
    }

    /// Runs one step of every active migration, up to `max_concurrent_migrations` at a time.
    ///
    /// A failing migration does not stop the others. Results are ordered by migration id.
    pub async fn run_due_migrations(
        &self,
    ) -> Result<Vec<MigrationRun<S::Error>>, RunnerError<S::Error>> {
        self.run_due_migrations_at(Utc::now()).await
    }

    /// [`run_due_migrations`](Self::run_due_migrations) as of `now`.
    pub async fn run_due_migrations_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MigrationRun<S::Error>>, RunnerError<S::Error>> {
        let migrations = self
            .store
            .list_migrations(&[MigrationStatus::Active])
            .await
            .map_err(RunnerError::Store)?;

        let mut runs: Vec<MigrationRun<S::Error>> = stream::iter(migrations)
            .map(|migration| async move {
                (
                    migration.id,
                    self.run_migration_job_at(migration.id, now).await,
                )
            })
            .buffer_unordered(self.config.max_concurrent_migrations.max(1))
            .collect()
            .await;

        for (migration_id, result) in &runs {
            if let Err(err) = result {
                error!("Step of batched migration {} failed: {}", migration_id, err);
            }
        }
        runs.sort_by_key(|(migration_id, _)| *migration_id);
        Ok(runs)
    }

    /// Runs one step of a migration being drained by a finalizer.
    ///
    /// Interval throttling and retry backoff do not apply.
    pub(crate) async fn run_finalizing_step(
        &self,
        migration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        self.step(migration_id, now, StepMode::Finalizing).await
    }

    async fn step(
        &self,
        migration_id: i64,
        now: DateTime<Utc>,
        mode: StepMode,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        let migration = self
            .store
            .get_migration(migration_id)
            .await
            .map_err(RunnerError::Store)?
            .ok_or(RunnerError::MigrationNotFound(migration_id))?;

        if !mode.admits(migration.status) {
            debug!(
                "Skipping batched migration {} in status {}",
                migration.id, migration.status
            );
            return Ok(StepOutcome::NotActive(migration.status));
        }

        let Some(job_class) = self.registry.get(&migration.job_class_name) else {
            let reason = format!("job class {} is not registered", migration.job_class_name);
            self.fail_migration(&migration, mode, now, reason).await?;
            return Err(RunnerError::UnknownJobClass(
                migration.job_class_name.clone(),
            ));
        };

        let expired = self
            .store
            .expire_stale_jobs(migration.id, now)
            .await
            .map_err(RunnerError::Store)?;
        for job in &expired {
            warn!(
                "Lease of batch {}..={} of batched migration {} expired (attempt {})",
                job.min_value, job.max_value, migration.id, job.attempts
            );
        }

        let mut skipped = 0u32;
        loop {
            let previous = self
                .store
                .last_job(migration.id)
                .await
                .map_err(RunnerError::Store)?;

            let (job, has_rows) = match previous {
                Some(job) if job.status == JobStatus::Running => {
                    debug!(
                        "Batch {}..={} of batched migration {} is still running",
                        job.min_value, job.max_value, migration.id
                    );
                    return Ok(StepOutcome::BatchInFlight { job_id: job.id });
                }
                Some(job) if job.status == JobStatus::Failed => {
                    if !job.is_retriable(self.config.retry_limit) {
                        let reason = format!(
                            "batch {}..={} failed {} times",
                            job.min_value, job.max_value, job.attempts
                        );
                        return self.fail_migration(&migration, mode, now, reason).await;
                    }
                    if mode == StepMode::Scheduled {
                        if let Some(retry_at) = job.retry_at.filter(|retry_at| *retry_at > now) {
                            debug!(
                                "Batch {}..={} of batched migration {} backs off until {}",
                                job.min_value, job.max_value, migration.id, retry_at
                            );
                            return Ok(StepOutcome::BackingOff {
                                job_id: job.id,
                                retry_at,
                            });
                        }
                    }
                    (job, None)
                }
                Some(job) if job.status == JobStatus::Pending => (job, None),
                previous => {
                    // Skipped windows never started and do not throttle.
                    if mode == StepMode::Scheduled && skipped == 0 {
                        let next_run_at = previous
                            .as_ref()
                            .and_then(|job| job.started_at)
                            .map(|started_at| add_duration(started_at, migration.interval));
                        if let Some(next_run_at) = next_run_at.filter(|at| *at > now) {
                            debug!(
                                "Batched migration {} throttled until {}",
                                migration.id, next_run_at
                            );
                            return Ok(StepOutcome::Throttled { next_run_at });
                        }
                    }

                    let Some(start) =
                        BatchBoundaryCalculator::next_start(&migration, previous.as_ref())
                    else {
                        return self.finish_migration(&migration, mode, now).await;
                    };
                    let first_value = self
                        .inspect(
                            &migration,
                            mode,
                            now,
                            self.introspector.next_value_at_or_after(
                                &migration.table_name,
                                &migration.column_name,
                                start,
                            ),
                        )
                        .await?;
                    let window = BatchBoundaryCalculator::window_at(
                        start,
                        migration.max_value,
                        migration.batch_size,
                        first_value,
                    );

                    let new_job = NewBatchedJob {
                        batched_migration_id: migration.id,
                        window,
                        batch_size: migration.batch_size,
                        sub_batch_size: migration.sub_batch_size,
                        created_at: now,
                    };
                    match self
                        .store
                        .create_job(new_job)
                        .await
                        .map_err(RunnerError::Store)?
                    {
                        Some(job) => {
                            let has_rows = first_value.is_some_and(|value| window.contains(value));
                            (job, Some(has_rows))
                        }
                        None => {
                            debug!(
                                "Window {}..={} of batched migration {} was created by another worker",
                                window.min_value, window.max_value, migration.id
                            );
                            return Ok(StepOutcome::ClaimLost);
                        }
                    }
                }
            };

            let has_rows = match has_rows {
                Some(has_rows) => has_rows,
                None => {
                    self.inspect(
                        &migration,
                        mode,
                        now,
                        self.introspector.has_rows_between(
                            &migration.table_name,
                            &migration.column_name,
                            job.window(),
                        ),
                    )
                    .await?
                }
            };

            if has_rows {
                let claim = JobClaim::new(now, self.config.job_lease);
                if !self
                    .store
                    .claim_job(job.id, job.status, mode.expected_status(), &claim)
                    .await
                    .map_err(RunnerError::Store)?
                {
                    debug!(
                        "Batch {}..={} of batched migration {} could not be claimed",
                        job.min_value, job.max_value, migration.id
                    );
                    return self.claim_refused(migration.id, mode).await;
                }
                return self.execute(&migration, job_class, job, claim, mode).await;
            }

            if !self
                .store
                .skip_job(job.id, job.status, mode.expected_status(), now)
                .await
                .map_err(RunnerError::Store)?
            {
                return self.claim_refused(migration.id, mode).await;
            }
            skipped += 1;
            debug!(
                "Window {}..={} of batched migration {} has no rows",
                job.min_value, job.max_value, migration.id
            );

            if job.max_value >= migration.max_value {
                return self.finish_migration(&migration, mode, now).await;
            }
            if skipped >= self.config.max_empty_windows_per_step.max(1) {
                return Ok(StepOutcome::EmptyWindowsSkipped {
                    through: job.max_value,
                    windows: skipped,
                });
            }
        }
    }

    /// Awaits a table inspection. A failed inspection fails the migration.
    async fn inspect<T>(
        &self,
        migration: &BatchedMigration,
        mode: StepMode,
        now: DateTime<Utc>,
        inspection: impl Future<Output = Result<T, IntrospectionError>>,
    ) -> Result<T, RunnerError<S::Error>> {
        match inspection.await {
            Ok(value) => Ok(value),
            Err(source) => {
                self.fail_migration(migration, mode, now, source.to_string())
                    .await?;
                Err(RunnerError::Boundary {
                    migration_id: migration.id,
                    source,
                })
            }
        }
    }

    /// Reports why the store refused to claim or skip a job.
    async fn claim_refused(
        &self,
        migration_id: i64,
        mode: StepMode,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        let migration = self
            .store
            .get_migration(migration_id)
            .await
            .map_err(RunnerError::Store)?
            .ok_or(RunnerError::MigrationNotFound(migration_id))?;
        if mode.admits(migration.status) {
            debug!(
                "Batch of batched migration {} was taken by another worker",
                migration_id
            );
            return Ok(StepOutcome::ClaimLost);
        }
        info!(
            "Batched migration {} moved to {} before its next batch was claimed",
            migration_id, migration.status
        );
        Ok(StepOutcome::NotActive(migration.status))
    }

    async fn execute(
        &self,
        migration: &BatchedMigration,
        job_class: Arc<dyn BatchJob>,
        job: BatchedJob,
        claim: JobClaim,
        mode: StepMode,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        let batch = BatchContext {
            migration_id: migration.id,
            job_id: job.id,
            schema_name: migration.schema_name.clone(),
            table_name: migration.table_name.clone(),
            column_name: migration.column_name.clone(),
            window: job.window(),
            batch_size: job.batch_size,
            sub_batch_size: job.sub_batch_size,
            job_arguments: migration.job_arguments.clone(),
            attempt: job.attempts + 1,
        };

        info!(
            "Running batch {}..={} of batched migration {} ({}), attempt {}",
            job.min_value,
            job.max_value,
            migration.id,
            migration.job_class_name,
            batch.attempt
        );

        let started = Instant::now();
        let renewal = self.config.job_lease_renewal.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + renewal, renewal);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let perform = self.perform(job_class.as_ref(), &batch);
        tokio::pin!(perform);
        let result = loop {
            tokio::select! {
                result = &mut perform => break result,
                _ = heartbeat.tick() => {
                    let lease_expires_at = add_duration(
                        claim.started_at,
                        started.elapsed().saturating_add(self.config.job_lease),
                    );
                    match self
                        .store
                        .renew_job_lease(job.id, claim.execution_id, lease_expires_at)
                        .await
                    {
                        Ok(true) => debug!(
                            "Renewed lease of batch {}..={} of batched migration {} until {}",
                            job.min_value, job.max_value, migration.id, lease_expires_at
                        ),
                        Ok(false) => {
                            warn!(
                                "Batch {}..={} of batched migration {} lost its claim, stopping it",
                                job.min_value, job.max_value, migration.id
                            );
                            return Ok(StepOutcome::ClaimLost);
                        }
                        Err(err) => warn!(
                            "Could not renew lease of batch {}..={} of batched migration {}: {}",
                            job.min_value, job.max_value, migration.id, err
                        ),
                    }
                }
            }
        };
        let duration = started.elapsed();
        let finished_at = add_duration(claim.started_at, duration);

        match result {
            Ok(()) => {
                self.record_success(migration, job, claim, duration, finished_at, mode)
                    .await
            }
            Err(err) => {
                let failure = JobFailure {
                    error: err.to_string(),
                    finished_at,
                    retry_at: add_duration(
                        finished_at,
                        calculate_retry_delay(
                            &self.config,
                            migration.interval,
                            (job.attempts.max(0) as u32).saturating_add(1),
                        ),
                    ),
                };
                self.record_failure(migration, job, claim, failure, mode)
                    .await
            }
        }
    }

    async fn perform(&self, job_class: &dyn BatchJob, batch: &BatchContext) -> Result<(), BoxError> {
        match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, job_class.perform(batch)).await {
                Ok(result) => result,
                Err(_) => Err(format!("batch timed out after {limit:?}").into()),
            },
            None => job_class.perform(batch).await,
        }
    }

    async fn record_success(
        &self,
        migration: &BatchedMigration,
        job: BatchedJob,
        claim: JobClaim,
        duration: Duration,
        finished_at: DateTime<Utc>,
        mode: StepMode,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        if !self
            .store
            .complete_job(job.id, claim.execution_id, finished_at)
            .await
            .map_err(RunnerError::Store)?
        {
            warn!(
                "Batch {}..={} of batched migration {} finished after its claim was lost",
                job.min_value, job.max_value, migration.id
            );
            return Ok(StepOutcome::ClaimLost);
        }

        info!(
            "Batch {}..={} of batched migration {} succeeded in {:?}",
            job.min_value, job.max_value, migration.id, duration
        );

        if let Some(batch_size) = BatchOptimizer::new(&self.config.optimizer).optimize(migration, duration) {
            info!(
                "Batch size of batched migration {} changed from {} to {}",
                migration.id, migration.batch_size, batch_size
            );
            self.store
                .update_batch_size(migration.id, batch_size, finished_at)
                .await
                .map_err(RunnerError::Store)?;
        }

        let job = BatchedJob {
            status: JobStatus::Succeeded,
            execution_id: Some(claim.execution_id),
            started_at: Some(claim.started_at),
            finished_at: Some(finished_at),
            lease_expires_at: Some(claim.lease_expires_at),
            ..job
        };
        if job.max_value >= migration.max_value {
            self.finish_migration(migration, mode, finished_at).await?;
        }
        Ok(StepOutcome::BatchSucceeded(job))
    }

    async fn record_failure(
        &self,
        migration: &BatchedMigration,
        job: BatchedJob,
        claim: JobClaim,
        failure: JobFailure,
        mode: StepMode,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        let Some(failed) = self
            .store
            .fail_job(job.id, claim.execution_id, &failure)
            .await
            .map_err(RunnerError::Store)?
        else {
            warn!(
                "Batch {}..={} of batched migration {} failed after its claim was lost: {}",
                job.min_value, job.max_value, migration.id, failure.error
            );
            return Ok(StepOutcome::ClaimLost);
        };

        warn!(
            "Batch {}..={} of batched migration {} failed (attempt {}/{}): {}",
            failed.min_value,
            failed.max_value,
            migration.id,
            failed.attempts,
            self.config.retry_limit,
            failure.error
        );

        if !failed.is_retriable(self.config.retry_limit) {
            let reason = format!(
                "batch {}..={} failed {} times: {}",
                failed.min_value, failed.max_value, failed.attempts, failure.error
            );
            return self
                .fail_migration(migration, mode, failure.finished_at, reason)
                .await;
        }

        if let Some(limit) = self.config.max_failed_attempts {
            let total: i64 = self
                .store
                .list_jobs(migration.id)
                .await
                .map_err(RunnerError::Store)?
                .iter()
                .map(|job| i64::from(job.attempts))
                .sum();
            if total >= i64::from(limit) {
                let reason = format!("{total} failed attempts across batches");
                return self
                    .fail_migration(migration, mode, failure.finished_at, reason)
                    .await;
            }
        }

        Ok(StepOutcome::BatchFailed {
            job: failed,
            will_retry: true,
        })
    }

    /// Moves the migration from the status its step expects to `to`, if that is a legal
    /// transition.
    async fn transition_from_step(
        &self,
        migration: &BatchedMigration,
        mode: StepMode,
        to: MigrationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RunnerError<S::Error>> {
        let from = mode.expected_status();
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        self.store
            .transition_migration(migration.id, &[from], to, now)
            .await
            .map_err(RunnerError::Store)
    }

    /// Marks a scheduled migration finished. A finalizer seals the migration itself.
    async fn finish_migration(
        &self,
        migration: &BatchedMigration,
        mode: StepMode,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        if mode == StepMode::Scheduled
            && self
                .transition_from_step(migration, mode, MigrationStatus::Finished, now)
                .await?
        {
            info!(
                "Batched migration {} ({}) finished",
                migration.id,
                migration.key()
            );
        }
        Ok(StepOutcome::MigrationFinished)
    }

    async fn fail_migration(
        &self,
        migration: &BatchedMigration,
        mode: StepMode,
        now: DateTime<Utc>,
        reason: String,
    ) -> Result<StepOutcome, RunnerError<S::Error>> {
        let applied = self
            .transition_from_step(migration, mode, MigrationStatus::Failed, now)
            .await?;

        if applied {
            error!(
                "Batched migration {} ({}) failed: {}",
                migration.id,
                migration.key(),
                reason
            );
            if let Some(callback) = &self.config.on_migration_failed {
                callback
                    .on_migration_failed(MigrationFailureInfo {
                        migration_id: migration.id,
                        job_class_name: migration.job_class_name.clone(),
                        table_name: migration.table_name.clone(),
                        reason: reason.clone(),
                    })
                    .await;
            }
        }
        Ok(StepOutcome::MigrationFailed { reason })
    }
}

fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|duration| at.checked_add_signed(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
