//! Synchronous draining of a batched migration.
//!
//! A later schema migration that depends on a backfill calls the finalizer to guarantee the
//! backfill completed. The finalizer takes the migration to `finalizing`, runs every
//! remaining batch inline without interval throttling or retry backoff, and marks it
//! `finalized`. If a batch exhausts its retries the migration fails and so does the call.

use crate::introspection::TableIntrospector;
use crate::migration::{BatchedMigration, MigrationConfiguration, MigrationStatus};
use crate::runner::{BatchedMigrationRunner, RunnerError, StepOutcome};
use crate::store::MigrationStore;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::time::Duration;

/// Errors that abort finalization.
#[derive(Debug, thiserror::Error)]
pub enum FinalizeError<E>
where
    E: std::error::Error + 'static,
{
    /// No migration matches the configuration.
    #[error("could not find batched background migration for the given configuration: {0}")]
    NotFound(String),
    /// A batch exhausted its retries while draining.
    #[error("batched migration {id} failed during finalization: {reason}")]
    Failed {
        /// The migration.
        id: i64,
        /// Why it failed.
        reason: String,
    },
    /// Another worker held a batch for longer than `finalize_max_wait`.
    #[error("batched migration {id} timed out waiting for job {job_id}")]
    Timeout {
        /// The migration.
        id: i64,
        /// The held job.
        job_id: i64,
    },
    /// The migration moved to a state finalization cannot continue from.
    #[error("batched migration {id} cannot be finalized from {status}")]
    InvalidState {
        /// The migration.
        id: i64,
        /// Its status.
        status: MigrationStatus,
    },
    /// A runner step failed.
    #[error(transparent)]
    Runner(#[from] RunnerError<E>),
}

/// Drains batched migrations synchronously.
pub struct Finalizer<S, I> {
    runner: BatchedMigrationRunner<S, I>,
}

impl<S, I> Finalizer<S, I>
where
    S: MigrationStore,
    I: TableIntrospector,
{
    /// Creates a finalizer executing batches through `runner`.
    pub fn new(runner: BatchedMigrationRunner<S, I>) -> Self {
        Self { runner }
    }

    /// The runner executing the batches.
    pub fn runner(&self) -> &BatchedMigrationRunner<S, I> {
        &self.runner
    }

    /// Runs every remaining batch and marks the migration `finalized`.
    ///
    /// A migration that is already `finalized` is returned unchanged.
    pub async fn ensure_finished(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<BatchedMigration, FinalizeError<S::Error>> {
        self.ensure_finished_at(configuration, Utc::now()).await
    }

    /// [`ensure_finished`](Self::ensure_finished) starting at `now`.
    ///
    /// The clock advances by the time spent waiting on batches held by other workers.
    pub async fn ensure_finished_at(
        &self,
        configuration: &MigrationConfiguration,
        now: DateTime<Utc>,
    ) -> Result<BatchedMigration, FinalizeError<S::Error>> {
        let store = self.runner.store();
        let migration = store
            .find_migration(&configuration.key())
            .await
            .map_err(RunnerError::Store)?
            .filter(|migration| configuration.matches(migration))
            .ok_or_else(|| FinalizeError::NotFound(configuration.to_string()))?;

        match migration.status {
            status if status.is_terminal() => {
                debug!("Batched migration {} is already finalized", migration.id);
                return Ok(migration);
            }
            MigrationStatus::Finalizing => {
                debug!("Batched migration {} is already finalizing", migration.id);
            }
            status => {
                if status == MigrationStatus::Failed {
                    let reset = store
                        .reset_failed_jobs(migration.id)
                        .await
                        .map_err(RunnerError::Store)?;
                    debug!(
                        "Reset {} failed batches of batched migration {}",
                        reset, migration.id
                    );
                }
                let applied = store
                    .transition_migration(
                        migration.id,
                        &MigrationStatus::sources_of(MigrationStatus::Finalizing),
                        MigrationStatus::Finalizing,
                        now,
                    )
                    .await
                    .map_err(RunnerError::Store)?;
                if applied {
                    info!(
                        "Finalizing batched migration {} ({}) from {}",
                        migration.id,
                        migration.key(),
                        status
                    );
                }
            }
        }

        let mut waited = Duration::ZERO;
        loop {
            let current = now
                .checked_add_signed(
                    chrono::Duration::from_std(waited).unwrap_or(chrono::Duration::zero()),
                )
                .unwrap_or(now);
            match self.runner.run_finalizing_step(migration.id, current).await? {
                StepOutcome::MigrationFinished => break,
                StepOutcome::MigrationFailed { reason } => {
                    return Err(FinalizeError::Failed {
                        id: migration.id,
                        reason,
                    });
                }
                StepOutcome::NotActive(MigrationStatus::Finalized) => {
                    return self.reload(migration.id).await;
                }
                StepOutcome::NotActive(status) => {
                    return Err(FinalizeError::InvalidState {
                        id: migration.id,
                        status,
                    });
                }
                StepOutcome::BatchInFlight { job_id } => {
                    if waited >= self.runner.config().finalize_max_wait {
                        return Err(FinalizeError::Timeout {
                            id: migration.id,
                            job_id,
                        });
                    }
                    let poll = self.runner.config().finalize_poll_interval;
                    tokio::time::sleep(poll).await;
                    waited += poll;
                }
                StepOutcome::BatchSucceeded(_)
                | StepOutcome::BatchFailed { .. }
                | StepOutcome::EmptyWindowsSkipped { .. }
                | StepOutcome::ClaimLost
                | StepOutcome::Throttled { .. }
                | StepOutcome::BackingOff { .. } => {}
            }
        }

        let finalized = store
            .transition_migration(
                migration.id,
                &[MigrationStatus::Finalizing],
                MigrationStatus::Finalized,
                now,
            )
            .await
            .map_err(RunnerError::Store)?;
        if finalized {
            info!(
                "Finalized batched migration {} ({})",
                migration.id,
                migration.key()
            );
        }
        self.reload(migration.id).await
    }

    async fn reload(&self, id: i64) -> Result<BatchedMigration, FinalizeError<S::Error>> {
        Ok(self
            .runner
            .store()
            .get_migration(id)
            .await
            .map_err(RunnerError::Store)?
            .ok_or(RunnerError::<S::Error>::MigrationNotFound(id))?)
    }
}
