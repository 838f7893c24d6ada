//! The surface schema migrations use to manage batched migrations.
//!
//! ```ignore
//! // up
//! helpers
//!     .queue_batched_background_migration(
//!         "CopyColumnUsingBackgroundMigrationJob",
//!         "events",
//!         "id",
//!         vec![json!(["id"]), json!(["id_convert_to_bigint"])],
//!         QueueOptions::default(),
//!     )
//!     .await?;
//!
//! // down
//! helpers
//!     .delete_batched_background_migration(
//!         "CopyColumnUsingBackgroundMigrationJob",
//!         "events",
//!         "id",
//!         vec![json!(["id"]), json!(["id_convert_to_bigint"])],
//!     )
//!     .await?;
//! ```

use crate::config::{RunnerConfig, SchedulerConfig};
use crate::finalizer::{FinalizeError, Finalizer};
use crate::introspection::TableIntrospector;
use crate::migration::{BatchedMigration, MigrationConfiguration};
use crate::registry::JobRegistry;
use crate::runner::BatchedMigrationRunner;
use crate::scheduler::{QueueError, QueueOptions, QueueOutcome, Scheduler};
use crate::store::MigrationStore;
use serde_json::Value;
use std::sync::Arc;

/// Queue, delete and finalize batched migrations from schema migrations.
pub struct MigrationHelpers<S, I> {
    scheduler: Scheduler<S, I>,
    finalizer: Finalizer<S, I>,
}

impl<S, I> MigrationHelpers<S, I>
where
    S: MigrationStore + Clone,
    I: TableIntrospector + Clone,
{
    /// Builds the scheduler and finalizer over shared handles of `store` and `introspector`.
    pub fn new(
        store: S,
        introspector: I,
        registry: Arc<JobRegistry>,
        scheduler_config: SchedulerConfig,
        runner_config: RunnerConfig,
    ) -> Self {
        let runner = BatchedMigrationRunner::new(
            store.clone(),
            introspector.clone(),
            registry.clone(),
            runner_config,
        );
        Self {
            scheduler: Scheduler::new(store, introspector, registry, scheduler_config),
            finalizer: Finalizer::new(runner),
        }
    }
}

impl<S, I> MigrationHelpers<S, I>
where
    S: MigrationStore,
    I: TableIntrospector,
{
    /// The scheduler, for operator controls.
    pub fn scheduler(&self) -> &Scheduler<S, I> {
        &self.scheduler
    }

    /// The finalizer.
    pub fn finalizer(&self) -> &Finalizer<S, I> {
        &self.finalizer
    }

    /// Registers a batched migration. A no-op when it is already registered.
    pub async fn queue_batched_background_migration(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
        options: QueueOptions,
    ) -> Result<QueueOutcome, QueueError<S::Error>> {
        self.scheduler
            .queue(
                MigrationConfiguration::new(job_class_name, table_name, column_name, job_arguments),
                options,
            )
            .await
    }

    /// Deletes a batched migration and its jobs. Returns `false` when there was none.
    pub async fn delete_batched_background_migration(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
    ) -> Result<bool, S::Error> {
        self.scheduler
            .dequeue(&MigrationConfiguration::new(
                job_class_name,
                table_name,
                column_name,
                job_arguments,
            ))
            .await
    }

    /// Fails unless the batched migration is, or can be driven to, `finalized`.
    ///
    /// Remaining batches run inline.
    pub async fn ensure_batched_background_migration_is_finished(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
    ) -> Result<BatchedMigration, FinalizeError<S::Error>> {
        self.finalizer
            .ensure_finished(&MigrationConfiguration::new(
                job_class_name,
                table_name,
                column_name,
                job_arguments,
            ))
            .await
    }

    /// Drains the batched migration and marks it `finalized`.
    pub async fn finalize_batched_background_migration(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
    ) -> Result<BatchedMigration, FinalizeError<S::Error>> {
        self.ensure_batched_background_migration_is_finished(
            job_class_name,
            table_name,
            column_name,
            job_arguments,
        )
        .await
    }
}
