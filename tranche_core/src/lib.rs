//! # Tranche
//!
//! Batched background migrations: a long backfill is registered once, then processed as a
//! sequence of bounded windows over an ordered column, one window per runner step, with
//! durable progress, retries, and synchronous finalization.

#![deny(missing_docs)]

pub mod arguments;
pub mod boundary;
pub mod config;
pub mod finalizer;
pub mod helpers;
pub mod introspection;
pub mod job;
pub mod job_class_name;
pub mod migration;
pub mod optimizer;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use arguments::{JobArguments, JobArgumentsError};
pub use job_class_name::JobClassName;

#[doc(hidden)]
pub use serde_json;

pub mod prelude {
    //! The prelude module for the `tranche_core` crate.
    pub use super::arguments::{JobArguments, JobArgumentsError};
    pub use super::boundary::{BatchBoundaryCalculator, BatchWindow};
    pub use super::config::{BatchOptimizerConfig, FailureCallback, MigrationFailureInfo, RunnerConfig, SchedulerConfig};
    pub use super::finalizer::{FinalizeError, Finalizer};
    pub use super::helpers::MigrationHelpers;
    pub use super::introspection::{IntrospectionError, TableIntrospector};
    pub use super::job::{BatchedJob, JobStatus};
    pub use super::job_class_name::JobClassName;
    pub use super::migration::{BatchedMigration, MigrationConfiguration, MigrationKey, MigrationStatus};
    pub use super::registry::{BatchContext, BatchJob, BoxError, JobRegistry};
    pub use super::runner::{BatchedMigrationRunner, RunnerError, StepOutcome};
    pub use super::scheduler::{
        MigrationProgress, QueueError, QueueOptions, QueueOutcome, Scheduler, SchedulerError,
    };
    pub use super::store::MigrationStore;
}
