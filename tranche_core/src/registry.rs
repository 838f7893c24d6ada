//! Batch jobs and the registry resolving them by job class name.

use crate::arguments::{JobArguments, JobArgumentsError};
use crate::boundary::{BatchWindow, SubBatches};
use crate::job_class_name::JobClassName;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Error type returned by batch jobs.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything a job needs to process one batch window.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchContext {
    /// The migration the batch belongs to.
    pub migration_id: i64,
    /// The batched job being executed.
    pub job_id: i64,
    /// The database the table lives in.
    pub schema_name: String,
    /// The table being iterated.
    pub table_name: String,
    /// The column the window ranges over.
    pub column_name: String,
    /// The inclusive range to process.
    pub window: BatchWindow,
    /// The batch size the window was computed with.
    pub batch_size: i64,
    /// Width of each chunk the job should process at a time.
    pub sub_batch_size: i64,
    /// The migration's job arguments.
    pub job_arguments: Vec<Value>,
    /// One-based number of this attempt.
    pub attempt: i32,
}

impl BatchContext {
    /// Inclusive lower bound of the window.
    pub fn min_value(&self) -> i64 {
        self.window.min_value
    }

    /// Inclusive upper bound of the window.
    pub fn max_value(&self) -> i64 {
        self.window.max_value
    }

    /// The window split into chunks of `sub_batch_size`.
    pub fn sub_batches(&self) -> SubBatches {
        self.window.sub_batches(self.sub_batch_size)
    }

    /// Decodes the job arguments into `T`.
    pub fn arguments<T: JobArguments>(&self) -> Result<T, JobArgumentsError> {
        T::from_job_arguments(&self.job_arguments)
    }
}

/// Processes one batch window of a migration.
///
/// Jobs must be idempotent: a window can be executed more than once when a runner loses its
/// lease or a previous attempt failed part way through.
#[async_trait]
pub trait BatchJob: JobClassName + Send + Sync {
    /// Processes every row of `batch.table_name` whose `batch.column_name` falls within the
    /// window.
    async fn perform(&self, batch: &BatchContext) -> Result<(), BoxError>;
}

/// Maps job class names to the jobs that implement them.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn BatchJob>>,
}

impl JobRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `job` and returns the registry, for chaining.
    pub fn with_job<J: BatchJob + 'static>(mut self, job: J) -> Self {
        self.register(job);
        self
    }

    /// Registers `job` under its class name, returning the job it replaced.
    pub fn register<J: BatchJob + 'static>(&mut self, job: J) -> Option<Arc<dyn BatchJob>> {
        let name = crate::migration::normalize_job_class_name(job.job_class_name());
        self.jobs.insert(name, Arc::new(job))
    }

    /// The job registered under `job_class_name`.
    pub fn get(&self, job_class_name: &str) -> Option<Arc<dyn BatchJob>> {
        self.jobs.get(job_class_name).cloned()
    }

    /// Whether a job is registered under `job_class_name`.
    pub fn contains(&self, job_class_name: &str) -> bool {
        self.jobs.contains_key(job_class_name)
    }

    /// Registered names, sorted.
    pub fn job_class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.job_class_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NamedJob(&'static str);

    impl JobClassName for NamedJob {
        fn job_class_name(&self) -> &str {
            self.0
        }
    }

    #[async_trait]
    impl BatchJob for NamedJob {
        async fn perform(&self, _batch: &BatchContext) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn registered_jobs_resolve_by_name() {
        let registry = JobRegistry::new()
            .with_job(NamedJob("FooJob"))
            .with_job(NamedJob("::BarJob"));
        assert!(registry.contains("FooJob"));
        assert!(registry.contains("BarJob"));
        assert!(registry.get("BazJob").is_none());
        assert_eq!(registry.job_class_names(), vec!["BarJob", "FooJob"]);
    }

    #[test]
    fn registering_twice_replaces() {
        let mut registry = JobRegistry::new();
        assert!(registry.register(NamedJob("FooJob")).is_none());
        assert!(registry.register(NamedJob("FooJob")).is_some());
        assert_eq!(registry.job_class_names().len(), 1);
    }

    #[test]
    fn debug_lists_names() {
        let registry = JobRegistry::new().with_job(NamedJob("FooJob"));
        assert_eq!(format!("{registry:?}"), "JobRegistry { jobs: [\"FooJob\"] }");
    }

    #[test]
    fn context_exposes_window_and_arguments() {
        let batch = BatchContext {
            migration_id: 1,
            job_id: 2,
            schema_name: "main".to_string(),
            table_name: "users".to_string(),
            column_name: "id".to_string(),
            window: BatchWindow::new(11, 20),
            batch_size: 10,
            sub_batch_size: 4,
            job_arguments: vec![json!("a")],
            attempt: 1,
        };
        assert_eq!(batch.min_value(), 11);
        assert_eq!(batch.max_value(), 20);
        assert_eq!(batch.sub_batches().count(), 3);
        assert_eq!(batch.arguments::<Vec<Value>>().unwrap(), vec![json!("a")]);
    }
}
