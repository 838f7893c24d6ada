//! Configuration for queueing, running and finalizing batched migrations.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default width of a batch window.
pub const DEFAULT_BATCH_SIZE: i64 = 1_000;

/// Default width of the chunks a batch is split into.
pub const DEFAULT_SUB_BATCH_SIZE: i64 = 100;

/// Smallest interval a migration may be queued with.
pub const MINIMUM_INTERVAL: Duration = Duration::from_secs(120);

/// Information about a migration marked failed, passed to the [`FailureCallback`].
#[derive(Debug, Clone)]
pub struct MigrationFailureInfo {
    /// The failed migration.
    pub migration_id: i64,
    /// Its job class.
    pub job_class_name: String,
    /// Its table.
    pub table_name: String,
    /// Why it failed.
    pub reason: String,
}

/// Callback invoked after a migration has been marked failed.
///
/// Implementations should be lightweight. The status change is already persisted when the
/// callback runs and is not affected by it.
#[async_trait]
pub trait FailureCallback: Send + Sync {
    /// Called once per failure transition.
    async fn on_migration_failed(&self, info: MigrationFailureInfo);
}

/// Adaptive batch sizing.
///
/// After each successful batch of a migration queued with a `max_batch_size`, the batch
/// duration is compared to the migration interval. Fast batches grow the next window, slow
/// ones shrink it.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptimizerConfig {
    /// Grow when `duration / interval` is at or below this ratio.
    pub growth_threshold: f64,
    /// Shrink when `duration / interval` exceeds this ratio.
    pub shrink_threshold: f64,
    /// Multiplier applied when growing.
    pub growth_factor: f64,
    /// Multiplier applied when shrinking.
    pub shrink_factor: f64,
}

impl Default for BatchOptimizerConfig {
    fn default() -> Self {
        Self {
            growth_threshold: 0.5,
            shrink_threshold: 0.95,
            growth_factor: 2.0,
            shrink_factor: 0.5,
        }
    }
}

/// Configuration for [`BatchedMigrationRunner`](crate::runner::BatchedMigrationRunner).
#[derive(Clone)]
pub struct RunnerConfig {
    /// Failed attempts after which a batch, and its migration, is marked failed.
    pub retry_limit: u32,

    /// Upper bound of the backoff applied before a failed batch is retried.
    ///
    /// The backoff is `interval * attempts`, capped at this value.
    pub max_retry_delay: Duration,

    /// Spread retries by ±10% to avoid runners waking in lockstep.
    pub retry_jitter: bool,

    /// How long a claim is honoured before the job is considered abandoned.
    ///
    /// Any runner stepping the migration after the lease expires records a failed attempt
    /// on the job and retries it.
    pub job_lease: Duration,

    /// How often a runner extends the lease of the batch it is executing.
    ///
    /// Must be shorter than `job_lease`. A runner that finds its lease taken over stops the
    /// batch.
    pub job_lease_renewal: Duration,

    /// Abort a batch that runs longer than this. `None` waits indefinitely.
    pub job_timeout: Option<Duration>,

    /// Fail the migration once the sum of failed attempts across its jobs reaches this.
    pub max_failed_attempts: Option<u32>,

    /// Empty windows recorded without executing the job before a step yields.
    pub max_empty_windows_per_step: u32,

    /// Migrations stepped concurrently by `run_due_migrations`.
    pub max_concurrent_migrations: usize,

    /// Adaptive batch sizing policy.
    pub optimizer: BatchOptimizerConfig,

    /// How long a finalizer sleeps while another runner holds the current batch.
    pub finalize_poll_interval: Duration,

    /// How long a finalizer waits on a held batch before giving up.
    pub finalize_max_wait: Duration,

    /// Invoked after a migration is marked failed.
    ///
    /// Default: `None`
    pub on_migration_failed: Option<Arc<dyn FailureCallback>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            max_retry_delay: Duration::from_secs(3600),
            retry_jitter: false,
            job_lease: Duration::from_secs(3600),
            job_lease_renewal: Duration::from_secs(600),
            job_timeout: None,
            max_failed_attempts: None,
            max_empty_windows_per_step: 100,
            max_concurrent_migrations: 4,
            optimizer: BatchOptimizerConfig::default(),
            finalize_poll_interval: Duration::from_secs(1),
            finalize_max_wait: Duration::from_secs(3600),
            on_migration_failed: None,
        }
    }
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("retry_limit", &self.retry_limit)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("retry_jitter", &self.retry_jitter)
            .field("job_lease", &self.job_lease)
            .field("job_lease_renewal", &self.job_lease_renewal)
            .field("job_timeout", &self.job_timeout)
            .field("max_failed_attempts", &self.max_failed_attempts)
            .field("max_empty_windows_per_step", &self.max_empty_windows_per_step)
            .field("max_concurrent_migrations", &self.max_concurrent_migrations)
            .field("optimizer", &self.optimizer)
            .field("finalize_poll_interval", &self.finalize_poll_interval)
            .field("finalize_max_wait", &self.finalize_max_wait)
            .field(
                "on_migration_failed",
                &self.on_migration_failed.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// Configuration for [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Intervals below this are raised to it at queue time.
    pub minimum_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            minimum_interval: MINIMUM_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.job_lease, Duration::from_secs(3600));
        assert!(config.job_lease_renewal < config.job_lease);
        assert!(config.job_timeout.is_none());
        assert!(config.max_failed_attempts.is_none());
        assert!(!config.retry_jitter);
        assert!(config.on_migration_failed.is_none());
    }

    #[test]
    fn optimizer_defaults() {
        let config = BatchOptimizerConfig::default();
        assert_eq!(config.growth_threshold, 0.5);
        assert_eq!(config.shrink_threshold, 0.95);
    }

    #[test]
    fn scheduler_defaults_to_two_minute_floor() {
        let config = SchedulerConfig::default();
        assert_eq!(config.minimum_interval, Duration::from_secs(120));
    }

    #[test]
    fn debug_hides_callback() {
        struct Noop;

        #[async_trait]
        impl FailureCallback for Noop {
            async fn on_migration_failed(&self, _info: MigrationFailureInfo) {}
        }

        let config = RunnerConfig {
            on_migration_failed: Some(Arc::new(Noop)),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("on_migration_failed: Some(\"<callback>\")"));
        assert!(debug.contains("retry_limit: 3"));
    }
}
