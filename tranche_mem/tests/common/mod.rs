#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tranche_core::prelude::*;
use tranche_derive::JobClassName;
use tranche_mem::{InMemoryCopyColumnJob, InMemoryDatabase, InMemoryMigrationStore, Row};

pub const COPY_JOB: &str = "CopyColumnUsingBackgroundMigrationJob";

/// Records every window it is asked to process.
#[derive(Clone, Default, JobClassName)]
pub struct RecordingJob {
    pub windows: Arc<Mutex<Vec<(i64, i64)>>>,
}

impl RecordingJob {
    pub async fn windows(&self) -> Vec<(i64, i64)> {
        self.windows.lock().await.clone()
    }
}

#[async_trait]
impl BatchJob for RecordingJob {
    async fn perform(&self, batch: &BatchContext) -> Result<(), BoxError> {
        self.windows
            .lock()
            .await
            .push((batch.min_value(), batch.max_value()));
        Ok(())
    }
}

/// Fails its first `failures` invocations, then succeeds.
#[derive(Clone, JobClassName)]
pub struct FlakyJob {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
}

impl FlakyJob {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchJob for FlakyJob {
    async fn perform(&self, batch: &BatchContext) -> Result<(), BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(format!("deadlock detected on {}..={}", batch.min_value(), batch.max_value()).into());
        }
        Ok(())
    }
}

/// Takes `delay` to process each window, recording the window once done.
#[derive(Clone, JobClassName)]
pub struct SlowJob {
    pub delay: Duration,
    pub windows: Arc<Mutex<Vec<(i64, i64)>>>,
}

impl SlowJob {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            windows: Arc::default(),
        }
    }

    pub async fn windows(&self) -> Vec<(i64, i64)> {
        self.windows.lock().await.clone()
    }
}

#[async_trait]
impl BatchJob for SlowJob {
    async fn perform(&self, batch: &BatchContext) -> Result<(), BoxError> {
        tokio::time::sleep(self.delay).await;
        self.windows
            .lock()
            .await
            .push((batch.min_value(), batch.max_value()));
        Ok(())
    }
}

/// Collects the migrations reported as failed.
#[derive(Clone, Default)]
pub struct FailureRecorder {
    pub failures: Arc<Mutex<Vec<MigrationFailureInfo>>>,
}

#[async_trait]
impl FailureCallback for FailureRecorder {
    async fn on_migration_failed(&self, info: MigrationFailureInfo) {
        self.failures.lock().await.push(info);
    }
}

pub struct Harness {
    pub store: InMemoryMigrationStore,
    pub database: InMemoryDatabase,
    pub helpers: MigrationHelpers<InMemoryMigrationStore, InMemoryDatabase>,
    pub recording: RecordingJob,
    pub flaky: FlakyJob,
    pub slow: SlowJob,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RunnerConfig::default(), FlakyJob::failing(0))
    }

    pub fn with_config(config: RunnerConfig, flaky: FlakyJob) -> Self {
        Self::with_jobs(config, flaky, SlowJob::new(Duration::ZERO))
    }

    pub fn with_jobs(config: RunnerConfig, flaky: FlakyJob, slow: SlowJob) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = InMemoryMigrationStore::new();
        let database = InMemoryDatabase::new();
        let recording = RecordingJob::default();
        let registry = JobRegistry::new()
            .with_job(recording.clone())
            .with_job(flaky.clone())
            .with_job(slow.clone())
            .with_job(InMemoryCopyColumnJob::new(database.clone()));
        let helpers = MigrationHelpers::new(
            store.clone(),
            database.clone(),
            Arc::new(registry),
            SchedulerConfig::default(),
            RunnerConfig {
                finalize_poll_interval: Duration::from_millis(5),
                ..config
            },
        );
        Self {
            store,
            database,
            helpers,
            recording,
            flaky,
            slow,
        }
    }

    pub fn scheduler(&self) -> &Scheduler<InMemoryMigrationStore, InMemoryDatabase> {
        self.helpers.scheduler()
    }

    pub fn runner(&self) -> &BatchedMigrationRunner<InMemoryMigrationStore, InMemoryDatabase> {
        self.helpers.finalizer().runner()
    }

    /// Another worker over the same store, tables and jobs, inspecting tables through
    /// `introspector`.
    pub fn worker<I: TableIntrospector>(
        &self,
        introspector: I,
    ) -> BatchedMigrationRunner<InMemoryMigrationStore, I> {
        let registry = JobRegistry::new()
            .with_job(self.recording.clone())
            .with_job(self.flaky.clone())
            .with_job(self.slow.clone())
            .with_job(InMemoryCopyColumnJob::new(self.database.clone()));
        BatchedMigrationRunner::new(
            self.store.clone(),
            introspector,
            Arc::new(registry),
            self.runner().config().clone(),
        )
    }

    /// Creates `users` with the given ids and an empty `id_copy` column.
    pub async fn seed_users(&self, ids: impl IntoIterator<Item = i64>) {
        self.database
            .create_table("users", &["id", "name", "id_copy"])
            .await;
        for id in ids {
            let row = Row::from([
                ("id".to_string(), json!(id)),
                ("name".to_string(), json!(format!("user {id}"))),
            ]);
            self.database
                .insert("users", row)
                .await
                .expect("users table exists");
        }
    }

    pub async fn queue(&self, job_class_name: &str, options: QueueOptions) -> BatchedMigration {
        self.scheduler()
            .queue(
                MigrationConfiguration::new(job_class_name, "users", "id", vec![]),
                options,
            )
            .await
            .expect("should queue")
            .migration()
            .clone()
    }

    pub async fn migration(&self, id: i64) -> BatchedMigration {
        self.store
            .get_migration(id)
            .await
            .unwrap()
            .expect("migration exists")
    }

    pub async fn windows(&self, id: i64) -> Vec<(i64, i64)> {
        self.store
            .list_jobs(id)
            .await
            .unwrap()
            .iter()
            .map(|job| (job.min_value, job.max_value))
            .collect()
    }

    /// Steps the migration until it leaves `active`, advancing the clock past every
    /// interval and retry delay.
    pub async fn run_to_completion(&self, id: i64, start: DateTime<Utc>) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        let mut now = start;
        for _ in 0..1_000 {
            let outcome = self
                .runner()
                .run_migration_job_at(id, now)
                .await
                .expect("step should not error");
            if let StepOutcome::NotActive(_) = outcome {
                return outcomes;
            }
            outcomes.push(outcome);
            now += ChronoDuration::hours(2);
        }
        panic!("migration {id} did not settle");
    }
}

pub fn options(batch_size: i64) -> QueueOptions {
    QueueOptions {
        batch_size,
        sub_batch_size: batch_size,
        ..QueueOptions::default()
    }
}
