//! Batched job records: one row per batch window claimed by a runner.

use crate::boundary::BatchWindow;
use crate::migration::UnknownStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet claimed.
    Pending,
    /// Claimed by a runner holding the job's execution id.
    Running,
    /// The last attempt failed. Retriable while `attempts` is under the retry limit.
    Failed,
    /// The window has been processed.
    Succeeded,
}

impl JobStatus {
    /// All statuses, in code order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Failed,
        JobStatus::Succeeded,
    ];

    /// The snake_case name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<JobStatus> for i16 {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Failed => 2,
            JobStatus::Succeeded => 3,
        }
    }
}

impl TryFrom<i16> for JobStatus {
    type Error = UnknownStatus;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Running),
            2 => Ok(JobStatus::Failed),
            3 => Ok(JobStatus::Succeeded),
            code => Err(UnknownStatus { kind: "job", code }),
        }
    }
}

/// One batch window of a migration and the record of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedJob {
    /// Store-assigned identifier.
    pub id: i64,
    /// The owning migration.
    pub batched_migration_id: i64,
    /// Inclusive lower bound of the window.
    pub min_value: i64,
    /// Inclusive upper bound of the window.
    pub max_value: i64,
    /// The migration's batch size when the window was computed.
    pub batch_size: i64,
    /// Inner chunk width used by the job.
    pub sub_batch_size: i64,
    /// Current state.
    pub status: JobStatus,
    /// Number of failed attempts so far.
    pub attempts: i32,
    /// Token of the runner currently holding the job.
    pub execution_id: Option<Uuid>,
    /// When the window was created.
    pub created_at: DateTime<Utc>,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the latest attempt ended.
    pub finished_at: Option<DateTime<Utc>>,
    /// A running job whose lease passes this instant is considered abandoned.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest instant a failed job may be retried.
    pub retry_at: Option<DateTime<Utc>>,
    /// Error message of the latest failed attempt.
    pub last_error: Option<String>,
}

impl BatchedJob {
    /// The window this job covers.
    pub fn window(&self) -> BatchWindow {
        BatchWindow::new(self.min_value, self.max_value)
    }

    /// Whether another attempt is allowed under `retry_limit`.
    pub fn is_retriable(&self, retry_limit: u32) -> bool {
        self.status == JobStatus::Failed && (self.attempts.max(0) as u32) < retry_limit
    }

    /// Whether a running job has outlived its lease at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.lease_expires_at.is_some_and(|expires| expires <= now)
    }
}

/// The fields needed to create a job for a new window.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatchedJob {
    /// The owning migration.
    pub batched_migration_id: i64,
    /// The window to cover.
    pub window: BatchWindow,
    /// The migration's batch size when the window was computed.
    pub batch_size: i64,
    /// Inner chunk width.
    pub sub_batch_size: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl NewBatchedJob {
    /// Materializes a pending job with a store-assigned id.
    pub fn into_job(self, id: i64) -> BatchedJob {
        BatchedJob {
            id,
            batched_migration_id: self.batched_migration_id,
            min_value: self.window.min_value,
            max_value: self.window.max_value,
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            status: JobStatus::Pending,
            attempts: 0,
            execution_id: None,
            created_at: self.created_at,
            started_at: None,
            finished_at: None,
            lease_expires_at: None,
            retry_at: None,
            last_error: None,
        }
    }
}

/// Ownership of a job taken by a runner for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobClaim {
    /// Token that every subsequent transition of the attempt must present.
    pub execution_id: Uuid,
    /// When the attempt starts.
    pub started_at: DateTime<Utc>,
    /// When the claim is considered abandoned.
    pub lease_expires_at: DateTime<Utc>,
}

impl JobClaim {
    /// A fresh claim starting at `now` and leased for `lease`.
    pub fn new(now: DateTime<Utc>, lease: std::time::Duration) -> Self {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        Self {
            execution_id: Uuid::new_v4(),
            started_at: now,
            lease_expires_at: now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Outcome of a failed attempt, recorded against the claim that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// The error message.
    pub error: String,
    /// When the attempt ended.
    pub finished_at: DateTime<Utc>,
    /// Earliest instant the job may be retried.
    pub retry_at: DateTime<Utc>,
}
