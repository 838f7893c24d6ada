//! Batched migration records and the migration status state machine.
//!
//! A [`BatchedMigration`] is the durable description of one backfill: which job class runs,
//! over which table and column, in which range, and how large each batch is. Its
//! [`MigrationStatus`] decides whether new batches may be scheduled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Raised when a persisted status code does not map to a known state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status code {code}")]
pub struct UnknownStatus {
    /// Which state machine the code belongs to (`migration` or `job`).
    pub kind: &'static str,
    /// The offending code.
    pub code: i16,
}

/// Lifecycle of a batched migration.
///
/// ```text
/// paused <-> active --> finished --+
///              |                   |
///              +----> failed ------+--> finalizing --> finalized
/// ```
///
/// Only `Active` permits new batches to be scheduled. `Finalized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Registered but not scheduling batches until resumed.
    Paused,
    /// Batches are scheduled by the runner.
    Active,
    /// Every batch window has been processed.
    Finished,
    /// A batch exhausted its retries or the boundary computation failed.
    Failed,
    /// A finalizer is draining the remaining batches synchronously.
    Finalizing,
    /// Drained by a finalizer. Terminal.
    Finalized,
}

impl MigrationStatus {
    /// All statuses, in code order.
    pub const ALL: [MigrationStatus; 6] = [
        MigrationStatus::Paused,
        MigrationStatus::Active,
        MigrationStatus::Finished,
        MigrationStatus::Failed,
        MigrationStatus::Finalizing,
        MigrationStatus::Finalized,
    ];

    /// The snake_case name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Paused => "paused",
            MigrationStatus::Active => "active",
            MigrationStatus::Finished => "finished",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Finalizing => "finalizing",
            MigrationStatus::Finalized => "finalized",
        }
    }

    /// Whether new batches may be claimed in this state.
    pub fn allows_scheduling(&self) -> bool {
        matches!(self, MigrationStatus::Active)
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Finalized)
    }

    /// Every status that may legally move to `next`.
    pub fn sources_of(next: MigrationStatus) -> Vec<MigrationStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Paused, Active)
                | (Active, Paused)
                | (Active, Finished)
                | (Active, Failed)
                | (Failed, Active)
                | (Paused, Finalizing)
                | (Active, Finalizing)
                | (Finished, Finalizing)
                | (Failed, Finalizing)
                | (Finalizing, Finalized)
                | (Finalizing, Failed)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MigrationStatus> for i16 {
    fn from(status: MigrationStatus) -> Self {
        match status {
            MigrationStatus::Paused => 0,
            MigrationStatus::Active => 1,
            MigrationStatus::Finished => 3,
            MigrationStatus::Failed => 4,
            MigrationStatus::Finalizing => 5,
            MigrationStatus::Finalized => 6,
        }
    }
}

impl TryFrom<i16> for MigrationStatus {
    type Error = UnknownStatus;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MigrationStatus::Paused),
            1 => Ok(MigrationStatus::Active),
            3 => Ok(MigrationStatus::Finished),
            4 => Ok(MigrationStatus::Failed),
            5 => Ok(MigrationStatus::Finalizing),
            6 => Ok(MigrationStatus::Finalized),
            code => Err(UnknownStatus {
                kind: "migration",
                code,
            }),
        }
    }
}

/// The uniqueness key of a batched migration.
///
/// At most one migration exists per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MigrationKey {
    /// The registered job class performing the backfill.
    pub job_class_name: String,
    /// The table being iterated.
    pub table_name: String,
    /// The ordered column the batches range over.
    pub column_name: String,
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}.{}]",
            self.job_class_name, self.table_name, self.column_name
        )
    }
}

/// How migration-authoring code refers to a batched migration: its key plus the job arguments.
///
/// Lookups through a configuration only match a migration whose `job_arguments` are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationConfiguration {
    /// The registered job class performing the backfill.
    pub job_class_name: String,
    /// The table being iterated.
    pub table_name: String,
    /// The ordered column the batches range over.
    pub column_name: String,
    /// Extra parameters forwarded to every batch.
    pub job_arguments: Vec<Value>,
}

impl MigrationConfiguration {
    /// Builds a configuration. A leading `::` on the job class name is dropped.
    pub fn new(
        job_class_name: impl AsRef<str>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        job_arguments: Vec<Value>,
    ) -> Self {
        Self {
            job_class_name: normalize_job_class_name(job_class_name.as_ref()),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments,
        }
    }

    /// The uniqueness key of this configuration.
    pub fn key(&self) -> MigrationKey {
        MigrationKey {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table_name.clone(),
            column_name: self.column_name.clone(),
        }
    }

    /// Whether `migration` is the one this configuration describes.
    pub fn matches(&self, migration: &BatchedMigration) -> bool {
        migration.key() == self.key() && migration.job_arguments == self.job_arguments
    }
}

impl fmt::Display for MigrationConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job_class_name: {}, table_name: {}, column_name: {}, job_arguments: {}",
            self.job_class_name,
            self.table_name,
            self.column_name,
            Value::Array(self.job_arguments.clone())
        )
    }
}

/// Strips a leading `::` from a job class name.
pub fn normalize_job_class_name(name: &str) -> String {
    name.trim().trim_start_matches("::").to_string()
}

/// A registered backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedMigration {
    /// Store-assigned identifier.
    pub id: i64,
    /// The registered job class performing the backfill.
    pub job_class_name: String,
    /// The table being iterated.
    pub table_name: String,
    /// The ordered column the batches range over, usually the primary key.
    pub column_name: String,
    /// The database the table lives in.
    pub schema_name: String,
    /// Extra parameters forwarded to every batch.
    pub job_arguments: Vec<Value>,
    /// Lowest value of `column_name` to cover.
    pub min_value: i64,
    /// Highest value of `column_name` to cover.
    pub max_value: i64,
    /// Width of the next batch window.
    pub batch_size: i64,
    /// Width of each inner chunk within a batch.
    pub sub_batch_size: i64,
    /// Ceiling for adaptive growth. `None` keeps `batch_size` fixed.
    pub max_batch_size: Option<i64>,
    /// Minimum delay between batch executions.
    pub interval: Duration,
    /// Current lifecycle state.
    pub status: MigrationStatus,
    /// When the migration was registered.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl BatchedMigration {
    /// The uniqueness key of this migration.
    pub fn key(&self) -> MigrationKey {
        MigrationKey {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table_name.clone(),
            column_name: self.column_name.clone(),
        }
    }

    /// The configuration that refers to this migration.
    pub fn configuration(&self) -> MigrationConfiguration {
        MigrationConfiguration {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table_name.clone(),
            column_name: self.column_name.clone(),
            job_arguments: self.job_arguments.clone(),
        }
    }

    /// Whether the batch size may change between batches.
    pub fn is_adaptive(&self) -> bool {
        self.max_batch_size.is_some()
    }
}

/// The fields needed to register a migration.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatchedMigration {
    /// The registered job class performing the backfill.
    pub job_class_name: String,
    /// The table being iterated.
    pub table_name: String,
    /// The ordered column the batches range over.
    pub column_name: String,
    /// The database the table lives in.
    pub schema_name: String,
    /// Extra parameters forwarded to every batch.
    pub job_arguments: Vec<Value>,
    /// Lowest value to cover.
    pub min_value: i64,
    /// Highest value to cover.
    pub max_value: i64,
    /// Width of each batch window.
    pub batch_size: i64,
    /// Width of each inner chunk.
    pub sub_batch_size: i64,
    /// Ceiling for adaptive growth.
    pub max_batch_size: Option<i64>,
    /// Minimum delay between batch executions.
    pub interval: Duration,
    /// Initial status.
    pub status: MigrationStatus,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl NewBatchedMigration {
    /// The uniqueness key of the migration to be registered.
    pub fn key(&self) -> MigrationKey {
        MigrationKey {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table_name.clone(),
            column_name: self.column_name.clone(),
        }
    }

    /// Materializes the record with a store-assigned id.
    pub fn into_migration(self, id: i64) -> BatchedMigration {
        BatchedMigration {
            id,
            job_class_name: self.job_class_name,
            table_name: self.table_name,
            column_name: self.column_name,
            schema_name: self.schema_name,
            job_arguments: self.job_arguments,
            min_value: self.min_value,
            max_value: self.max_value,
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            max_batch_size: self.max_batch_size,
            interval: self.interval,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_codes_round_trip() {
        for status in MigrationStatus::ALL {
            let code: i16 = status.into();
            assert_eq!(MigrationStatus::try_from(code), Ok(status));
        }
    }

    #[test]
    fn unknown_status_code_is_rejected() {
        let err = MigrationStatus::try_from(2).unwrap_err();
        assert_eq!(err.code, 2);
        assert_eq!(err.to_string(), "unknown migration status code 2");
    }

    #[test]
    fn only_active_allows_scheduling() {
        for status in MigrationStatus::ALL {
            assert_eq!(
                status.allows_scheduling(),
                status == MigrationStatus::Active,
                "{status}"
            );
        }
    }

    #[test]
    fn finalized_is_terminal() {
        for next in MigrationStatus::ALL {
            assert!(!MigrationStatus::Finalized.can_transition_to(next));
        }
        assert!(MigrationStatus::Finalized.is_terminal());
    }

    #[test]
    fn finalizing_is_reachable_from_finished_active_failed_and_paused() {
        use MigrationStatus::*;
        for from in [Finished, Active, Failed, Paused] {
            assert!(from.can_transition_to(Finalizing), "{from}");
        }
        assert!(!Finalizing.can_transition_to(Active));
        assert!(Finalizing.can_transition_to(Finalized));
    }

    #[test]
    fn sources_of_finalizing_exclude_finalized() {
        use MigrationStatus::*;
        assert_eq!(
            MigrationStatus::sources_of(Finalizing),
            vec![Paused, Active, Finished, Failed]
        );
        assert_eq!(MigrationStatus::sources_of(Finished), vec![Active]);
    }

    #[test]
    fn finished_cannot_go_back_to_active() {
        assert!(!MigrationStatus::Finished.can_transition_to(MigrationStatus::Active));
        assert!(!MigrationStatus::Finished.can_transition_to(MigrationStatus::Paused));
    }

    #[test]
    fn configuration_strips_leading_colons() {
        let config = MigrationConfiguration::new("::FooJob", "users", "id", vec![]);
        assert_eq!(config.job_class_name, "FooJob");
    }

    #[test]
    fn configuration_displays_arguments_as_json() {
        let config = MigrationConfiguration::new(
            "CopyColumnUsingBackgroundMigrationJob",
            "events",
            "id",
            vec![json!(["id"]), json!(["id_convert_to_bigint"])],
        );
        assert_eq!(
            config.to_string(),
            "job_class_name: CopyColumnUsingBackgroundMigrationJob, table_name: events, column_name: id, job_arguments: [[\"id\"],[\"id_convert_to_bigint\"]]"
        );
    }

    #[test]
    fn configuration_matches_requires_equal_arguments() {
        let migration = NewBatchedMigration {
            job_class_name: "FooJob".to_string(),
            table_name: "users".to_string(),
            column_name: "id".to_string(),
            schema_name: "main".to_string(),
            job_arguments: vec![json!(1)],
            min_value: 1,
            max_value: 10,
            batch_size: 2,
            sub_batch_size: 1,
            max_batch_size: None,
            interval: Duration::from_secs(120),
            status: MigrationStatus::Active,
            created_at: Utc::now(),
        }
        .into_migration(7);

        assert!(MigrationConfiguration::new("FooJob", "users", "id", vec![json!(1)]).matches(&migration));
        assert!(!MigrationConfiguration::new("FooJob", "users", "id", vec![json!(2)]).matches(&migration));
        assert!(!MigrationConfiguration::new("FooJob", "users", "uid", vec![json!(1)]).matches(&migration));
    }
}
