//! # Tranche memory store
//!
//! In-memory implementations of tranche's backends, primarily for testing.
//!
//! - [`InMemoryMigrationStore`] keeps batched migrations and their jobs.
//! - [`InMemoryDatabase`] holds the tables being migrated and answers the runner's
//!   boundary queries.
//! - [`InMemoryCopyColumnJob`] is the copy-column backfill over an [`InMemoryDatabase`].
//!
//! ```ignore
//! let store = InMemoryMigrationStore::new();
//! let database = InMemoryDatabase::new();
//! let registry = Arc::new(JobRegistry::new().with_job(InMemoryCopyColumnJob::new(database.clone())));
//! let runner = BatchedMigrationRunner::new(store, database, registry, RunnerConfig::default());
//! ```

#![deny(missing_docs)]

mod copy_column;
mod database;
mod migration_store;

pub use copy_column::*;
pub use database::*;
pub use migration_store::*;
