//! # Tranche postgres backend
//!
//! Runs batched background migrations against PostgreSQL.
//!
//! - [`Migrator`] creates the tables tranche keeps its state in.
//! - [`PgMigrationStore`] persists migrations and their jobs.
//! - [`PgTableIntrospector`] reads the bounds of the tables being migrated.
//! - [`CopyColumnUsingBackgroundMigrationJob`] backfills one column from another.

#![deny(missing_docs)]

mod copy_column;
mod introspection;
mod store;

/// Schema migrations for the tables of this backend.
pub mod migrations;

pub use copy_column::{CopyColumnArguments, CopyColumnUsingBackgroundMigrationJob};
pub use introspection::PgTableIntrospector;
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
pub use store::{PgMigrationStore, PgStoreError};
