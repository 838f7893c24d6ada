//! # Tranche
//!
//! Batched background migrations: long-running data changes split into bounded windows
//! over an ordered column, executed one at a time, resumable, and finalizable from a later
//! schema migration.
//!
//! The scheduling, running and finalizing logic lives in [`tranche_core`]. Backends are
//! enabled with features:
//!
//! - `derive` (default): `#[derive(JobClassName)]` and `#[derive(JobArguments)]`.
//! - `in-memory`: stores and tables held in memory, for tests.
//! - `postgres`: the PostgreSQL store, introspector and copy-column job.

#![deny(missing_docs)]

pub use tranche_core::*;

#[cfg(feature = "derive")]
/// Derive macros for batch jobs.
pub mod derive {
    //! Contains the derive macros of the `tranche` crate.
    pub use tranche_derive::*;
}

#[cfg(feature = "in-memory")]
/// In-memory backend.
pub mod mem {
    //! The in-memory store, database and copy-column job.
    pub use tranche_mem::*;
}

#[cfg(feature = "postgres")]
/// PostgreSQL backend.
pub mod pg {
    //! The postgres store, introspector, schema migrator and copy-column job.
    pub use tranche_pg::*;
}

pub mod prelude {
    //! The prelude module for the `tranche` crate.
    pub use tranche_core::prelude::*;

    #[cfg(feature = "derive")]
    pub use super::derive::*;
}
