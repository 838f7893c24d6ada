//! Job class identification.
//!
//! Every batched migration names the job that processes its batches. The name is persisted
//! with the migration and resolved against a [`JobRegistry`](crate::registry::JobRegistry)
//! each time a batch runs.

/// Provides the name a batch job is registered under.
///
/// Instead of implementing it manually, use the `#[derive(JobClassName)]` macro from
/// `tranche_derive`.
///
/// # Using the Derive Macro
///
/// ```ignore
/// use tranche_derive::JobClassName;
///
/// #[derive(JobClassName)]
/// struct BackfillUserNamesJob;
///
/// // job_class_name() -> "BackfillUserNamesJob"
/// ```
///
/// ## Customization
///
/// ```ignore
/// #[derive(JobClassName)]
/// #[job_class_name("CopyColumnUsingBackgroundMigrationJob")]
/// struct CopyColumn;
/// ```
///
/// A leading `::` in a custom name is dropped, matching how names are stored at queue time.
///
/// The name must be stable across deployments: renaming a job orphans every migration that
/// was queued under the old name.
pub trait JobClassName {
    /// Returns the name this job is registered and queued under.
    fn job_class_name(&self) -> &str;
}
