mod job_arguments;
mod job_class_name;

/// Derive macro naming a batch job.
///
/// Generates an implementation of `tranche_core::JobClassName` returning the type name.
///
/// # Basic Usage
///
/// ```ignore
/// use tranche_derive::JobClassName;
///
/// #[derive(JobClassName)]
/// struct BackfillUserNamesJob;
///
/// assert_eq!(BackfillUserNamesJob.job_class_name(), "BackfillUserNamesJob");
/// ```
///
/// # Custom Name
///
/// ```ignore
/// #[derive(JobClassName)]
/// #[job_class_name("CopyColumnUsingBackgroundMigrationJob")]
/// struct CopyColumn;
/// ```
///
/// # Namespace
///
/// ```ignore
/// #[derive(JobClassName)]
/// #[job_class_name(namespace = "Backfills")]
/// struct CopyColumn;
///
/// // Returns "Backfills::CopyColumn"
/// ```
#[proc_macro_derive(JobClassName, attributes(job_class_name))]
pub fn job_class_name(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    job_class_name::job_class_name_impl(item)
}

/// Derive macro mapping a struct to a migration's positional job arguments.
///
/// Each field is serialized with `serde_json`, in declaration order. Trailing fields
/// marked `#[job_argument(default)]` may be absent and decode to `Default::default()`.
///
/// ```ignore
/// use tranche_derive::JobArguments;
///
/// #[derive(JobArguments)]
/// struct CopyColumnArguments {
///     copy_from: Vec<String>,
///     copy_to: Vec<String>,
///     #[job_argument(default)]
///     skip_nulls: bool,
/// }
///
/// let arguments = CopyColumnArguments::from_job_arguments(&[json!(["id"]), json!(["id_convert_to_bigint"])])?;
/// assert!(!arguments.skip_nulls);
/// ```
#[proc_macro_derive(JobArguments, attributes(job_argument))]
pub fn job_arguments(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    job_arguments::job_arguments_impl(item)
}
