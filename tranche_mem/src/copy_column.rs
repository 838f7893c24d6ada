use async_trait::async_trait;
use tranche_core::registry::{BatchContext, BatchJob, BoxError};
use tranche_derive::{JobArguments, JobClassName};

use crate::database::InMemoryDatabase;

/// Arguments of the copy-column job: `[[source columns], [destination columns]]`.
#[derive(Debug, Clone, PartialEq, Eq, JobArguments)]
pub struct CopyColumnArguments {
    /// Columns read from.
    pub copy_from: Vec<String>,
    /// Columns written to, position by position.
    pub copy_to: Vec<String>,
}

/// Copies columns within each batch window of an [`InMemoryDatabase`] table, one sub-batch
/// at a time.
#[derive(Debug, Clone, JobClassName)]
#[job_class_name("CopyColumnUsingBackgroundMigrationJob")]
pub struct InMemoryCopyColumnJob {
    database: InMemoryDatabase,
}

impl InMemoryCopyColumnJob {
    /// Creates the job over `database`.
    pub fn new(database: InMemoryDatabase) -> Self {
        Self { database }
    }
}

#[async_trait]
impl BatchJob for InMemoryCopyColumnJob {
    async fn perform(&self, batch: &BatchContext) -> Result<(), BoxError> {
        let arguments: CopyColumnArguments = batch.arguments()?;
        if arguments.copy_from.len() != arguments.copy_to.len() {
            return Err(format!(
                "cannot copy {} columns into {}",
                arguments.copy_from.len(),
                arguments.copy_to.len()
            )
            .into());
        }

        for sub_batch in batch.sub_batches() {
            let copied = self
                .database
                .copy_columns(
                    &batch.table_name,
                    &batch.column_name,
                    sub_batch,
                    &arguments.copy_from,
                    &arguments.copy_to,
                )
                .await?;
            log::trace!(
                "Copied {} rows of {} in {}..={}",
                copied,
                batch.table_name,
                sub_batch.min_value,
                sub_batch.max_value
            );
        }
        Ok(())
    }
}
