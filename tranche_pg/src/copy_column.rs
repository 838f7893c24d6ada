use async_trait::async_trait;
use sqlx::PgPool;
use tranche_core::registry::{BatchContext, BatchJob, BoxError};
use tranche_derive::{JobArguments, JobClassName};

use crate::introspection::{quote_identifier, quote_table};

/// Arguments of the copy-column job: `[[source columns], [destination columns]]`.
#[derive(Debug, Clone, PartialEq, Eq, JobArguments)]
pub struct CopyColumnArguments {
    /// Columns read from.
    pub copy_from: Vec<String>,
    /// Columns written to, position by position.
    pub copy_to: Vec<String>,
}

impl CopyColumnArguments {
    fn assignments(&self) -> Result<String, BoxError> {
        if self.copy_from.is_empty() || self.copy_from.len() != self.copy_to.len() {
            return Err(format!(
                "cannot copy {} columns into {}",
                self.copy_from.len(),
                self.copy_to.len()
            )
            .into());
        }

        let assignments = self
            .copy_from
            .iter()
            .zip(&self.copy_to)
            .map(|(from, to)| -> Result<String, BoxError> {
                Ok(format!("{} = {}", quote_identifier(to)?, quote_identifier(from)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assignments.join(", "))
    }
}

/// Copies columns of a postgres table, one sub-batch per transaction.
///
/// This is the job used to backfill a new column (for example a `BIGINT` copy of an
/// `INTEGER` primary key) before swapping it in.
#[derive(Debug, Clone, JobClassName)]
#[job_class_name("CopyColumnUsingBackgroundMigrationJob")]
pub struct CopyColumnUsingBackgroundMigrationJob {
    postgres: PgPool,
}

impl CopyColumnUsingBackgroundMigrationJob {
    /// Creates the job over `postgres`.
    pub fn new(postgres: PgPool) -> Self {
        Self { postgres }
    }
}

#[async_trait]
impl BatchJob for CopyColumnUsingBackgroundMigrationJob {
    async fn perform(&self, batch: &BatchContext) -> Result<(), BoxError> {
        let arguments: CopyColumnArguments = batch.arguments()?;
        let statement = format!(
            "UPDATE {} SET {} WHERE {} BETWEEN $1 AND $2",
            quote_table(&batch.table_name)?,
            arguments.assignments()?,
            quote_identifier(&batch.column_name)?
        );

        for sub_batch in batch.sub_batches() {
            let mut tx = self.postgres.begin().await?;
            let result = sqlx::query(&statement)
                .bind(sub_batch.min_value)
                .bind(sub_batch.max_value)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            log::trace!(
                "Copied {} rows of {} in {}..={}",
                result.rows_affected(),
                batch.table_name,
                sub_batch.min_value,
                sub_batch.max_value
            );
        }
        Ok(())
    }
}
