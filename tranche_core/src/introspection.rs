//! Read-only access to the tables being migrated.

use crate::boundary::BatchWindow;
use crate::registry::BoxError;
use async_trait::async_trait;

/// Errors raised while inspecting a table.
#[derive(Debug, thiserror::Error)]
pub enum IntrospectionError {
    /// The table does not exist.
    #[error("table {0} does not exist")]
    TableNotFound(String),
    /// The column does not exist on the table.
    #[error("column {column} does not exist on table {table}")]
    ColumnNotFound {
        /// The table inspected.
        table: String,
        /// The missing column.
        column: String,
    },
    /// A table or column name is not a plain identifier.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    /// The backing database failed.
    #[error("introspection failed: {0}")]
    Backend(#[source] BoxError),
}

/// Inspects the range of a table's batching column.
#[async_trait]
pub trait TableIntrospector: Send + Sync {
    /// `MIN(column)` and `MAX(column)`, or `None` when the table has no rows.
    async fn column_bounds(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> Result<Option<(i64, i64)>, IntrospectionError>;

    /// Whether any row has `column` inside `window`.
    async fn has_rows_between(
        &self,
        table_name: &str,
        column_name: &str,
        window: BatchWindow,
    ) -> Result<bool, IntrospectionError>;

    /// The lowest value of `column` at or after `from`, or `None` when no row lies there.
    async fn next_value_at_or_after(
        &self,
        table_name: &str,
        column_name: &str,
        from: i64,
    ) -> Result<Option<i64>, IntrospectionError>;
}
