use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use tranche_core::boundary::BatchWindow;
use tranche_core::introspection::{IntrospectionError, TableIntrospector};

/// A row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Default)]
struct Table {
    columns: BTreeSet<String>,
    rows: Vec<Row>,
}

impl Table {
    fn require_column(&self, table: &str, column: &str) -> Result<(), IntrospectionError> {
        if self.columns.contains(column) {
            Ok(())
        } else {
            Err(IntrospectionError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    fn rows_in<'a>(
        &'a mut self,
        column: &'a str,
        window: BatchWindow,
    ) -> impl Iterator<Item = &'a mut Row> + 'a {
        self.rows.iter_mut().filter(move |row| {
            row.get(column)
                .and_then(Value::as_i64)
                .is_some_and(|value| window.contains(value))
        })
    }
}

/// A set of in-memory tables the batch jobs of a test can operate on.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDatabase {
    tables: Arc<RwLock<HashMap<String, Table>>>,
}

impl InMemoryDatabase {
    /// Creates a database without tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates, or replaces, a table with the given columns.
    pub async fn create_table(&self, name: &str, columns: &[&str]) {
        let mut tables = self.tables.write().await;
        tables.insert(
            name.to_string(),
            Table {
                columns: columns.iter().map(|column| column.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Appends a row. Columns missing from the row read as absent; unknown columns are
    /// rejected.
    pub async fn insert(&self, table_name: &str, row: Row) -> Result<(), IntrospectionError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        for column in row.keys() {
            table.require_column(table_name, column)?;
        }
        table.rows.push(row);
        Ok(())
    }

    /// A snapshot of the table's rows, in insertion order.
    pub async fn rows(&self, table_name: &str) -> Result<Vec<Row>, IntrospectionError> {
        let tables = self.tables.read().await;
        tables
            .get(table_name)
            .map(|table| table.rows.clone())
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))
    }

    /// Adds a column to an existing table.
    pub async fn add_column(&self, table_name: &str, column: &str) -> Result<(), IntrospectionError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        table.columns.insert(column.to_string());
        Ok(())
    }

    /// Removes a column and its values.
    pub async fn drop_column(&self, table_name: &str, column: &str) -> Result<(), IntrospectionError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        table.require_column(table_name, column)?;
        table.columns.remove(column);
        for row in &mut table.rows {
            row.remove(column);
        }
        Ok(())
    }

    /// Applies `update` to every row whose `column` falls within `window`.
    ///
    /// Returns the number of rows visited.
    pub async fn update_rows<F>(
        &self,
        table_name: &str,
        column: &str,
        window: BatchWindow,
        mut update: F,
    ) -> Result<u64, IntrospectionError>
    where
        F: FnMut(&mut Row) + Send,
    {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        table.require_column(table_name, column)?;
        let mut updated = 0;
        for row in table.rows_in(column, window) {
            update(row);
            updated += 1;
        }
        Ok(updated)
    }

    /// Copies `copy_from[i]` into `copy_to[i]` for every row whose `column` falls within
    /// `window`.
    pub async fn copy_columns(
        &self,
        table_name: &str,
        column: &str,
        window: BatchWindow,
        copy_from: &[String],
        copy_to: &[String],
    ) -> Result<u64, IntrospectionError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        table.require_column(table_name, column)?;
        for name in copy_from.iter().chain(copy_to) {
            table.require_column(table_name, name)?;
        }

        let mut updated = 0;
        for row in table.rows_in(column, window) {
            for (from, to) in copy_from.iter().zip(copy_to) {
                let value = row.get(from).cloned().unwrap_or(Value::Null);
                row.insert(to.clone(), value);
            }
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl TableIntrospector for InMemoryDatabase {
    async fn column_bounds(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> Result<Option<(i64, i64)>, IntrospectionError> {
        let tables = self.tables.read().await;
        let table = tables
            .get(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        table.require_column(table_name, column_name)?;

        let values = table
            .rows
            .iter()
            .filter_map(|row| row.get(column_name).and_then(Value::as_i64));
        Ok(values.fold(None, |bounds, value| match bounds {
            None => Some((value, value)),
            Some((min, max)) => Some((min.min(value), max.max(value))),
        }))
    }

    async fn has_rows_between(
        &self,
        table_name: &str,
        column_name: &str,
        window: BatchWindow,
    ) -> Result<bool, IntrospectionError> {
        let tables = self.tables.read().await;
        let table = tables
            .get(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        table.require_column(table_name, column_name)?;

        Ok(table.rows.iter().any(|row| {
            row.get(column_name)
                .and_then(Value::as_i64)
                .is_some_and(|value| window.contains(value))
        }))
    }

    async fn next_value_at_or_after(
        &self,
        table_name: &str,
        column_name: &str,
        from: i64,
    ) -> Result<Option<i64>, IntrospectionError> {
        let tables = self.tables.read().await;
        let table = tables
            .get(table_name)
            .ok_or_else(|| IntrospectionError::TableNotFound(table_name.to_string()))?;
        table.require_column(table_name, column_name)?;

        Ok(table
            .rows
            .iter()
            .filter_map(|row| row.get(column_name).and_then(Value::as_i64))
            .filter(|value| *value >= from)
            .min())
    }
}
