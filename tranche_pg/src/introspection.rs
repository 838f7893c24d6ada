use async_trait::async_trait;
use sqlx::PgPool;
use tranche_core::boundary::BatchWindow;
use tranche_core::introspection::{IntrospectionError, TableIntrospector};

const UNDEFINED_TABLE: &str = "42P01";
const UNDEFINED_COLUMN: &str = "42703";

/// Answers boundary queries against live postgres tables.
///
/// Table names may be schema-qualified (`analytics.events`). Every identifier is validated
/// and quoted before it reaches the query text.
#[derive(Clone, Debug)]
pub struct PgTableIntrospector {
    postgres: PgPool,
}

impl PgTableIntrospector {
    /// Creates a new `PgTableIntrospector`.
    pub fn new(postgres: PgPool) -> Self {
        Self { postgres }
    }
}

/// Quotes a plain SQL identifier, rejecting anything but letters, digits and underscores.
pub(crate) fn quote_identifier(identifier: &str) -> Result<String, IntrospectionError> {
    let mut chars = identifier.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(IntrospectionError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(format!("\"{identifier}\""))
}

/// Quotes a table name, keeping an optional schema prefix.
pub(crate) fn quote_table(table_name: &str) -> Result<String, IntrospectionError> {
    match table_name.split_once('.') {
        Some((schema, table)) => Ok(format!(
            "{}.{}",
            quote_identifier(schema)?,
            quote_identifier(table)?
        )),
        None => quote_identifier(table_name),
    }
}

fn map_error(error: sqlx::Error, table_name: &str, column_name: &str) -> IntrospectionError {
    if let sqlx::Error::Database(db_error) = &error {
        match db_error.code().as_deref() {
            Some(UNDEFINED_TABLE) => {
                return IntrospectionError::TableNotFound(table_name.to_string());
            }
            Some(UNDEFINED_COLUMN) => {
                return IntrospectionError::ColumnNotFound {
                    table: table_name.to_string(),
                    column: column_name.to_string(),
                };
            }
            _ => {}
        }
    }
    IntrospectionError::Backend(Box::new(error))
}

#[async_trait]
impl TableIntrospector for PgTableIntrospector {
    async fn column_bounds(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> Result<Option<(i64, i64)>, IntrospectionError> {
        let table = quote_table(table_name)?;
        let column = quote_identifier(column_name)?;

        let (min, max): (Option<i64>, Option<i64>) = sqlx::query_as(&format!(
            "SELECT MIN({column})::BIGINT, MAX({column})::BIGINT FROM {table}"
        ))
        .fetch_one(&self.postgres)
        .await
        .map_err(|e| map_error(e, table_name, column_name))?;

        Ok(min.zip(max))
    }

    async fn has_rows_between(
        &self,
        table_name: &str,
        column_name: &str,
        window: BatchWindow,
    ) -> Result<bool, IntrospectionError> {
        let table = quote_table(table_name)?;
        let column = quote_identifier(column_name)?;

        sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS (SELECT 1 FROM {table} WHERE {column} BETWEEN $1 AND $2)"
        ))
        .bind(window.min_value)
        .bind(window.max_value)
        .fetch_one(&self.postgres)
        .await
        .map_err(|e| map_error(e, table_name, column_name))
    }

    async fn next_value_at_or_after(
        &self,
        table_name: &str,
        column_name: &str,
        from: i64,
    ) -> Result<Option<i64>, IntrospectionError> {
        let table = quote_table(table_name)?;
        let column = quote_identifier(column_name)?;

        sqlx::query_scalar::<_, Option<i64>>(&format!(
            "SELECT MIN({column})::BIGINT FROM {table} WHERE {column} >= $1"
        ))
        .bind(from)
        .fetch_one(&self.postgres)
        .await
        .map_err(|e| map_error(e, table_name, column_name))
    }
}
