//! Database backends
//!
//! Everything the ingestion code needs from a database goes through the
//! [`Backend`] trait. [`PgBackend`] talks to PostgreSQL through sqlx, while
//! [`MemoryBackend`] keeps tables in memory for dry runs and tests.

use async_trait::async_trait;
use serde::Serialize;

use crate::schema::{
    qualified, quote_ident, ColumnDef, TableDef, CATALOGUE_TABLE, CURRENT_CATALOGUE_TABLE,
    PK_COLUMN,
};
use crate::Result;

mod memory;
mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

/// Primary key and identifier of a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRow {
    pub pk: i64,
    pub key: Option<String>,
}

/// Row selection on an integer column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// `column = value`
    Equals { column: String, value: i64 },
    /// `column` is one of `values`
    In { column: String, values: Vec<i64> },
}

impl RowFilter {
    /// Filter on `column = value`
    pub fn equals(column: &str, value: i64) -> Self {
        RowFilter::Equals {
            column: column.to_string(),
            value,
        }
    }

    /// Filter on `column IN values`
    pub fn any_of(column: &str, values: Vec<i64>) -> Self {
        RowFilter::In {
            column: column.to_string(),
            values,
        }
    }

    /// Name of the filtered column
    pub fn column(&self) -> &str {
        match self {
            RowFilter::Equals { column, .. } | RowFilter::In { column, .. } => column,
        }
    }

    /// True if `value` passes the filter
    pub fn matches(&self, value: i64) -> bool {
        match self {
            RowFilter::Equals { value: wanted, .. } => *wanted == value,
            RowFilter::In { values, .. } => values.contains(&value),
        }
    }

    /// SQL condition using the bind parameter `$1`
    pub fn as_sql(&self) -> String {
        match self {
            RowFilter::Equals { column, .. } => format!("{} = $1", quote_ident(column)),
            RowFilter::In { column, .. } => format!("{} = ANY($1)", quote_ident(column)),
        }
    }

    /// The value bound to `$1`, as a SQL literal
    pub fn param_literal(&self) -> String {
        match self {
            RowFilter::Equals { value, .. } => value.to_string(),
            RowFilter::In { values, .. } => bigint_array_literal(values),
        }
    }
}

/// `'{1,2,3}'::bigint[]`
pub(crate) fn bigint_array_literal(values: &[i64]) -> String {
    let values: Vec<String> = values.iter().map(i64::to_string).collect();
    format!("'{{{}}}'::bigint[]", values.join(","))
}

/// Single-quoted string literal, or `NULL`
pub(crate) fn text_literal(value: Option<&str>) -> String {
    match value {
        Some(value) => format!("'{}'", value.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// Replace the `$n` placeholders of `sql` with `params[n - 1]`
pub(crate) fn inline_params(sql: &str, params: &[String]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        let param = digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match param {
            Some(param) => out.push_str(param),
            None => {
                out.push('$');
                out.push_str(&digits);
            }
        }
    }
    out
}

pub(crate) fn delete_rows_sql(schema: &str, table: &str, filter: &RowFilter) -> String {
    format!("DELETE FROM {} WHERE {}", qualified(schema, table), filter.as_sql())
}

pub(crate) fn set_values_sql(schema: &str, table: &str, column: &str) -> String {
    format!(
        "UPDATE {table} AS t SET {column} = u.value \
         FROM UNNEST($1::bigint[], $2::bigint[]) AS u(pk, value) WHERE t.{pk} = u.pk",
        table = qualified(schema, table),
        column = quote_ident(column),
        pk = quote_ident(PK_COLUMN)
    )
}

pub(crate) fn register_catalogue_sql(schema: &str) -> String {
    format!(
        "INSERT INTO {} (catalogue_name, version, matched, match_description, checksum) \
         VALUES ($1, $2, $3, $4, $5) RETURNING pk::bigint",
        qualified(schema, CATALOGUE_TABLE)
    )
}

pub(crate) fn update_catalogue_sql(schema: &str) -> String {
    format!(
        "UPDATE {} SET matched = $2, match_description = $3, checksum = $4 WHERE pk = $1",
        qualified(schema, CATALOGUE_TABLE)
    )
}

/// Unflag the current version of the catalogue named `$1`
pub(crate) fn clear_current_sql(schema: &str) -> String {
    format!(
        "DELETE FROM {current} cc USING {catalogue} c \
         WHERE cc.catalogue_pk = c.pk AND c.catalogue_name = $1",
        current = qualified(schema, CURRENT_CATALOGUE_TABLE),
        catalogue = qualified(schema, CATALOGUE_TABLE)
    )
}

pub(crate) fn insert_current_sql(schema: &str) -> String {
    format!(
        "INSERT INTO {} (catalogue_pk) VALUES ($1)",
        qualified(schema, CURRENT_CATALOGUE_TABLE)
    )
}

/// An entry of the catalogue registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CatalogueRecord {
    pub pk: i64,
    pub catalogue_name: String,
    pub version: String,
    pub matched: bool,
    pub match_description: Option<String>,
    pub checksum: Option<String>,
    /// Whether this version is the current one for its catalogue
    pub current: bool,
}

/// Values written to the registry for a catalogue version
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewCatalogue {
    pub name: String,
    pub version: String,
    pub matched: bool,
    pub match_description: Option<String>,
    pub checksum: Option<String>,
}

/// `COPY ... FROM STDIN` statement for the given columns
pub fn copy_statement(schema: &str, table: &str, columns: &[String]) -> String {
    let columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "COPY {} ({}) FROM STDIN",
        qualified(schema, table),
        columns.join(", ")
    )
}

/// Storage operations used by the loaders
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create the schema, catalogue registry and target table if missing
    async fn ensure_core_tables(&self, schema: &str) -> Result<()>;

    /// Names of the tables in `schema`
    async fn table_names(&self, schema: &str) -> Result<Vec<String>>;

    /// Names of the columns of a table, in table order
    async fn column_names(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Create a catalogue table
    async fn create_table(&self, table: &TableDef) -> Result<()>;

    /// Add columns to an existing table
    async fn add_columns(&self, schema: &str, table: &str, columns: &[ColumnDef]) -> Result<()>;

    /// Drop a table and everything that depends on it
    async fn drop_table(&self, schema: &str, table: &str) -> Result<()>;

    /// Create the join table between the targets and a catalogue if missing
    async fn create_join_table(&self, schema: &str, catalogue: &str) -> Result<()>;

    /// Bulk load a `COPY` text payload and commit it; returns the number of rows
    async fn copy_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        payload: &str,
    ) -> Result<u64>;

    /// Primary keys and text values of `key_column`, ordered by primary key
    async fn key_index(
        &self,
        schema: &str,
        table: &str,
        key_column: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<KeyRow>>;

    /// Delete the rows selected by `filter`; returns the number of rows deleted
    async fn delete_rows(&self, schema: &str, table: &str, filter: &RowFilter) -> Result<u64>;

    /// Set an integer column for the rows with the given primary keys
    async fn set_values(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        updates: &[(i64, i64)],
    ) -> Result<u64>;

    /// Registry entries for a catalogue name, ordered by primary key
    async fn find_catalogues(&self, schema: &str, name: &str) -> Result<Vec<CatalogueRecord>>;

    /// Add a registry entry and return its primary key
    async fn register_catalogue(&self, schema: &str, entry: &NewCatalogue) -> Result<i64>;

    /// Overwrite the match and checksum details of a registry entry
    async fn update_catalogue(&self, schema: &str, pk: i64, entry: &NewCatalogue) -> Result<()>;

    /// Make `catalogue_pk` the only current version of catalogue `name`
    async fn mark_current(&self, schema: &str, name: &str, catalogue_pk: i64) -> Result<()>;

    /// Check whether a table exists
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .table_names(schema)
            .await?
            .iter()
            .any(|name| name == table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_filter() {
        let filter = RowFilter::equals("catalogue_pk", 3);
        assert_eq!(filter.as_sql(), "\"catalogue_pk\" = $1");
        assert!(filter.matches(3));
        assert!(!filter.matches(4));

        let filter = RowFilter::any_of("nsa_pk", vec![1, 5]);
        assert_eq!(filter.column(), "nsa_pk");
        assert_eq!(filter.as_sql(), "\"nsa_pk\" = ANY($1)");
        assert!(filter.matches(5));
        assert!(!filter.matches(2));
    }

    #[test]
    fn test_inline_params() {
        let sql = update_catalogue_sql("mangasampledb");
        let params = [
            "12".to_string(),
            "true".to_string(),
            text_literal(Some("it's $1")),
            text_literal(None),
        ];
        assert_eq!(
            inline_params(&sql, &params),
            "UPDATE \"mangasampledb\".\"catalogue\" SET matched = true, \
             match_description = 'it''s $1', checksum = NULL WHERE pk = 12"
        );

        let filter = RowFilter::any_of("nsa_pk", vec![1, 5]);
        assert_eq!(
            inline_params(&delete_rows_sql("s", "t", &filter), &[filter.param_literal()]),
            "DELETE FROM \"s\".\"t\" WHERE \"nsa_pk\" = ANY('{1,5}'::bigint[])"
        );
        assert_eq!(inline_params("SELECT $9, $", &[]), "SELECT $9, $");
    }

    #[test]
    fn test_copy_statement() {
        let columns = vec!["catalogue_pk".to_string(), "z".to_string()];
        assert_eq!(
            copy_statement("mangasampledb", "nsa", &columns),
            "COPY \"mangasampledb\".\"nsa\" (\"catalogue_pk\", \"z\") FROM STDIN"
        );
    }
}
