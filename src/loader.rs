//! Loading a table into the database
//!
//! [`table_to_db`] creates a PostgreSQL table matching a [`Table`] and bulk
//! loads its rows with `COPY`, committing every `chunk_size` rows.

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;

use crate::copy::encode_rows;
use crate::db::Backend;
use crate::schema::{qualified, TableDef};
use crate::table::Table;
use crate::{Result, SampleDbError};

/// Rows sent per `COPY` when not specified
pub const DEFAULT_CHUNK_SIZE: usize = 20_000;

/// Options for [`table_to_db`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Drop an existing table of the same name first
    pub overwrite: bool,
    /// Rows per committed chunk
    pub chunk_size: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Outcome of a load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub schema: String,
    pub table: String,
    pub rows: u64,
    pub chunks: usize,
}

/// Progress bar over loaded rows; draws nothing when stderr is not a terminal
fn row_progress_bar(rows: usize) -> ProgressBar {
    let bar = ProgressBar::new(rows as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40}] {pos}/{len} rows ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style.progress_chars("=> "));
    bar
}

/// Check whether `table` exists in `schema`
///
/// With `drop` set an existing table is dropped (cascading to anything that
/// references it) and `false` is returned.
pub async fn check_table_exists(
    backend: &dyn Backend,
    schema: &str,
    table: &str,
    drop: bool,
) -> Result<bool> {
    if !backend.table_exists(schema, table).await? {
        return Ok(false);
    }
    if drop {
        warn!("Dropping table {}", qualified(schema, table));
        backend.drop_table(schema, table).await?;
        return Ok(false);
    }
    Ok(true)
}

/// Create a table in `schema` with columns matching `table`
pub async fn create_new_table(
    backend: &dyn Backend,
    schema: &str,
    name: &str,
    table: &Table,
) -> Result<TableDef> {
    let def = TableDef::from_table(schema, name, table, false)?;
    backend.create_table(&def).await?;
    info!(
        "Created table {} with {} columns",
        qualified(schema, &def.name),
        def.columns.len()
    );
    Ok(def)
}

/// Copy the rows of `table` into an existing table
///
/// Every line starts with the `leading` (column, value) pairs, followed by
/// the table columns in order. Each chunk of `chunk_size` rows is committed
/// on its own, so a failure keeps the chunks already loaded.
pub async fn load_data(
    backend: &dyn Backend,
    schema: &str,
    name: &str,
    table: &Table,
    chunk_size: usize,
    leading: &[(String, String)],
) -> Result<LoadReport> {
    if chunk_size == 0 {
        return Err(SampleDbError::InvalidArgument(
            "chunk_size must be positive".to_string(),
        ));
    }

    let mut columns: Vec<String> = leading.iter().map(|(c, _)| c.clone()).collect();
    columns.extend(table.colnames().iter().map(|c| c.to_lowercase()));
    let values: Vec<String> = leading.iter().map(|(_, v)| v.clone()).collect();

    let total = table.len();
    let bar = row_progress_bar(total);
    let mut rows = 0;
    let mut chunks = 0;

    for start in (0..total).step_by(chunk_size) {
        let end = (start + chunk_size).min(total);
        let payload = encode_rows(table, start..end, &values);
        let copied = backend.copy_rows(schema, name, &columns, &payload).await?;
        debug!("Committed rows {}..{} of {}", start, end, total);
        rows += copied;
        chunks += 1;
        bar.inc((end - start) as u64);
    }
    bar.finish_and_clear();

    Ok(LoadReport {
        schema: schema.to_string(),
        table: name.to_string(),
        rows,
        chunks,
    })
}

/// Create a table for `table` and load its rows
///
/// Fails with [`SampleDbError::TableExists`] when the table is already there
/// and `overwrite` is not set.
pub async fn table_to_db(
    backend: &dyn Backend,
    table: &Table,
    schema: &str,
    name: &str,
    options: LoadOptions,
) -> Result<LoadReport> {
    if options.chunk_size == 0 {
        return Err(SampleDbError::InvalidArgument(
            "chunk_size must be positive".to_string(),
        ));
    }

    let name = name.to_lowercase();
    if check_table_exists(backend, schema, &name, options.overwrite).await? {
        return Err(SampleDbError::TableExists(qualified(schema, &name)));
    }

    create_new_table(backend, schema, &name, table).await?;
    let report = load_data(backend, schema, &name, table, options.chunk_size, &[]).await?;
    info!(
        "Loaded {} rows into {} in {} chunks",
        report.rows,
        qualified(schema, &name),
        report.chunks
    );
    Ok(report)
}
