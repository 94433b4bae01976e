//! Versioned catalogue ingestion
//!
//! A catalogue is stored in a table named after it, with one set of rows per
//! version. Each version has an entry in the `catalogue` registry and its rows
//! point at that entry through `catalogue_pk`. One version per catalogue can
//! be flagged as current.

use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::crossmatch::{crossmatch, MatchReport, MatchSource};
use crate::db::{Backend, NewCatalogue, RowFilter};
use crate::loader::{load_data, DEFAULT_CHUNK_SIZE};
use crate::schema::{
    join_key_column, join_table_name, qualified, TableDef, CATALOGUE_PK_COLUMN, CATALOGUE_TABLE,
    CURRENT_CATALOGUE_TABLE, PK_COLUMN, TARGET_TABLE,
};
use crate::table::{Table, TableFormat};
use crate::{io_err, Result, SampleDbError, DEFAULT_SCHEMA};

/// Options for [`ingest_catalogue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    pub schema: String,
    /// Make this version the current one
    pub current: bool,
    /// Reload a version that is already registered
    pub replace: bool,
    /// Cross-match the new rows to the MaNGA targets
    pub match_source: Option<MatchSource>,
    pub chunk_size: usize,
    /// Format of the catalogue file, guessed from the file when not set
    pub format: Option<TableFormat>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            current: false,
            replace: false,
            match_source: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            format: None,
        }
    }
}

/// Outcome of an ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub catalogue: String,
    pub version: String,
    pub catalogue_pk: i64,
    pub table: String,
    pub rows: u64,
    pub chunks: usize,
    /// Whether an existing version was replaced
    pub replaced: bool,
    /// Columns added to an existing table
    pub added_columns: Vec<String>,
    pub current: bool,
    pub checksum: String,
    pub matching: Option<MatchReport>,
}

/// md5 checksum of a file, as lowercase hex
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

/// Remove the rows of one catalogue version and their join table links
async fn delete_version(
    backend: &dyn Backend,
    schema: &str,
    name: &str,
    catalogue_pk: i64,
) -> Result<u64> {
    if !backend.table_exists(schema, name).await? {
        return Ok(0);
    }
    let version = RowFilter::equals(CATALOGUE_PK_COLUMN, catalogue_pk);

    let join_table = join_table_name(name);
    if backend.table_exists(schema, &join_table).await? {
        let pks: Vec<i64> = backend
            .key_index(schema, name, PK_COLUMN, Some(&version))
            .await?
            .into_iter()
            .map(|row| row.pk)
            .collect();
        if !pks.is_empty() {
            let links = backend
                .delete_rows(schema, &join_table, &RowFilter::any_of(&join_key_column(name), pks))
                .await?;
            info!("Deleted {} links from {}", links, join_table);
        }
    }

    backend.delete_rows(schema, name, &version).await
}

/// Create the catalogue table, or add the columns it is missing
async fn prepare_table(backend: &dyn Backend, def: &TableDef) -> Result<Vec<String>> {
    if !backend.table_exists(&def.schema, &def.name).await? {
        backend.create_table(def).await?;
        info!("Created table {}", qualified(&def.schema, &def.name));
        return Ok(Vec::new());
    }

    let existing = backend.column_names(&def.schema, &def.name).await?;
    let missing: Vec<_> = def
        .columns
        .iter()
        .filter(|c| !existing.contains(&c.name))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(Vec::new());
    }

    let names: Vec<String> = missing.iter().map(|c| c.name.clone()).collect();
    warn!(
        "Adding columns {} to {}",
        names.join(", "),
        qualified(&def.schema, &def.name)
    );
    backend.add_columns(&def.schema, &def.name, &missing).await?;
    Ok(names)
}

/// Ingest one version of a catalogue
///
/// The catalogue name is lowercased and used as the table name. An already
/// registered `(name, version)` fails with [`SampleDbError::CatalogueExists`]
/// unless `replace` is set, in which case the rows of that version are
/// deleted and loaded again under the same registry entry.
pub async fn ingest_catalogue(
    backend: &dyn Backend,
    path: &Path,
    name: &str,
    version: &str,
    options: &IngestOptions,
) -> Result<IngestReport> {
    let name = name.trim().to_lowercase();
    let schema = options.schema.as_str();

    if name.is_empty() || version.trim().is_empty() {
        return Err(SampleDbError::InvalidArgument(
            "catalogue name and version cannot be empty".to_string(),
        ));
    }
    if [CATALOGUE_TABLE, CURRENT_CATALOGUE_TABLE, TARGET_TABLE].contains(&name.as_str())
        || name.starts_with(&join_table_name(""))
    {
        return Err(SampleDbError::InvalidArgument(format!(
            "{} is a reserved table name",
            name
        )));
    }
    if options.chunk_size == 0 {
        return Err(SampleDbError::InvalidArgument(
            "chunk_size must be positive".to_string(),
        ));
    }
    if !path.exists() {
        return Err(SampleDbError::InvalidArgument(format!(
            "catalogue file {} could not be found",
            path.display()
        )));
    }
    if let Some(source) = &options.match_source {
        source.check()?;
    }

    let table = Table::read(path, options.format)?;
    info!(
        "Read {} rows and {} columns from {}",
        table.len(),
        table.num_columns(),
        path.display()
    );
    let def = TableDef::from_table(schema, &name, &table, true)?;

    let match_description = match &options.match_source {
        Some(source) => {
            source.validate(&table)?;
            Some(source.description()?)
        }
        None => None,
    };
    let checksum = file_checksum(path)?;

    backend.ensure_core_tables(schema).await?;

    let existing = backend
        .find_catalogues(schema, &name)
        .await?
        .into_iter()
        .find(|entry| entry.version == version);
    if let Some(entry) = &existing {
        if !options.replace {
            return Err(SampleDbError::CatalogueExists {
                name,
                version: version.to_string(),
            });
        }
        warn!("Replacing catalogue ({}, {})", name, version);
        let deleted = delete_version(backend, schema, &name, entry.pk).await?;
        info!("Deleted {} rows of ({}, {})", deleted, name, version);
    }

    let added_columns = prepare_table(backend, &def).await?;

    let entry = NewCatalogue {
        name: name.clone(),
        version: version.to_string(),
        matched: options.match_source.is_some(),
        match_description,
        checksum: Some(checksum),
    };
    let catalogue_pk = match &existing {
        Some(record) => {
            backend.update_catalogue(schema, record.pk, &entry).await?;
            record.pk
        }
        None => backend.register_catalogue(schema, &entry).await?,
    };

    let leading = vec![(CATALOGUE_PK_COLUMN.to_string(), catalogue_pk.to_string())];
    let load = load_data(backend, schema, &name, &table, options.chunk_size, &leading).await?;
    info!(
        "Loaded {} rows of ({}, {}) into {}",
        load.rows,
        name,
        version,
        qualified(schema, &name)
    );

    if options.current {
        backend.mark_current(schema, &name, catalogue_pk).await?;
        info!("({}, {}) is now the current version", name, version);
    }

    let matching = match &options.match_source {
        Some(source) => Some(
            crossmatch(
                backend,
                schema,
                &name,
                catalogue_pk,
                source,
                options.chunk_size,
            )
            .await?,
        ),
        None => None,
    };

    Ok(IngestReport {
        catalogue: name.clone(),
        version: version.to_string(),
        catalogue_pk,
        table: name,
        rows: load.rows,
        chunks: load.chunks,
        replaced: existing.is_some(),
        added_columns,
        current: options.current,
        checksum: entry.checksum.unwrap_or_default(),
        matching,
    })
}
