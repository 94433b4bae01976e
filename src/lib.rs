//! mangasampledb: catalogue ingestion for the MaNGA sample database
//!
//! This crate reads astronomical catalogues (FITS binary tables and ASCII
//! tables), maps their columns to PostgreSQL types, creates or extends a
//! matching table and bulk-loads the rows with `COPY`. Newly ingested
//! catalogues can be cross-matched against the `manga_target` reference
//! table on an identifier column.

use std::path::PathBuf;
use thiserror::Error;

pub mod catalogue;
pub mod config;
pub mod copy;
pub mod crossmatch;
pub mod db;
pub mod loader;
pub mod schema;
pub mod table;
pub mod targets;

// Re-export commonly used types
pub use catalogue::{ingest_catalogue, IngestOptions, IngestReport};
pub use config::ConnectionParams;
pub use crossmatch::{MatchReport, MatchSource};
pub use db::{Backend, MemoryBackend, PgBackend};
pub use loader::{table_to_db, LoadOptions, LoadReport};
pub use table::{Column, ColumnData, DataType, Table, TableFormat};

/// Default schema holding the sample database tables
pub const DEFAULT_SCHEMA: &str = "mangasampledb";

/// Main error type for the mangasampledb library
#[derive(Debug, Error)]
pub enum SampleDbError {
    #[error("File I/O error on {path:?}: {source}")]
    FileError {
        /// The path of the file that caused the error
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid FITS file: {0}")]
    FitsError(String),

    #[error("Table error: {0}")]
    TableError(String),

    #[error("Column {column} cannot be converted to PostgreSQL: {reason}")]
    UnsupportedColumn { column: String, reason: String },

    #[error("Table {0} exists and overwrite is not set")]
    TableExists(String),

    #[error("Catalogue ({name}, {version}) already exists in the database")]
    CatalogueExists { name: String, version: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("COPY format error: {0}")]
    CopyFormat(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for mangasampledb operations
pub type Result<T> = std::result::Result<T, SampleDbError>;

/// Helper function to convert a std::io::Error into a path-carrying error
pub fn io_err(path: impl Into<PathBuf>, err: std::io::Error) -> SampleDbError {
    SampleDbError::FileError {
        path: path.into(),
        source: err,
    }
}
