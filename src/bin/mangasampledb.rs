//! Command line tool to load catalogues into the MaNGA sample database
//!
//! Connects to PostgreSQL (or, with `--dry-run`, to an in-memory database
//! whose statements are printed at the end) and runs one subcommand.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info};
use serde::Serialize;

use mangasampledb::crossmatch::MatchSource;
use mangasampledb::loader::DEFAULT_CHUNK_SIZE;
use mangasampledb::schema::SqlType;
use mangasampledb::targets::{
    load_manga_targets, update_cube_manga_target_pk, CUBE_TABLE, DATA_SCHEMA,
};
use mangasampledb::{
    ingest_catalogue, table_to_db, Backend, ConnectionParams, DataType, IngestOptions,
    LoadOptions, MemoryBackend, PgBackend, Result, SampleDbError, Table, TableFormat,
    DEFAULT_SCHEMA,
};

#[derive(Debug, Parser)]
#[command(name = "mangasampledb", version, about = "Load catalogues into the MaNGA sample database")]
struct Cli {
    /// Full connection URL; overrides the individual connection options
    #[arg(long, env = "MANGASAMPLEDB_URL", global = true)]
    connection_string: Option<String>,

    /// The database name
    #[arg(short = 'd', long, default_value = "manga", global = true)]
    database: String,

    /// The database username
    #[arg(short = 'u', long, default_value = "manga", global = true)]
    user: String,

    /// The database password
    #[arg(short = 'w', long, default_value = "", global = true)]
    password: String,

    /// The database host
    #[arg(short = 'H', long, default_value = "localhost", global = true)]
    host: String,

    /// The database port
    #[arg(short = 'p', long, default_value_t = 5432, global = true)]
    port: u16,

    /// Schema holding the sample database tables
    #[arg(long, default_value = DEFAULT_SCHEMA, global = true)]
    schema: String,

    /// Print debug messages
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Run against an in-memory database and print the SQL instead
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            host: self.host.clone(),
            port: self.port,
            connection_string: self.connection_string.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the columns of a table file and their PostgreSQL types
    Inspect {
        /// Path of the table file
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[command(flatten)]
        format: FormatArgs,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a table file into a new database table
    LoadTable {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Name of the table to create
        #[arg(value_name = "TABLE")]
        table: String,
        /// Drop the table first if it exists
        #[arg(long)]
        overwrite: bool,
        /// Rows committed at a time
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[command(flatten)]
        format: FormatArgs,
    },
    /// Ingest a version of a catalogue
    Ingest(IngestArgs),
    /// Add MaNGA ids from table files to the target table
    LoadTargets {
        /// Table files holding MaNGA ids
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
        /// Column holding the MaNGA ids
        #[arg(long, default_value = "mangaid")]
        column: String,
    },
    /// Point mangadatadb.cube rows at their MaNGA target
    UpdateCubePk,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Path of the catalogue file
    #[arg(value_name = "CATFILE")]
    catfile: PathBuf,
    /// Name of the catalogue
    #[arg(value_name = "CATNAME")]
    catname: String,
    /// Version of the catalogue
    #[arg(value_name = "VERSION")]
    version: String,
    /// Make this version the current one
    #[arg(short = 'c', long)]
    current: bool,
    /// Replace the version if it already exists
    #[arg(short = 'r', long)]
    replace: bool,
    /// Match to the MaNGA targets on this catalogue column
    #[arg(long, value_name = "COLUMN", conflicts_with = "match_files")]
    match_column: Option<String>,
    /// Match to the MaNGA targets using a match file and its description
    #[arg(
        short = 'm',
        long = "match",
        num_args = 2,
        value_names = ["MATCH_FILE", "MATCH_DESCRIPTION"],
        requires = "match_key"
    )]
    match_files: Option<Vec<PathBuf>>,
    /// Column shared by the match file and the catalogue
    #[arg(long, value_name = "COLUMN")]
    match_key: Option<String>,
    /// Rows committed at a time
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[command(flatten)]
    format: FormatArgs,
    /// Print the ingestion report as JSON
    #[arg(long)]
    json: bool,
}

impl IngestArgs {
    fn match_source(&self) -> Option<MatchSource> {
        if let Some(column) = &self.match_column {
            return Some(MatchSource::Column(column.clone()));
        }
        match (&self.match_files, &self.match_key) {
            (Some(files), Some(key)) if files.len() == 2 => Some(MatchSource::File {
                path: files[0].clone(),
                key_column: key.clone(),
                description: files[1].clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatName {
    Fits,
    FixedWidth,
    Csv,
    Basic,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Format of the file; guessed from the file when omitted
    #[arg(long, value_enum)]
    format: Option<FormatName>,
    /// FITS extension to read (default: first binary table)
    #[arg(long)]
    hdu: Option<usize>,
}

impl FormatArgs {
    fn table_format(&self) -> Option<TableFormat> {
        match (self.format, self.hdu) {
            (Some(FormatName::Fits), hdu) | (None, hdu @ Some(_)) => Some(TableFormat::Fits { hdu }),
            (Some(FormatName::FixedWidth), _) => Some(TableFormat::FixedWidth),
            (Some(FormatName::Csv), _) => Some(TableFormat::Csv),
            (Some(FormatName::Basic), _) => Some(TableFormat::Basic),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ColumnSummary {
    name: String,
    dtype: DataType,
    shape: Vec<usize>,
    sql_type: Option<String>,
    unit: Option<String>,
    null_elements: usize,
}

fn inspect(file: &Path, format: Option<TableFormat>, json: bool) -> Result<()> {
    let table = Table::read(file, format)?;
    let summaries: Vec<ColumnSummary> = table
        .columns()
        .iter()
        .map(|column| ColumnSummary {
            name: column.name.clone(),
            dtype: column.dtype(),
            shape: column.shape.clone(),
            sql_type: SqlType::for_column(&column.name, column.dtype(), &column.shape)
                .ok()
                .map(|t| t.as_sql()),
            unit: column.unit.clone(),
            null_elements: (0..column.data.len())
                .filter(|&element| column.is_null(element))
                .count(),
        })
        .collect();

    if json {
        match serde_json::to_string_pretty(&summaries) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Cannot serialize the summary: {}", e),
        }
        return Ok(());
    }

    println!(
        "{}: {} rows, {} columns",
        file.display(),
        table.len(),
        table.num_columns()
    );
    for summary in &summaries {
        println!(
            "  {:<24} {:<8} {:<10} {:<20} {}",
            summary.name,
            summary.dtype.to_string(),
            format!("{:?}", summary.shape),
            summary.sql_type.as_deref().unwrap_or("unsupported"),
            summary.null_elements
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Cannot serialize the report: {}", e),
    }
}

async fn execute(cli: &Cli, backend: &dyn Backend) -> Result<()> {
    let schema = cli.schema.as_str();
    match &cli.command {
        Command::Inspect { .. } => unreachable!("inspect runs without a database"),
        Command::LoadTable {
            file,
            table,
            overwrite,
            chunk_size,
            format,
        } => {
            let data = Table::read(file, format.table_format())?;
            let options = LoadOptions {
                overwrite: *overwrite,
                chunk_size: *chunk_size,
            };
            let report = table_to_db(backend, &data, schema, table, options).await?;
            info!("Loaded {} rows into {}.{}", report.rows, report.schema, report.table);
            Ok(())
        }
        Command::Ingest(args) => {
            let options = IngestOptions {
                schema: schema.to_string(),
                current: args.current,
                replace: args.replace,
                match_source: args.match_source(),
                chunk_size: args.chunk_size,
                format: args.format.table_format(),
            };
            let report =
                ingest_catalogue(backend, &args.catfile, &args.catname, &args.version, &options)
                    .await?;
            if args.json {
                print_json(&report);
            }
            Ok(())
        }
        Command::LoadTargets { files, column } => {
            let tables = files
                .iter()
                .map(|file| Table::read(file, None))
                .collect::<Result<Vec<Table>>>()?;
            let sources: Vec<(&Table, &str)> =
                tables.iter().map(|t| (t, column.as_str())).collect();
            load_manga_targets(backend, schema, &sources).await?;
            Ok(())
        }
        Command::UpdateCubePk => {
            update_cube_manga_target_pk(backend, schema).await?;
            Ok(())
        }
    }
}

/// Reject subcommands that need tables the in-memory database does not have
fn check_dry_run(cli: &Cli) -> Result<()> {
    if cli.dry_run && matches!(cli.command, Command::UpdateCubePk) {
        return Err(SampleDbError::InvalidArgument(format!(
            "update-cube-pk cannot be dry run: it reads the existing {}.{} table",
            DATA_SCHEMA, CUBE_TABLE
        )));
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Inspect { file, format, json } = &cli.command {
        return inspect(file, format.table_format(), *json);
    }

    check_dry_run(&cli)?;
    if cli.dry_run {
        let backend = MemoryBackend::new();
        let result = execute(&cli, &backend).await;
        for statement in backend.statements() {
            println!("{};", statement);
        }
        return result;
    }

    let backend = PgBackend::connect(&cli.connection_params()).await?;
    execute(&cli, &backend).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        process::exit(1);
    }
}
