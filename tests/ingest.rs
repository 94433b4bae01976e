use std::fs;
use std::path::{Path, PathBuf};

use mangasampledb::crossmatch::MatchSource;
use mangasampledb::db::MemoryBackend;
use mangasampledb::schema::{ColumnDef, SqlBaseType, SqlType, TableDef};
use mangasampledb::targets::{load_manga_targets, update_cube_manga_target_pk};
use mangasampledb::{
    ingest_catalogue, table_to_db, Backend, IngestOptions, LoadOptions, SampleDbError, Table,
    DEFAULT_SCHEMA,
};
use tempfile::TempDir;

const NSA_V1: &str = "mangaid,nsaid,z\n1-1,100,0.1\n1-2,200,0.2\n";
const NSA_V2: &str = "mangaid,nsaid,z,mass\n1-5,500,0.5,10.2\n";

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn rows_of(backend: &MemoryBackend, table: &str) -> Vec<Vec<Option<String>>> {
    backend.rows(DEFAULT_SCHEMA, table).unwrap_or_default()
}

fn text(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|v| Some(v.to_string())).collect()
}

async fn ingest(
    backend: &MemoryBackend,
    path: &Path,
    version: &str,
    options: IngestOptions,
) -> mangasampledb::Result<mangasampledb::IngestReport> {
    ingest_catalogue(backend, path, "NSA", version, &options).await
}

async fn load_targets(backend: &MemoryBackend, ids: &[&str]) {
    let table = Table::new(vec![mangasampledb::Column::new(
        "MANGAID",
        mangasampledb::ColumnData::Str(ids.iter().map(|id| id.to_string()).collect()),
    )])
    .unwrap();
    load_manga_targets(backend, DEFAULT_SCHEMA, &[(&table, "mangaid")])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ingest_registers_and_loads() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nsa.csv", NSA_V1);
    let backend = MemoryBackend::new();

    let options = IngestOptions {
        current: true,
        ..Default::default()
    };
    let report = ingest(&backend, &path, "v1_0_1", options).await.unwrap();

    assert_eq!(report.catalogue, "nsa");
    assert_eq!(report.catalogue_pk, 1);
    assert_eq!(report.rows, 2);
    assert_eq!(report.checksum.len(), 32);
    assert!(!report.replaced);
    assert!(report.matching.is_none());

    assert_eq!(
        backend.columns(DEFAULT_SCHEMA, "nsa").unwrap(),
        vec!["pk", "mangaid", "nsaid", "z", "catalogue_pk"]
    );
    assert_eq!(
        backend
            .column_values(DEFAULT_SCHEMA, "nsa", "catalogue_pk")
            .unwrap(),
        text(&["1", "1"])
    );

    let records = backend.find_catalogues(DEFAULT_SCHEMA, "nsa").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].version, "v1_0_1");
    assert!(records[0].current);
    assert!(!records[0].matched);
    assert_eq!(records[0].checksum.as_deref(), Some(report.checksum.as_str()));
}

#[tokio::test]
async fn test_existing_version_needs_replace() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nsa.csv", NSA_V1);
    let backend = MemoryBackend::new();

    ingest(&backend, &path, "v1", IngestOptions::default())
        .await
        .unwrap();

    let result = ingest(&backend, &path, "v1", IngestOptions::default()).await;
    match result {
        Err(SampleDbError::CatalogueExists { name, version }) => {
            assert_eq!(name, "nsa");
            assert_eq!(version, "v1");
        }
        other => panic!("Expected CatalogueExists, got {:?}", other),
    }

    let options = IngestOptions {
        replace: true,
        ..Default::default()
    };
    let report = ingest(&backend, &path, "v1", options).await.unwrap();
    assert!(report.replaced);
    assert_eq!(report.catalogue_pk, 1);
    assert_eq!(rows_of(&backend, "nsa").len(), 2);
    assert_eq!(backend.catalogues(DEFAULT_SCHEMA).len(), 1);
}

#[tokio::test]
async fn test_new_version_adds_columns_and_moves_current() {
    let dir = TempDir::new().unwrap();
    let v1 = write(&dir, "nsa_v1.csv", NSA_V1);
    let v2 = write(&dir, "nsa_v2.csv", NSA_V2);
    let backend = MemoryBackend::new();

    let current = IngestOptions {
        current: true,
        ..Default::default()
    };
    ingest(&backend, &v1, "v1", current.clone()).await.unwrap();
    let report = ingest(&backend, &v2, "v2", current).await.unwrap();

    assert_eq!(report.catalogue_pk, 2);
    assert_eq!(report.added_columns, vec!["mass"]);
    assert_eq!(
        backend.column_values(DEFAULT_SCHEMA, "nsa", "mass").unwrap(),
        vec![None, None, Some("10.2".to_string())]
    );

    let current: Vec<String> = backend
        .find_catalogues(DEFAULT_SCHEMA, "nsa")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.current)
        .map(|r| r.version)
        .collect();
    assert_eq!(current, vec!["v2"]);
}

#[tokio::test]
async fn test_crossmatch_on_column() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nsa.csv", NSA_V1);
    let backend = MemoryBackend::new();
    load_targets(&backend, &["1-1", "1-3"]).await;

    let options = IngestOptions {
        match_source: Some(MatchSource::Column("MANGAID".to_string())),
        ..Default::default()
    };
    let report = ingest(&backend, &path, "v1", options).await.unwrap();

    let matching = report.matching.unwrap();
    assert_eq!(matching.join_table, "manga_target_to_nsa");
    assert_eq!(matching.links, 1);
    assert_eq!(matching.unmatched, 1);

    assert_eq!(
        backend.columns(DEFAULT_SCHEMA, "manga_target_to_nsa").unwrap(),
        vec!["pk", "manga_target_pk", "nsa_pk"]
    );
    assert_eq!(rows_of(&backend, "manga_target_to_nsa"), vec![text(&["1", "1", "1"])]);

    let record = &backend.catalogues(DEFAULT_SCHEMA)[0];
    assert!(record.matched);
    assert_eq!(
        record.match_description.as_deref(),
        Some("mangaid matched on column MANGAID")
    );
}

#[tokio::test]
async fn test_crossmatch_with_match_file_and_replace() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nsa.csv", NSA_V1);
    let match_file = write(&dir, "match.csv", "mangaid,nsaid\n1-1,200\n1-3,100\n");
    let description = write(&dir, "match.txt", "Matched on NSA id\n");
    let backend = MemoryBackend::new();
    load_targets(&backend, &["1-1", "1-3"]).await;

    let mut options = IngestOptions {
        match_source: Some(MatchSource::File {
            path: match_file,
            key_column: "nsaid".to_string(),
            description,
        }),
        ..Default::default()
    };
    let report = ingest(&backend, &path, "v1", options.clone()).await.unwrap();
    assert_eq!(report.matching.unwrap().links, 2);
    assert_eq!(
        rows_of(&backend, "manga_target_to_nsa"),
        vec![text(&["1", "1", "2"]), text(&["2", "2", "1"])]
    );
    assert_eq!(
        backend.catalogues(DEFAULT_SCHEMA)[0].match_description.as_deref(),
        Some("Matched on NSA id")
    );

    // Replacing the version drops the old links with the old rows
    options.replace = true;
    let report = ingest(&backend, &path, "v1", options).await.unwrap();
    assert_eq!(report.matching.unwrap().links, 2);
    assert_eq!(rows_of(&backend, "manga_target_to_nsa").len(), 2);
    assert_eq!(
        backend.column_values(DEFAULT_SCHEMA, "nsa", "pk").unwrap(),
        text(&["3", "4"])
    );
}

#[tokio::test]
async fn test_ingest_sanity_checks() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nsa.csv", NSA_V1);
    let backend = MemoryBackend::new();

    let missing = dir.path().join("missing.fits");
    let result = ingest(&backend, &missing, "v1", IngestOptions::default()).await;
    assert!(matches!(result, Err(SampleDbError::InvalidArgument(_))));

    let options = IngestOptions {
        match_source: Some(MatchSource::File {
            path: path.clone(),
            key_column: "nsaid".to_string(),
            description: path.clone(),
        }),
        ..Default::default()
    };
    let result = ingest(&backend, &path, "v1", options).await;
    assert!(matches!(result, Err(SampleDbError::InvalidArgument(_))));

    let result = ingest_catalogue(
        &backend,
        &path,
        "manga_target",
        "v1",
        &IngestOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(SampleDbError::InvalidArgument(_))));

    // Nothing was written by the failed calls
    assert!(backend.statements().is_empty());
}

#[tokio::test]
async fn test_bad_match_leaves_database_untouched() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nsa.csv", NSA_V1);
    let description = write(&dir, "match.txt", "Matched on NSA id\n");
    let no_key = write(&dir, "no_key.csv", "mangaid,plateifu\n1-1,7443-1901\n");
    let backend = MemoryBackend::new();

    let options = IngestOptions {
        match_source: Some(MatchSource::Column("plateifu".to_string())),
        ..Default::default()
    };
    let result = ingest(&backend, &path, "v1", options).await;
    assert!(matches!(result, Err(SampleDbError::InvalidArgument(_))));

    let options = IngestOptions {
        match_source: Some(MatchSource::File {
            path: no_key,
            key_column: "nsaid".to_string(),
            description,
        }),
        ..Default::default()
    };
    let result = ingest(&backend, &path, "v1", options).await;
    assert!(matches!(result, Err(SampleDbError::TableError(_))));

    assert!(backend.statements().is_empty());
    assert!(backend.catalogues(DEFAULT_SCHEMA).is_empty());

    // The same version loads once the match is fixed
    let options = IngestOptions {
        match_source: Some(MatchSource::Column("MANGAID".to_string())),
        ..Default::default()
    };
    let report = ingest(&backend, &path, "v1", options).await.unwrap();
    assert_eq!(report.rows, 2);
}

#[tokio::test]
async fn test_load_targets_skips_known_ids() {
    let backend = MemoryBackend::new();
    let targets = Table::new(vec![mangasampledb::Column::new(
        "MANGAID",
        mangasampledb::ColumnData::Str(vec!["1-1 ".into(), "1-2".into(), "1-1".into()]),
    )])
    .unwrap();
    let drpall = Table::new(vec![mangasampledb::Column::new(
        "mangaid",
        mangasampledb::ColumnData::Str(vec!["1-2".into(), "1-9".into()]),
    )])
    .unwrap();

    let report = load_manga_targets(&backend, DEFAULT_SCHEMA, &[(&targets, "mangaid")])
        .await
        .unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.duplicates, 1);

    let report = load_manga_targets(
        &backend,
        DEFAULT_SCHEMA,
        &[(&targets, "mangaid"), (&drpall, "mangaid")],
    )
    .await
    .unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.existing, 2);
    assert_eq!(
        backend
            .column_values(DEFAULT_SCHEMA, "manga_target", "mangaid")
            .unwrap(),
        text(&["1-1", "1-2", "1-9"])
    );
}

#[tokio::test]
async fn test_update_cube_manga_target_pk() {
    let backend = MemoryBackend::new();
    load_targets(&backend, &["1-1", "1-2"]).await;

    let cube = TableDef {
        schema: "mangadatadb".to_string(),
        name: "cube".to_string(),
        columns: vec![
            ColumnDef {
                name: "mangaid".to_string(),
                sql_type: SqlType::scalar(SqlBaseType::Varchar),
            },
            ColumnDef {
                name: "manga_target_pk".to_string(),
                sql_type: SqlType::scalar(SqlBaseType::Integer),
            },
        ],
        catalogue_fk: false,
    };
    backend.create_table(&cube).await.unwrap();
    backend
        .copy_rows(
            "mangadatadb",
            "cube",
            &["mangaid".to_string()],
            "1-2\n1-7\n1-1\n",
        )
        .await
        .unwrap();

    let report = update_cube_manga_target_pk(&backend, DEFAULT_SCHEMA)
        .await
        .unwrap();
    assert_eq!(report.updated, 2);
    assert_eq!(report.missing, vec!["1-7"]);
    assert_eq!(
        backend
            .column_values("mangadatadb", "cube", "manga_target_pk")
            .unwrap(),
        vec![Some("2".to_string()), None, Some("1".to_string())]
    );
}

#[tokio::test]
async fn test_table_to_db_from_file() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "drpall.txt",
        "| plateifu  | mangaid | nsa_z  |\n|-----------|---------|--------|\n| 7443-1901 | 1-1     | 0.02   |\n| 7443-1902 | 1-2     | --     |\n",
    );
    let table = Table::read(&path, None).unwrap();
    let backend = MemoryBackend::new();

    let options = LoadOptions {
        overwrite: false,
        chunk_size: 1,
    };
    let report = table_to_db(&backend, &table, "public", "drpall", options)
        .await
        .unwrap();
    assert_eq!(report.rows, 2);
    assert_eq!(report.chunks, 2);
    assert_eq!(
        backend.column_values("public", "drpall", "nsa_z").unwrap(),
        vec![Some("0.02".to_string()), None]
    );
    assert!(backend
        .statements()
        .iter()
        .any(|s| s.contains("\"nsa_z\" DOUBLE PRECISION")));
}
