//! Linking catalogue rows to MaNGA targets
//!
//! Matches are stored in a `manga_target_to_<catalogue>` join table holding
//! pairs of target and catalogue primary keys. The relation is many-to-many:
//! a target may match several catalogue rows and the other way around.

use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::copy::encode_values;
use crate::db::{Backend, KeyRow, RowFilter};
use crate::schema::{
    join_key_column, join_table_name, CATALOGUE_PK_COLUMN, TARGET_ID_COLUMN, TARGET_PK_COLUMN,
    TARGET_TABLE,
};
use crate::table::Table;
use crate::{io_err, Result, SampleDbError};

/// How catalogue rows are matched to targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSource {
    /// A catalogue column holding MaNGA ids
    Column(String),
    /// A table file listing `mangaid` and a catalogue key per row
    File {
        path: PathBuf,
        /// Column present both in the file and in the catalogue
        key_column: String,
        /// Text file describing how the match was made
        description: PathBuf,
    },
}

impl MatchSource {
    /// Check that the files of a file match exist and are distinct
    pub fn check(&self) -> Result<()> {
        if let MatchSource::File {
            path, description, ..
        } = self
        {
            if !path.exists() {
                return Err(SampleDbError::InvalidArgument(format!(
                    "match file {} could not be found",
                    path.display()
                )));
            }
            if !description.exists() {
                return Err(SampleDbError::InvalidArgument(format!(
                    "match description {} could not be found",
                    description.display()
                )));
            }
            if path == description {
                return Err(SampleDbError::InvalidArgument(
                    "match file and match description cannot be identical".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Check that the match can be made against the rows of `catalogue`
    ///
    /// A column match needs the column in the catalogue. A file match needs
    /// the key column in the catalogue, and a readable match file holding
    /// both `mangaid` and the key column.
    pub fn validate(&self, catalogue: &Table) -> Result<()> {
        self.check()?;
        match self {
            MatchSource::Column(column) => {
                if catalogue.column(column).is_none() {
                    return Err(SampleDbError::InvalidArgument(format!(
                        "catalogue has no {} column to match on",
                        column
                    )));
                }
            }
            MatchSource::File {
                path, key_column, ..
            } => {
                if catalogue.column(key_column).is_none() {
                    return Err(SampleDbError::InvalidArgument(format!(
                        "catalogue has no {} column to match on",
                        key_column
                    )));
                }
                let matches = Table::read(path, None)?;
                for required in [TARGET_ID_COLUMN, key_column.as_str()] {
                    if matches.column(required).is_none() {
                        return Err(SampleDbError::TableError(format!(
                            "match file {} has no {} column",
                            path.display(),
                            required
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Text stored in the catalogue registry for this match
    pub fn description(&self) -> Result<String> {
        match self {
            MatchSource::Column(column) => {
                Ok(format!("{} matched on column {}", TARGET_ID_COLUMN, column))
            }
            MatchSource::File { description, .. } => Ok(fs::read_to_string(description)
                .map_err(|e| io_err(description, e))?
                .trim()
                .to_string()),
        }
    }
}

/// Outcome of a cross-match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    pub join_table: String,
    /// Rows written to the join table
    pub links: u64,
    /// Catalogue rows (or match file rows) without a target
    pub unmatched: usize,
    /// MaNGA ids present more than once in the target table
    pub duplicate_targets: usize,
}

/// Target primary keys by trimmed mangaid
async fn target_index(backend: &dyn Backend, schema: &str) -> Result<HashMap<String, Vec<i64>>> {
    let mut index: HashMap<String, Vec<i64>> = HashMap::new();
    for KeyRow { pk, key } in backend
        .key_index(schema, TARGET_TABLE, TARGET_ID_COLUMN, None)
        .await?
    {
        if let Some(mangaid) = key {
            index.entry(mangaid.trim().to_string()).or_default().push(pk);
        }
    }
    Ok(index)
}

/// Pairs of (target pk, catalogue pk) for a column match
fn pairs_from_column(
    rows: &[KeyRow],
    targets: &HashMap<String, Vec<i64>>,
) -> (Vec<(i64, i64)>, usize) {
    let mut pairs = Vec::new();
    let mut unmatched = 0;
    for row in rows {
        match row.key.as_deref().and_then(|k| targets.get(k.trim())) {
            Some(target_pks) => pairs.extend(target_pks.iter().map(|&t| (t, row.pk))),
            None => unmatched += 1,
        }
    }
    (pairs, unmatched)
}

/// Pairs of (target pk, catalogue pk) for a file match
fn pairs_from_file(
    matches: &Table,
    key_column: &str,
    rows: &[KeyRow],
    targets: &HashMap<String, Vec<i64>>,
) -> Result<(Vec<(i64, i64)>, usize)> {
    let mangaids = matches.column(TARGET_ID_COLUMN).ok_or_else(|| {
        SampleDbError::TableError(format!("match file has no {} column", TARGET_ID_COLUMN))
    })?;
    let keys = matches.column(key_column).ok_or_else(|| {
        SampleDbError::TableError(format!("match file has no {} column", key_column))
    })?;

    let mut catalogue: HashMap<String, Vec<i64>> = HashMap::new();
    for row in rows {
        if let Some(key) = &row.key {
            catalogue.entry(key.trim().to_string()).or_default().push(row.pk);
        }
    }

    let mut pairs = Vec::new();
    let mut unmatched = 0;
    for i in 0..matches.len() {
        let target_pks = mangaids
            .cell_text(i)
            .and_then(|id| targets.get(id.trim()));
        let catalogue_pks = keys.cell_text(i).and_then(|k| catalogue.get(k.trim()));
        match (target_pks, catalogue_pks) {
            (Some(target_pks), Some(catalogue_pks)) => {
                for &t in target_pks {
                    pairs.extend(catalogue_pks.iter().map(|&c| (t, c)));
                }
            }
            _ => unmatched += 1,
        }
    }
    Ok((pairs, unmatched))
}

/// Link the rows of one catalogue version to the MaNGA targets
pub async fn crossmatch(
    backend: &dyn Backend,
    schema: &str,
    catalogue: &str,
    catalogue_pk: i64,
    source: &MatchSource,
    chunk_size: usize,
) -> Result<MatchReport> {
    if chunk_size == 0 {
        return Err(SampleDbError::InvalidArgument(
            "chunk_size must be positive".to_string(),
        ));
    }

    let targets = target_index(backend, schema).await?;
    let duplicate_targets = targets.values().filter(|pks| pks.len() > 1).count();
    if duplicate_targets > 0 {
        warn!(
            "{} MaNGA ids appear more than once in {}",
            duplicate_targets, TARGET_TABLE
        );
    }

    let version = RowFilter::equals(CATALOGUE_PK_COLUMN, catalogue_pk);
    let (pairs, unmatched) = match source {
        MatchSource::Column(column) => {
            let rows = backend
                .key_index(schema, catalogue, &column.to_lowercase(), Some(&version))
                .await?;
            pairs_from_column(&rows, &targets)
        }
        MatchSource::File {
            path, key_column, ..
        } => {
            let matches = Table::read(path, None)?;
            let rows = backend
                .key_index(schema, catalogue, &key_column.to_lowercase(), Some(&version))
                .await?;
            pairs_from_file(&matches, key_column, &rows, &targets)?
        }
    };
    if unmatched > 0 {
        warn!("{} rows could not be matched to a MaNGA target", unmatched);
    }

    backend.create_join_table(schema, catalogue).await?;
    let join_table = join_table_name(catalogue);
    let columns = vec![TARGET_PK_COLUMN.to_string(), join_key_column(catalogue)];

    let mut links = 0;
    for chunk in pairs.chunks(chunk_size) {
        let rows: Vec<Vec<Option<String>>> = chunk
            .iter()
            .map(|(t, c)| vec![Some(t.to_string()), Some(c.to_string())])
            .collect();
        let payload = encode_values(rows.iter().map(Vec::as_slice));
        links += backend
            .copy_rows(schema, &join_table, &columns, &payload)
            .await?;
    }
    info!("Wrote {} links to {}", links, join_table);

    Ok(MatchReport {
        join_table,
        links,
        unmatched,
        duplicate_targets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnData};

    fn targets() -> HashMap<String, Vec<i64>> {
        HashMap::from([
            ("1-1".to_string(), vec![10]),
            ("1-2".to_string(), vec![20, 21]),
        ])
    }

    fn row(pk: i64, key: Option<&str>) -> KeyRow {
        KeyRow {
            pk,
            key: key.map(str::to_string),
        }
    }

    #[test]
    fn test_pairs_from_column() {
        let rows = vec![
            row(1, Some(" 1-1 ")),
            row(2, Some("1-2")),
            row(3, Some("1-9")),
            row(4, None),
        ];
        let (pairs, unmatched) = pairs_from_column(&rows, &targets());
        assert_eq!(pairs, vec![(10, 1), (20, 2), (21, 2)]);
        assert_eq!(unmatched, 2);
    }

    #[test]
    fn test_pairs_from_file() {
        let matches = Table::new(vec![
            Column::new(
                "mangaid",
                ColumnData::Str(vec!["1-1".into(), "1-1".into(), "1-7".into()]),
            ),
            Column::new("NSAID", ColumnData::Int64(vec![100, 200, 100])),
        ])
        .unwrap();
        let rows = vec![row(1, Some("100")), row(2, Some("200")), row(3, Some("100"))];

        let (pairs, unmatched) = pairs_from_file(&matches, "nsaid", &rows, &targets()).unwrap();
        assert_eq!(pairs, vec![(10, 1), (10, 3), (10, 2)]);
        assert_eq!(unmatched, 1);

        assert!(pairs_from_file(&matches, "plateifu", &rows, &targets()).is_err());
    }

    #[test]
    fn test_check_match_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("match.csv");
        let description = dir.path().join("match.txt");
        fs::write(&file, "mangaid,nsaid\n1-1,100\n").unwrap();

        let source = MatchSource::File {
            path: file.clone(),
            key_column: "nsaid".to_string(),
            description: description.clone(),
        };
        assert!(source.check().is_err());

        fs::write(&description, "Matched by hand\n").unwrap();
        source.check().unwrap();
        assert_eq!(source.description().unwrap(), "Matched by hand");

        let same = MatchSource::File {
            path: file.clone(),
            key_column: "nsaid".to_string(),
            description: file,
        };
        assert!(same.check().is_err());

        assert_eq!(
            MatchSource::Column("MANGAID".into()).description().unwrap(),
            "mangaid matched on column MANGAID"
        );
    }

    #[test]
    fn test_validate_against_catalogue() {
        let catalogue = Table::new(vec![
            Column::new("MANGAID", ColumnData::Str(vec!["1-1".into()])),
            Column::new("NSAID", ColumnData::Int64(vec![100])),
        ])
        .unwrap();

        MatchSource::Column("mangaid".into()).validate(&catalogue).unwrap();
        assert!(MatchSource::Column("plateifu".into())
            .validate(&catalogue)
            .is_err());

        let dir = tempfile::tempdir().unwrap();
        let description = dir.path().join("match.txt");
        fs::write(&description, "Matched by hand\n").unwrap();
        let good = dir.path().join("good.csv");
        fs::write(&good, "mangaid,nsaid\n1-1,100\n").unwrap();
        let missing_mangaid = dir.path().join("bad.csv");
        fs::write(&missing_mangaid, "plateifu,nsaid\n7443-1901,100\n").unwrap();

        let source = |path: &PathBuf, key: &str| MatchSource::File {
            path: path.clone(),
            key_column: key.to_string(),
            description: description.clone(),
        };
        source(&good, "nsaid").validate(&catalogue).unwrap();
        assert!(matches!(
            source(&good, "objid").validate(&catalogue),
            Err(SampleDbError::InvalidArgument(_))
        ));
        assert!(matches!(
            source(&missing_mangaid, "nsaid").validate(&catalogue),
            Err(SampleDbError::TableError(_))
        ));
    }
}
