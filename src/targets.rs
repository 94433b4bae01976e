//! Maintenance of the `manga_target` reference table

use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::copy::encode_values;
use crate::db::Backend;
use crate::loader::DEFAULT_CHUNK_SIZE;
use crate::schema::{qualified, TARGET_ID_COLUMN, TARGET_PK_COLUMN, TARGET_TABLE};
use crate::table::Table;
use crate::{Result, SampleDbError};

/// Schema of the data reduction tables
pub const DATA_SCHEMA: &str = "mangadatadb";
/// Table of data cubes in [`DATA_SCHEMA`]
pub const CUBE_TABLE: &str = "cube";

/// Outcome of [`load_manga_targets`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    /// Targets inserted
    pub inserted: u64,
    /// Repeated ids in the input
    pub duplicates: usize,
    /// Ids skipped because the table already had them
    pub existing: usize,
}

/// Outcome of [`update_cube_manga_target_pk`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CubeUpdateReport {
    pub updated: u64,
    /// Cubes whose mangaid has no target
    pub missing: Vec<String>,
}

/// Trimmed, non-null mangaids of `column` in `table`
fn collect_ids(table: &Table, column: &str) -> Result<Vec<String>> {
    let column = table
        .column(column)
        .ok_or_else(|| SampleDbError::TableError(format!("no column named {}", column)))?;
    Ok((0..column.len())
        .filter_map(|row| column.cell_text(row))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect())
}

/// Add the MaNGA ids found in `sources` to the target table
///
/// Each source is a table and the name of its mangaid column. Ids already
/// present in the database are not inserted again.
pub async fn load_manga_targets(
    backend: &dyn Backend,
    schema: &str,
    sources: &[(&Table, &str)],
) -> Result<TargetReport> {
    let mut ids = Vec::new();
    for (table, column) in sources {
        ids.extend(collect_ids(table, column)?);
    }

    let mut seen = HashSet::new();
    let unique: Vec<String> = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();
    let duplicates = ids.len() - unique.len();
    if duplicates > 0 {
        warn!(
            "There are {} repeated mangaids in the input. Duplicates will be removed.",
            duplicates
        );
    }

    backend.ensure_core_tables(schema).await?;
    let in_db: Vec<String> = backend
        .key_index(schema, TARGET_TABLE, TARGET_ID_COLUMN, None)
        .await?
        .into_iter()
        .filter_map(|row| row.key)
        .map(|id| id.trim().to_string())
        .collect();
    let in_db_set: HashSet<&String> = in_db.iter().collect();
    if in_db_set.len() != in_db.len() {
        warn!(
            "There are {} repeated mangaids in {}",
            in_db.len() - in_db_set.len(),
            qualified(schema, TARGET_TABLE)
        );
    }

    let new_ids: Vec<Vec<Option<String>>> = unique
        .iter()
        .filter(|id| !in_db_set.contains(id))
        .map(|id| vec![Some(id.clone())])
        .collect();
    let existing = unique.len() - new_ids.len();
    if existing > 0 {
        warn!("Not inserting {} targets already in the database", existing);
    }

    let columns = vec![TARGET_ID_COLUMN.to_string()];
    let mut inserted = 0;
    for chunk in new_ids.chunks(DEFAULT_CHUNK_SIZE) {
        let payload = encode_values(chunk.iter().map(Vec::as_slice));
        inserted += backend
            .copy_rows(schema, TARGET_TABLE, &columns, &payload)
            .await?;
    }
    info!("Inserted {} targets", inserted);

    Ok(TargetReport {
        inserted,
        duplicates,
        existing,
    })
}

/// Point every data cube at its MaNGA target
///
/// Sets `mangadatadb.cube.manga_target_pk` to the primary key of the target
/// with the same mangaid. Cubes without a target are left untouched.
pub async fn update_cube_manga_target_pk(
    backend: &dyn Backend,
    schema: &str,
) -> Result<CubeUpdateReport> {
    let mut targets: HashMap<String, i64> = HashMap::new();
    for row in backend
        .key_index(schema, TARGET_TABLE, TARGET_ID_COLUMN, None)
        .await?
    {
        if let Some(id) = row.key {
            // Rows come ordered by pk, so the first target wins
            targets.entry(id.trim().to_string()).or_insert(row.pk);
        }
    }

    let mut updates = Vec::new();
    let mut missing = Vec::new();
    for cube in backend
        .key_index(DATA_SCHEMA, CUBE_TABLE, TARGET_ID_COLUMN, None)
        .await?
    {
        let id = cube.key.as_deref().map(str::trim).unwrap_or_default();
        match targets.get(id) {
            Some(&target_pk) => updates.push((cube.pk, target_pk)),
            None => missing.push(id.to_string()),
        }
    }
    if !missing.is_empty() {
        warn!(
            "{} cubes have no MaNGA target: {}",
            missing.len(),
            missing.join(", ")
        );
    }

    let updated = backend
        .set_values(DATA_SCHEMA, CUBE_TABLE, TARGET_PK_COLUMN, &updates)
        .await?;
    info!(
        "Updated {} for {} rows of {}",
        TARGET_PK_COLUMN,
        updated,
        qualified(DATA_SCHEMA, CUBE_TABLE)
    );

    Ok(CubeUpdateReport { updated, missing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnData};

    #[test]
    fn test_collect_ids() {
        let table = Table::new(vec![Column::new(
            "MANGAID",
            ColumnData::Str(vec![" 1-1 ".into(), "".into(), "1-2".into()]),
        )
        .with_mask(vec![false, true, false])])
        .unwrap();
        assert_eq!(collect_ids(&table, "mangaid").unwrap(), vec!["1-1", "1-2"]);
        assert!(collect_ids(&table, "plateifu").is_err());
    }
}
