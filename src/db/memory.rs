//! In-memory backend
//!
//! Keeps every table as rows of text values, exactly what a `COPY` payload
//! carries. Primary keys are assigned the way a `SERIAL` column would assign
//! them. The SQL each call stands for is logged so dry runs can print it.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{
    bigint_array_literal, clear_current_sql, copy_statement, delete_rows_sql, inline_params,
    insert_current_sql, register_catalogue_sql, set_values_sql, text_literal,
    update_catalogue_sql, Backend, CatalogueRecord, KeyRow, NewCatalogue, RowFilter,
};
use crate::copy::decode_line;
use crate::schema::{
    add_columns_sql, core_tables_sql, create_join_table_sql, drop_table_sql, join_key_column,
    join_table_name, qualified, ColumnDef, TableDef, CATALOGUE_PK_COLUMN, CATALOGUE_TABLE,
    CURRENT_CATALOGUE_TABLE, PK_COLUMN, TARGET_ID_COLUMN, TARGET_PK_COLUMN, TARGET_TABLE,
};
use crate::{Result, SampleDbError};

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    next_pk: i64,
}

impl MemoryTable {
    fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            next_pk: 1,
        }
    }

    fn column_index(&self, table: &str, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| {
                SampleDbError::TableError(format!(
                    "column {} of relation {} does not exist",
                    column, table
                ))
            })
    }

    fn pk_of(row: &[Option<String>]) -> Option<i64> {
        row.first()
            .and_then(|pk| pk.as_deref())
            .and_then(|pk| pk.parse().ok())
    }

    /// Rows passing `filter`, reading the filtered column as an integer
    fn selected(&self, table: &str, filter: Option<&RowFilter>) -> Result<Vec<bool>> {
        let Some(filter) = filter else {
            return Ok(vec![true; self.rows.len()]);
        };
        let index = self.column_index(table, filter.column())?;
        Ok(self
            .rows
            .iter()
            .map(|row| {
                row[index]
                    .as_deref()
                    .and_then(|v| v.parse::<i64>().ok())
                    .map_or(false, |v| filter.matches(v))
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<(String, String), MemoryTable>,
    catalogues: BTreeMap<String, Vec<CatalogueRecord>>,
    statements: Vec<String>,
}

impl State {
    fn table(&self, schema: &str, table: &str) -> Result<&MemoryTable> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| missing_relation(schema, table))
    }

    fn table_mut(&mut self, schema: &str, table: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| missing_relation(schema, table))
    }

    fn create(&mut self, schema: &str, table: &str, columns: Vec<String>) -> Result<()> {
        let key = (schema.to_string(), table.to_string());
        if self.tables.contains_key(&key) {
            return Err(SampleDbError::TableError(format!(
                "relation {} already exists",
                qualified(schema, table)
            )));
        }
        self.tables.insert(key, MemoryTable::new(columns));
        Ok(())
    }

    fn create_if_missing(&mut self, schema: &str, table: &str, columns: &[&str]) {
        self.tables
            .entry((schema.to_string(), table.to_string()))
            .or_insert_with(|| MemoryTable::new(columns.iter().map(|c| c.to_string()).collect()));
    }
}

fn missing_relation(schema: &str, table: &str) -> SampleDbError {
    SampleDbError::TableError(format!(
        "relation {} does not exist",
        qualified(schema, table)
    ))
}

/// Backend holding all tables in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the state usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// SQL statements issued so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Column names of a table, including `pk`
    pub fn columns(&self, schema: &str, table: &str) -> Option<Vec<String>> {
        self.lock()
            .table(schema, table)
            .ok()
            .map(|t| t.columns.clone())
    }

    /// All rows of a table, values as text
    pub fn rows(&self, schema: &str, table: &str) -> Option<Vec<Vec<Option<String>>>> {
        self.lock().table(schema, table).ok().map(|t| t.rows.clone())
    }

    /// Values of one column of a table
    pub fn column_values(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Option<Vec<Option<String>>> {
        let state = self.lock();
        let table_data = state.table(schema, table).ok()?;
        let index = table_data.columns.iter().position(|c| c == column)?;
        Some(table_data.rows.iter().map(|row| row[index].clone()).collect())
    }

    /// Every registry entry of a schema
    pub fn catalogues(&self, schema: &str) -> Vec<CatalogueRecord> {
        self.lock()
            .catalogues
            .get(schema)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ensure_core_tables(&self, schema: &str) -> Result<()> {
        let mut state = self.lock();
        state.statements.extend(core_tables_sql(schema));
        state.create_if_missing(
            schema,
            CATALOGUE_TABLE,
            &[
                PK_COLUMN,
                "catalogue_name",
                "version",
                "matched",
                "match_description",
                "checksum",
            ],
        );
        state.create_if_missing(schema, CURRENT_CATALOGUE_TABLE, &[PK_COLUMN, "catalogue_pk"]);
        state.create_if_missing(schema, TARGET_TABLE, &[PK_COLUMN, TARGET_ID_COLUMN]);
        state.catalogues.entry(schema.to_string()).or_default();
        Ok(())
    }

    async fn table_names(&self, schema: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .tables
            .keys()
            .filter(|(s, _)| s == schema)
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn column_names(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        Ok(self.lock().table(schema, table)?.columns.clone())
    }

    async fn create_table(&self, table: &TableDef) -> Result<()> {
        let mut state = self.lock();
        let mut columns = vec![PK_COLUMN.to_string()];
        columns.extend(table.columns.iter().map(|c| c.name.clone()));
        if table.catalogue_fk {
            columns.push(CATALOGUE_PK_COLUMN.to_string());
        }
        state.create(&table.schema, &table.name, columns)?;
        state.statements.push(table.create_sql());
        Ok(())
    }

    async fn add_columns(&self, schema: &str, table: &str, columns: &[ColumnDef]) -> Result<()> {
        let mut state = self.lock();
        let target = state.table_mut(schema, table)?;
        for column in columns {
            if target.columns.contains(&column.name) {
                return Err(SampleDbError::TableError(format!(
                    "column {} of relation {} already exists",
                    column.name, table
                )));
            }
        }
        for column in columns {
            target.columns.push(column.name.clone());
            for row in target.rows.iter_mut() {
                row.push(None);
            }
        }
        state.statements.push(add_columns_sql(schema, table, columns));
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let mut state = self.lock();
        state.tables.remove(&(schema.to_string(), table.to_string()));
        state.statements.push(drop_table_sql(schema, table));
        Ok(())
    }

    async fn create_join_table(&self, schema: &str, catalogue: &str) -> Result<()> {
        let mut state = self.lock();
        state.table(schema, catalogue)?;
        let key_column = join_key_column(catalogue);
        state.create_if_missing(
            schema,
            &join_table_name(catalogue),
            &[PK_COLUMN, TARGET_PK_COLUMN, &key_column],
        );
        state
            .statements
            .push(create_join_table_sql(schema, catalogue));
        Ok(())
    }

    async fn copy_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        payload: &str,
    ) -> Result<u64> {
        let mut state = self.lock();
        let target = state.table_mut(schema, table)?;
        let indices = columns
            .iter()
            .map(|c| target.column_index(table, c))
            .collect::<Result<Vec<usize>>>()?;
        let explicit_pk = columns.iter().any(|c| c == PK_COLUMN);

        // Decode everything first so a bad line loads nothing
        let mut new_rows = Vec::new();
        for (number, line) in payload.lines().enumerate() {
            let fields = decode_line(line)?;
            if fields.len() != indices.len() {
                return Err(SampleDbError::CopyFormat(format!(
                    "line {} has {} fields, expected {}",
                    number + 1,
                    fields.len(),
                    indices.len()
                )));
            }
            let mut row = vec![None; target.columns.len()];
            for (&index, value) in indices.iter().zip(fields) {
                row[index] = value;
            }
            new_rows.push(row);
        }

        let count = new_rows.len() as u64;
        for mut row in new_rows {
            if explicit_pk {
                if let Some(pk) = MemoryTable::pk_of(&row) {
                    target.next_pk = target.next_pk.max(pk + 1);
                }
            } else {
                row[0] = Some(target.next_pk.to_string());
                target.next_pk += 1;
            }
            target.rows.push(row);
        }

        state
            .statements
            .push(format!("{} -- {} rows", copy_statement(schema, table, columns), count));
        Ok(count)
    }

    async fn key_index(
        &self,
        schema: &str,
        table: &str,
        key_column: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<KeyRow>> {
        let state = self.lock();
        let source = state.table(schema, table)?;
        let key = source.column_index(table, key_column)?;
        let selected = source.selected(table, filter)?;

        let mut rows: Vec<KeyRow> = source
            .rows
            .iter()
            .zip(selected)
            .filter(|(_, keep)| *keep)
            .filter_map(|(row, _)| {
                MemoryTable::pk_of(row).map(|pk| KeyRow {
                    pk,
                    key: row[key].clone(),
                })
            })
            .collect();
        rows.sort_by_key(|row| row.pk);
        Ok(rows)
    }

    async fn delete_rows(&self, schema: &str, table: &str, filter: &RowFilter) -> Result<u64> {
        let mut state = self.lock();
        let target = state.table_mut(schema, table)?;
        let selected = target.selected(table, Some(filter))?;

        let before = target.rows.len();
        let mut keep = selected.into_iter().map(|s| !s);
        target.rows.retain(|_| keep.next().unwrap_or(true));
        let deleted = (before - target.rows.len()) as u64;

        state.statements.push(inline_params(
            &delete_rows_sql(schema, table, filter),
            &[filter.param_literal()],
        ));
        Ok(deleted)
    }

    async fn set_values(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        updates: &[(i64, i64)],
    ) -> Result<u64> {
        let mut state = self.lock();
        let target = state.table_mut(schema, table)?;
        let index = target.column_index(table, column)?;
        let values: BTreeMap<i64, i64> = updates.iter().copied().collect();

        let mut updated = 0;
        for row in target.rows.iter_mut() {
            if let Some(value) = MemoryTable::pk_of(row).and_then(|pk| values.get(&pk)) {
                row[index] = Some(value.to_string());
                updated += 1;
            }
        }

        let (pks, values): (Vec<i64>, Vec<i64>) = updates.iter().copied().unzip();
        state.statements.push(inline_params(
            &set_values_sql(schema, table, column),
            &[bigint_array_literal(&pks), bigint_array_literal(&values)],
        ));
        Ok(updated)
    }

    async fn find_catalogues(&self, schema: &str, name: &str) -> Result<Vec<CatalogueRecord>> {
        Ok(self
            .lock()
            .catalogues
            .get(schema)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.catalogue_name == name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn register_catalogue(&self, schema: &str, entry: &NewCatalogue) -> Result<i64> {
        let mut state = self.lock();
        let entries = state.catalogues.entry(schema.to_string()).or_default();
        if entries
            .iter()
            .any(|e| e.catalogue_name == entry.name && e.version == entry.version)
        {
            return Err(SampleDbError::CatalogueExists {
                name: entry.name.clone(),
                version: entry.version.clone(),
            });
        }

        let pk = entries.iter().map(|e| e.pk).max().unwrap_or(0) + 1;
        entries.push(CatalogueRecord {
            pk,
            catalogue_name: entry.name.clone(),
            version: entry.version.clone(),
            matched: entry.matched,
            match_description: entry.match_description.clone(),
            checksum: entry.checksum.clone(),
            current: false,
        });
        state.statements.push(inline_params(
            &register_catalogue_sql(schema),
            &[
                text_literal(Some(entry.name.as_str())),
                text_literal(Some(entry.version.as_str())),
                entry.matched.to_string(),
                text_literal(entry.match_description.as_deref()),
                text_literal(entry.checksum.as_deref()),
            ],
        ));
        Ok(pk)
    }

    async fn update_catalogue(&self, schema: &str, pk: i64, entry: &NewCatalogue) -> Result<()> {
        let mut state = self.lock();
        let record = state
            .catalogues
            .get_mut(schema)
            .and_then(|entries| entries.iter_mut().find(|e| e.pk == pk))
            .ok_or_else(|| {
                SampleDbError::InvalidArgument(format!("no catalogue with pk {}", pk))
            })?;
        record.matched = entry.matched;
        record.match_description = entry.match_description.clone();
        record.checksum = entry.checksum.clone();
        state.statements.push(inline_params(
            &update_catalogue_sql(schema),
            &[
                pk.to_string(),
                entry.matched.to_string(),
                text_literal(entry.match_description.as_deref()),
                text_literal(entry.checksum.as_deref()),
            ],
        ));
        Ok(())
    }

    async fn mark_current(&self, schema: &str, name: &str, catalogue_pk: i64) -> Result<()> {
        let mut state = self.lock();
        let entries = state.catalogues.entry(schema.to_string()).or_default();
        if !entries.iter().any(|e| e.pk == catalogue_pk) {
            return Err(SampleDbError::InvalidArgument(format!(
                "no catalogue with pk {}",
                catalogue_pk
            )));
        }
        for entry in entries.iter_mut().filter(|e| e.catalogue_name == name) {
            entry.current = entry.pk == catalogue_pk;
        }
        state.statements.push(inline_params(
            &clear_current_sql(schema),
            &[text_literal(Some(name))],
        ));
        state
            .statements
            .push(inline_params(&insert_current_sql(schema), &[catalogue_pk.to_string()]));
        Ok(())
    }
}
