//! PostgreSQL schema generation
//!
//! Maps table column types to PostgreSQL types and builds the DDL statements
//! used to create, extend and drop catalogue tables.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::table::{Column, DataType, Table};
use crate::{Result, SampleDbError};

/// Primary key column added to every table
pub const PK_COLUMN: &str = "pk";
/// Column linking catalogue rows to their registry entry
pub const CATALOGUE_PK_COLUMN: &str = "catalogue_pk";
/// Registry of ingested catalogue versions
pub const CATALOGUE_TABLE: &str = "catalogue";
/// Registry entries that are the current version of their catalogue
pub const CURRENT_CATALOGUE_TABLE: &str = "current_catalogue";
/// Reference table of MaNGA targets
pub const TARGET_TABLE: &str = "manga_target";
/// Identifier column of the target table
pub const TARGET_ID_COLUMN: &str = "mangaid";
/// Foreign key column pointing at the target table in join tables
pub const TARGET_PK_COLUMN: &str = "manga_target_pk";

/// Scalar PostgreSQL types used for catalogue columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SqlBaseType {
    SmallInt,
    Integer,
    BigInt,
    DoublePrecision,
    Boolean,
    Varchar,
}

impl SqlBaseType {
    /// SQL spelling of the type
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlBaseType::SmallInt => "SMALLINT",
            SqlBaseType::Integer => "INTEGER",
            SqlBaseType::BigInt => "BIGINT",
            SqlBaseType::DoublePrecision => "DOUBLE PRECISION",
            SqlBaseType::Boolean => "BOOLEAN",
            SqlBaseType::Varchar => "VARCHAR",
        }
    }
}

/// A PostgreSQL column type, possibly an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SqlType {
    pub base: SqlBaseType,
    /// Number of array dimensions (0 for scalars)
    pub dimensions: usize,
}

impl SqlType {
    /// A scalar type
    pub fn scalar(base: SqlBaseType) -> Self {
        Self {
            base,
            dimensions: 0,
        }
    }

    /// PostgreSQL type for a column of `dtype` whose cells have `shape`
    pub fn for_column(name: &str, dtype: DataType, shape: &[usize]) -> Result<Self> {
        let base = match dtype {
            DataType::UInt8 => SqlBaseType::SmallInt,
            DataType::Int16 | DataType::Int32 => SqlBaseType::Integer,
            DataType::Int64 => SqlBaseType::BigInt,
            DataType::Float32 | DataType::Float64 => SqlBaseType::DoublePrecision,
            DataType::Bool => SqlBaseType::Boolean,
            DataType::Str => SqlBaseType::Varchar,
        };

        if shape.len() > 2 {
            return Err(SampleDbError::UnsupportedColumn {
                column: name.to_string(),
                reason: format!(
                    "arrays with dimensionality larger than 2 are not supported (shape {:?})",
                    shape
                ),
            });
        }

        Ok(Self {
            base,
            dimensions: shape.len(),
        })
    }

    /// SQL spelling of the type, e.g. `INTEGER[][]`
    pub fn as_sql(&self) -> String {
        let mut sql = self.base.as_sql().to_string();
        for _ in 0..self.dimensions {
            sql.push_str("[]");
        }
        sql
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_sql())
    }
}

/// Double-quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualified, quoted table name
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// A column of a table to be created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnDef {
    /// Definition for a table column; the name is lowercased
    pub fn from_column(column: &Column) -> Result<Self> {
        Ok(Self {
            name: column.name.to_lowercase(),
            sql_type: SqlType::for_column(&column.name, column.dtype(), &column.shape)?,
        })
    }

    fn as_sql(&self) -> String {
        format!("{} {}", quote_ident(&self.name), self.sql_type)
    }
}

/// Column definitions for every column of a table, in file order
pub fn column_defs(table: &Table) -> Result<Vec<ColumnDef>> {
    table.columns().iter().map(ColumnDef::from_column).collect()
}

/// Definition of a table holding catalogue data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    /// Data columns, excluding `pk` and `catalogue_pk`
    pub columns: Vec<ColumnDef>,
    /// Whether rows carry a `catalogue_pk` foreign key into the registry
    pub catalogue_fk: bool,
}

impl TableDef {
    /// Build the definition matching `table`
    pub fn from_table(
        schema: &str,
        name: &str,
        table: &Table,
        with_catalogue_pk: bool,
    ) -> Result<Self> {
        let columns = column_defs(table)?;

        let mut reserved = HashSet::from([PK_COLUMN]);
        if with_catalogue_pk {
            reserved.insert(CATALOGUE_PK_COLUMN);
        }
        if let Some(clash) = columns.iter().find(|c| reserved.contains(c.name.as_str())) {
            return Err(SampleDbError::TableError(format!(
                "the table must not contain a column named {}",
                clash.name
            )));
        }

        Ok(Self {
            schema: schema.to_string(),
            name: name.to_lowercase(),
            columns,
            catalogue_fk: with_catalogue_pk,
        })
    }

    /// Column names in the order `COPY` rows are encoded
    pub fn copy_columns(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.columns.len() + 1);
        if self.catalogue_fk {
            names.push(CATALOGUE_PK_COLUMN.to_string());
        }
        names.extend(self.columns.iter().map(|c| c.name.clone()));
        names
    }

    /// `CREATE TABLE` statement for this definition
    pub fn create_sql(&self) -> String {
        let mut parts = vec![format!("{} SERIAL PRIMARY KEY", quote_ident(PK_COLUMN))];
        parts.extend(self.columns.iter().map(ColumnDef::as_sql));
        if self.catalogue_fk {
            parts.push(format!(
                "{} INTEGER REFERENCES {} ({}) ON DELETE CASCADE",
                quote_ident(CATALOGUE_PK_COLUMN),
                qualified(&self.schema, CATALOGUE_TABLE),
                quote_ident(PK_COLUMN)
            ));
        }
        format!(
            "CREATE TABLE {} ({})",
            qualified(&self.schema, &self.name),
            parts.join(", ")
        )
    }
}

/// `ALTER TABLE` statement adding `columns`
pub fn add_columns_sql(schema: &str, table: &str, columns: &[ColumnDef]) -> String {
    let additions: Vec<String> = columns
        .iter()
        .map(|c| format!("ADD COLUMN {}", c.as_sql()))
        .collect();
    format!(
        "ALTER TABLE {} {}",
        qualified(schema, table),
        additions.join(", ")
    )
}

/// `DROP TABLE` statement, cascading to dependent objects
pub fn drop_table_sql(schema: &str, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {} CASCADE", qualified(schema, table))
}

/// Name of the join table between the targets and a catalogue
pub fn join_table_name(catalogue: &str) -> String {
    format!("{}_to_{}", TARGET_TABLE, catalogue)
}

/// Column of a join table pointing at the catalogue
pub fn join_key_column(catalogue: &str) -> String {
    format!("{}_pk", catalogue)
}

/// `CREATE TABLE` statement for the join table of a catalogue
pub fn create_join_table_sql(schema: &str, catalogue: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {join} ({pk} SERIAL PRIMARY KEY, \
         {target_pk} INTEGER NOT NULL REFERENCES {targets} ({pk}) ON DELETE CASCADE, \
         {catalogue_pk} INTEGER NOT NULL REFERENCES {catalogue} ({pk}) ON DELETE CASCADE)",
        join = qualified(schema, &join_table_name(catalogue)),
        pk = quote_ident(PK_COLUMN),
        target_pk = quote_ident(TARGET_PK_COLUMN),
        targets = qualified(schema, TARGET_TABLE),
        catalogue_pk = quote_ident(&join_key_column(catalogue)),
        catalogue = qualified(schema, catalogue),
    )
}

/// Statements creating the schema, the catalogue registry and the target table
pub fn core_tables_sql(schema: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"pk\" SERIAL PRIMARY KEY, \
             \"catalogue_name\" VARCHAR NOT NULL, \"version\" VARCHAR NOT NULL, \
             \"matched\" BOOLEAN NOT NULL DEFAULT FALSE, \"match_description\" TEXT, \
             \"checksum\" VARCHAR, UNIQUE (\"catalogue_name\", \"version\"))",
            qualified(schema, CATALOGUE_TABLE)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"pk\" SERIAL PRIMARY KEY, \
             \"catalogue_pk\" INTEGER NOT NULL UNIQUE REFERENCES {} (\"pk\") ON DELETE CASCADE)",
            qualified(schema, CURRENT_CATALOGUE_TABLE),
            qualified(schema, CATALOGUE_TABLE)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"pk\" SERIAL PRIMARY KEY, \"mangaid\" VARCHAR NOT NULL)",
            qualified(schema, TARGET_TABLE)
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnData;
    use rstest::rstest;

    #[rstest]
    #[case(DataType::UInt8, vec![], "SMALLINT")]
    #[case(DataType::Int16, vec![], "INTEGER")]
    #[case(DataType::Int32, vec![], "INTEGER")]
    #[case(DataType::Int64, vec![], "BIGINT")]
    #[case(DataType::Float32, vec![], "DOUBLE PRECISION")]
    #[case(DataType::Float64, vec![5], "DOUBLE PRECISION[]")]
    #[case(DataType::Str, vec![], "VARCHAR")]
    #[case(DataType::Bool, vec![], "BOOLEAN")]
    #[case(DataType::Int32, vec![4, 4], "INTEGER[][]")]
    fn test_type_mapping(#[case] dtype: DataType, #[case] shape: Vec<usize>, #[case] sql: &str) {
        let sql_type = SqlType::for_column("col", dtype, &shape).unwrap();
        assert_eq!(sql_type.as_sql(), sql);
    }

    #[test]
    fn test_three_dimensional_arrays_rejected() {
        let result = SqlType::for_column("cube", DataType::Float32, &[2, 3, 4]);
        match result {
            Err(SampleDbError::UnsupportedColumn { column, .. }) => assert_eq!(column, "cube"),
            other => panic!("Expected UnsupportedColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("dec"), "\"dec\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("mangasampledb", "nsa"), "\"mangasampledb\".\"nsa\"");
    }

    fn nsa_table() -> Table {
        Table::new(vec![
            Column::new("NSAID", ColumnData::Int32(vec![1, 2])),
            Column::new("Z", ColumnData::Float64(vec![0.1, 0.2])),
            Column::new("SERSIC_FLUX", ColumnData::Float32(vec![0.0; 14])).with_shape(vec![7]),
        ])
        .unwrap()
    }

    #[test]
    fn test_create_table_sql() {
        let def = TableDef::from_table("mangasampledb", "NSA", &nsa_table(), true).unwrap();
        assert_eq!(def.name, "nsa");
        assert_eq!(
            def.create_sql(),
            "CREATE TABLE \"mangasampledb\".\"nsa\" (\"pk\" SERIAL PRIMARY KEY, \
             \"nsaid\" INTEGER, \"z\" DOUBLE PRECISION, \"sersic_flux\" DOUBLE PRECISION[], \
             \"catalogue_pk\" INTEGER REFERENCES \"mangasampledb\".\"catalogue\" (\"pk\") ON DELETE CASCADE)"
        );
        assert_eq!(
            def.copy_columns(),
            vec!["catalogue_pk", "nsaid", "z", "sersic_flux"]
        );
    }

    #[test]
    fn test_plain_table_has_no_catalogue_pk() {
        let def = TableDef::from_table("public", "nsa", &nsa_table(), false).unwrap();
        assert!(!def.create_sql().contains("catalogue_pk"));
        assert_eq!(def.copy_columns(), vec!["nsaid", "z", "sersic_flux"]);
    }

    #[test]
    fn test_reserved_column_names() {
        let table = Table::new(vec![Column::new("PK", ColumnData::Int64(vec![1]))]).unwrap();
        assert!(TableDef::from_table("s", "t", &table, false).is_err());

        let table =
            Table::new(vec![Column::new("catalogue_pk", ColumnData::Int64(vec![1]))]).unwrap();
        assert!(TableDef::from_table("s", "t", &table, false).is_ok());
        assert!(TableDef::from_table("s", "t", &table, true).is_err());
    }

    #[test]
    fn test_alter_and_drop_sql() {
        let columns = vec![ColumnDef {
            name: "elpetro_mass".to_string(),
            sql_type: SqlType::scalar(SqlBaseType::DoublePrecision),
        }];
        assert_eq!(
            add_columns_sql("mangasampledb", "nsa", &columns),
            "ALTER TABLE \"mangasampledb\".\"nsa\" ADD COLUMN \"elpetro_mass\" DOUBLE PRECISION"
        );
        assert_eq!(
            drop_table_sql("mangasampledb", "nsa"),
            "DROP TABLE IF EXISTS \"mangasampledb\".\"nsa\" CASCADE"
        );
    }

    #[test]
    fn test_join_table_sql() {
        assert_eq!(join_table_name("nsa"), "manga_target_to_nsa");
        let sql = create_join_table_sql("mangasampledb", "nsa");
        assert!(sql.starts_with(
            "CREATE TABLE IF NOT EXISTS \"mangasampledb\".\"manga_target_to_nsa\""
        ));
        assert!(sql.contains("\"manga_target_pk\" INTEGER NOT NULL REFERENCES \"mangasampledb\".\"manga_target\""));
        assert!(sql.contains("\"nsa_pk\" INTEGER NOT NULL REFERENCES \"mangasampledb\".\"nsa\""));
    }

    #[test]
    fn test_core_tables_sql() {
        let statements = core_tables_sql("mangasampledb");
        assert_eq!(statements.len(), 4);
        assert!(statements[0].starts_with("CREATE SCHEMA IF NOT EXISTS"));
        assert!(statements.iter().skip(1).all(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")));
    }
}
