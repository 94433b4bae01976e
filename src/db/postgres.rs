//! PostgreSQL backend built on sqlx

use async_trait::async_trait;
use log::debug;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{
    clear_current_sql, copy_statement, delete_rows_sql, insert_current_sql, register_catalogue_sql,
    set_values_sql, update_catalogue_sql, Backend, CatalogueRecord, KeyRow, NewCatalogue,
    RowFilter,
};
use crate::config::ConnectionParams;
use crate::schema::{
    add_columns_sql, core_tables_sql, create_join_table_sql, drop_table_sql, qualified,
    quote_ident, ColumnDef, TableDef, CATALOGUE_TABLE, CURRENT_CATALOGUE_TABLE, PK_COLUMN,
};
use crate::Result;

/// Backend writing to a PostgreSQL database
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect using the given parameters
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        debug!("Connecting to {}", params.describe());
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(params.connect_options()?)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        debug!("{}", sql);
        Ok(sqlx::query(sql).execute(&self.pool).await?.rows_affected())
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn ensure_core_tables(&self, schema: &str) -> Result<()> {
        for statement in core_tables_sql(schema) {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    async fn table_names(&self, schema: &str) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn column_names(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn create_table(&self, table: &TableDef) -> Result<()> {
        self.execute(&table.create_sql()).await?;
        Ok(())
    }

    async fn add_columns(&self, schema: &str, table: &str, columns: &[ColumnDef]) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        self.execute(&add_columns_sql(schema, table, columns)).await?;
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        self.execute(&drop_table_sql(schema, table)).await?;
        Ok(())
    }

    async fn create_join_table(&self, schema: &str, catalogue: &str) -> Result<()> {
        self.execute(&create_join_table_sql(schema, catalogue))
            .await?;
        Ok(())
    }

    async fn copy_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        payload: &str,
    ) -> Result<u64> {
        let statement = copy_statement(schema, table, columns);
        debug!("{}", statement);

        let mut tx = self.pool.begin().await?;
        let mut copy = tx.copy_in_raw(&statement).await?;
        copy.send(payload.as_bytes()).await?;
        let rows = copy.finish().await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn key_index(
        &self,
        schema: &str,
        table: &str,
        key_column: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<KeyRow>> {
        let mut sql = format!(
            "SELECT {pk}::bigint, {key}::text FROM {table}",
            pk = quote_ident(PK_COLUMN),
            key = quote_ident(key_column),
            table = qualified(schema, table)
        );
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.as_sql());
        }
        sql.push_str(&format!(" ORDER BY {}", quote_ident(PK_COLUMN)));
        debug!("{}", sql);

        let query = sqlx::query_as::<_, (i64, Option<String>)>(&sql);
        let rows = match filter {
            None => query.fetch_all(&self.pool).await?,
            Some(RowFilter::Equals { value, .. }) => query.bind(*value).fetch_all(&self.pool).await?,
            Some(RowFilter::In { values, .. }) => query.bind(values).fetch_all(&self.pool).await?,
        };
        Ok(rows
            .into_iter()
            .map(|(pk, key)| KeyRow { pk, key })
            .collect())
    }

    async fn delete_rows(&self, schema: &str, table: &str, filter: &RowFilter) -> Result<u64> {
        let sql = delete_rows_sql(schema, table, filter);
        debug!("{}", sql);

        let query = sqlx::query(&sql);
        let result = match filter {
            RowFilter::Equals { value, .. } => query.bind(*value).execute(&self.pool).await?,
            RowFilter::In { values, .. } => query.bind(values).execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn set_values(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        updates: &[(i64, i64)],
    ) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let sql = set_values_sql(schema, table, column);
        debug!("{}", sql);

        let (pks, values): (Vec<i64>, Vec<i64>) = updates.iter().copied().unzip();
        let result = sqlx::query(&sql)
            .bind(pks)
            .bind(values)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_catalogues(&self, schema: &str, name: &str) -> Result<Vec<CatalogueRecord>> {
        let sql = format!(
            "SELECT c.pk::bigint AS pk, c.catalogue_name, c.version, c.matched, \
             c.match_description, c.checksum, (cc.pk IS NOT NULL) AS current \
             FROM {catalogue} c LEFT JOIN {current} cc ON cc.catalogue_pk = c.pk \
             WHERE c.catalogue_name = $1 ORDER BY c.pk",
            catalogue = qualified(schema, CATALOGUE_TABLE),
            current = qualified(schema, CURRENT_CATALOGUE_TABLE)
        );
        let records = sqlx::query_as::<_, CatalogueRecord>(&sql)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn register_catalogue(&self, schema: &str, entry: &NewCatalogue) -> Result<i64> {
        let sql = register_catalogue_sql(schema);
        debug!("{}", sql);
        let pk = sqlx::query_scalar::<_, i64>(&sql)
            .bind(&entry.name)
            .bind(&entry.version)
            .bind(entry.matched)
            .bind(&entry.match_description)
            .bind(&entry.checksum)
            .fetch_one(&self.pool)
            .await?;
        Ok(pk)
    }

    async fn update_catalogue(&self, schema: &str, pk: i64, entry: &NewCatalogue) -> Result<()> {
        let sql = update_catalogue_sql(schema);
        debug!("{}", sql);
        sqlx::query(&sql)
            .bind(pk)
            .bind(entry.matched)
            .bind(&entry.match_description)
            .bind(&entry.checksum)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_current(&self, schema: &str, name: &str, catalogue_pk: i64) -> Result<()> {
        let clear = clear_current_sql(schema);
        let insert = insert_current_sql(schema);
        debug!("{}", clear);
        debug!("{}", insert);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&clear).bind(name).execute(&mut *tx).await?;
        sqlx::query(&insert)
            .bind(catalogue_pk as i32)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
