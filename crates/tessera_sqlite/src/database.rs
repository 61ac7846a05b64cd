use std::path::Path;
use std::sync::Arc;

use tessera_core::column::Column;
use tessera_core::config::DEFAULT_BATCH_SIZE;
use tessera_core::dataset::DatasetRef;
use tessera_core::sql::{SqlDatabase, SqlDataset, SqlDialect, SqlIndex};
use tessera_core::stream::StreamRef;
use tessera_error::{EngineError, Result, ResultExt};
use tracing::debug;

use crate::client::SqliteClient;
use crate::dialect::SqliteDialect;
use crate::stream::SqliteStream;

#[derive(Debug)]
pub struct SqliteDatabase {
    client: SqliteClient,
    dialect: SqliteDialect,
    batch_size: usize,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::with_client(SqliteClient::open(path)?, DEFAULT_BATCH_SIZE)))
    }

    pub fn open_in_memory() -> Result<Arc<Self>> {
        Ok(Arc::new(Self::with_client(SqliteClient::open_in_memory()?, DEFAULT_BATCH_SIZE)))
    }

    pub fn with_client(client: SqliteClient, batch_size: usize) -> Self {
        SqliteDatabase {
            client,
            dialect: SqliteDialect,
            batch_size: batch_size.max(1),
        }
    }

    pub fn client(&self) -> &SqliteClient {
        &self.client
    }

    pub fn execute_batch(&self, sql: impl Into<String>) -> Result<()> {
        self.client.execute_batch(sql)
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        self.client.call(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .context("Failed to list tables")?;
            stmt.query_map([], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .context("Failed to list tables")
        })
    }

    /// Columns and usable indexes of `table`.
    pub fn describe_table(&self, table: &str) -> Result<(Vec<Column>, Vec<SqlIndex>)> {
        let table = table.to_string();
        self.client.call(move |conn| {
            let columns = {
                let mut stmt = conn
                    .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
                    .context("Failed to read table info")?;
                stmt.query_map([&table], |row| row.get::<_, String>(0))
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                    .context("Failed to read table info")?
            };
            if columns.is_empty() {
                return Err(EngineError::new("Missing table").with_field("table", &table));
            }

            let index_names = {
                let mut stmt = conn
                    .prepare("SELECT name FROM pragma_index_list(?1)")
                    .context("Failed to list indexes")?;
                stmt.query_map([&table], |row| row.get::<_, String>(0))
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                    .context("Failed to list indexes")?
            };

            let mut indexes = Vec::with_capacity(index_names.len());
            for name in index_names {
                let mut stmt = conn
                    .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
                    .context("Failed to read index info")?;
                let index_columns = stmt
                    .query_map([&name], |row| row.get::<_, Option<String>>(0))
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                    .context("Failed to read index info")?;
                // Expression indexes have no column name.
                let Some(index_columns) = index_columns.into_iter().collect::<Option<Vec<_>>>() else {
                    continue;
                };
                if index_columns.is_empty() {
                    continue;
                }
                indexes.push(SqlIndex {
                    name,
                    columns: index_columns.into_iter().map(Column::new).collect(),
                });
            }

            Ok((columns.into_iter().map(Column::new).collect(), indexes))
        })
    }

    /// Dataset over all rows of `table`.
    pub fn dataset(self: &Arc<Self>, table: &str) -> Result<DatasetRef> {
        let (columns, indexes) = self.describe_table(table)?;
        debug!(
            table,
            columns = columns.len(),
            indexes = indexes.len(),
            "opened sqlite table"
        );
        let database: Arc<dyn SqlDatabase> = self.clone();
        Ok(Arc::new(SqlDataset::new(database, table, columns, indexes)))
    }
}

impl SqlDatabase for SqliteDatabase {
    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    fn query(&self, sql: &str) -> StreamRef {
        Arc::new(SqliteStream::new(self.client.clone(), sql, self.batch_size))
    }
}
