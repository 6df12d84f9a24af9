// ABOUTME: PgStore - PostgreSQL staging tables and the _config key-value table
// ABOUTME: Values travel as text and are cast to the live column type on write

use super::{KvStore, RowFilter, RowValues, StagedRecord, TargetStore};
use crate::error::{Result, SyncError};
use crate::schema::{ColumnSpec, DdlStatement, LiveTable, TableSchema};
use crate::utils::{qualified, quote_ident};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

/// Table holding cursors and schemas.
pub const KV_TABLE: &str = "_config";

// PostgreSQL has a limit of ~65535 parameters per query
const MAX_PARAMS: usize = 65000;

/// Schema of the key-value table, applied by `setup` like any other table.
pub fn kv_table_schema() -> TableSchema {
    TableSchema::new(
        KV_TABLE,
        vec![
            ColumnSpec {
                not_null: true,
                primary_key: true,
                default_sequence: true,
                ..ColumnSpec::local("id", "integer")
            },
            ColumnSpec {
                not_null: true,
                create_unique_index: true,
                ..ColumnSpec::local("key", "varchar(255)")
            },
            ColumnSpec::local("value", "text"),
            ColumnSpec {
                default_now: true,
                ..ColumnSpec::local("update_timestamp", "timestamp")
            },
        ],
    )
}

fn db_error(err: tokio_postgres::Error, context: String) -> SyncError {
    SyncError::transport(anyhow::Error::new(err).context(context))
}

/// Target and key-value store over a single PostgreSQL connection.
///
/// Live column types are cached per table so writes can cast text values
/// without re-reading the catalog. DDL through [`TargetStore::execute_ddl`]
/// drops the affected table from the cache.
pub struct PgStore {
    client: Client,
    schema: String,
    column_types: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl PgStore {
    pub fn new(client: Client, schema: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
            column_types: Mutex::new(HashMap::new()),
        }
    }

    /// Get a reference to the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn cached_types(&self, table: &str) -> Option<HashMap<String, String>> {
        self.column_types
            .lock()
            .ok()
            .and_then(|cache| cache.get(table).cloned())
    }

    fn invalidate(&self, table: &str) {
        if let Ok(mut cache) = self.column_types.lock() {
            cache.remove(table);
        }
    }

    async fn load_columns(&self, table: &str) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname, format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2
                   AND a.attnum > 0 AND NOT a.attisdropped",
                &[&self.schema, &table],
            )
            .await
            .map_err(|e| db_error(e, format!("Failed to get columns for {}.{}", self.schema, table)))?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    /// Live column types for `table`, loaded once and then cached.
    async fn column_types(&self, table: &str) -> Result<HashMap<String, String>> {
        if let Some(types) = self.cached_types(table) {
            return Ok(types);
        }
        let types = self.load_columns(table).await?;
        if types.is_empty() {
            return Err(SyncError::configuration(format!(
                "Table {}.{} does not exist; run sync-tables first",
                self.schema, table
            )));
        }
        if let Ok(mut cache) = self.column_types.lock() {
            cache.insert(table.to_string(), types.clone());
        }
        Ok(types)
    }

    async fn typed_columns(&self, table: &str, columns: &[String]) -> Result<Vec<(String, String)>> {
        let types = self.column_types(table).await?;
        columns
            .iter()
            .map(|c| {
                types
                    .get(c)
                    .map(|t| (c.clone(), t.clone()))
                    .ok_or_else(|| {
                        SyncError::configuration(format!(
                            "Column {} does not exist in {}.{}",
                            c, self.schema, table
                        ))
                    })
            })
            .collect()
    }

    async fn names(&self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(query, params)
            .await
            .map_err(|e| db_error(e, format!("Failed to inspect schema {}", self.schema)))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

#[async_trait]
impl TargetStore for PgStore {
    fn schema_name(&self) -> &str {
        &self.schema
    }

    async fn inspect_table(&self, table: &str) -> Result<LiveTable> {
        let schema_exists: bool = self
            .client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_namespace WHERE nspname = $1)",
                &[&self.schema],
            )
            .await
            .map_err(|e| db_error(e, format!("Failed to check schema {}", self.schema)))?
            .get(0);

        if !schema_exists {
            return Ok(LiveTable::default());
        }

        let columns = self.load_columns(table).await?;
        let indexes = self
            .names(
                "SELECT indexname::text FROM pg_indexes WHERE schemaname = $1 AND tablename = $2",
                &[&self.schema, &table],
            )
            .await?;
        let sequences = self
            .names(
                "SELECT sequence_name::text FROM information_schema.sequences
                 WHERE sequence_schema = $1",
                &[&self.schema],
            )
            .await?;
        let triggers = self
            .names(
                "SELECT t.tgname::text
                 FROM pg_trigger t
                 JOIN pg_class c ON c.oid = t.tgrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2 AND NOT t.tgisinternal",
                &[&self.schema, &table],
            )
            .await?;

        Ok(LiveTable {
            schema_exists,
            columns,
            indexes: indexes.into_iter().collect(),
            sequences: sequences.into_iter().collect(),
            triggers: triggers.into_iter().collect(),
        })
    }

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()> {
        let sql = statement.to_sql();
        tracing::debug!("Executing DDL: {}", sql);
        let result = self.client.batch_execute(&sql).await;
        if let Some(table) = statement.table() {
            self.invalidate(table);
        }
        result.map_err(|e| db_error(e, format!("Failed to execute DDL: {}", sql)))
    }

    async fn upsert_row(&self, table: &str, key_column: &str, row: &RowValues) -> Result<()> {
        let names: Vec<String> = row.iter().map(|(c, _)| c.clone()).collect();
        let columns = self.typed_columns(table, &names).await?;
        let query = build_upsert_query(&self.schema, table, key_column, &columns);

        let params: Vec<&(dyn ToSql + Sync)> =
            row.iter().map(|(_, v)| v as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(&query, &params)
            .await
            .map_err(|e| db_error(e, format!("Failed to upsert row into {}.{}", self.schema, table)))?;
        Ok(())
    }

    async fn select_rows(
        &self,
        table: &str,
        columns: &[String],
        filter: &RowFilter,
    ) -> Result<Vec<StagedRecord>> {
        let filter_column = self
            .typed_columns(table, std::slice::from_ref(&filter.column))
            .await?
            .remove(0);
        self.typed_columns(table, columns).await?;
        let query = build_select_query(&self.schema, table, columns, &filter_column);

        let rows = self
            .client
            .query(&query, &[&filter.value])
            .await
            .map_err(|e| db_error(e, format!("Failed to read rows from {}.{}", self.schema, table)))?;

        Ok(rows
            .iter()
            .map(|row| StagedRecord {
                values: columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.clone(), row.get::<_, Option<String>>(i)))
                    .collect(),
            })
            .collect())
    }

    async fn update_row(
        &self,
        table: &str,
        key_column: &str,
        key_value: &str,
        values: &RowValues,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut names: Vec<String> = values.iter().map(|(c, _)| c.clone()).collect();
        names.push(key_column.to_string());
        let mut columns = self.typed_columns(table, &names).await?;
        let key = columns.pop().ok_or_else(|| SyncError::configuration("missing key column"))?;
        let query = build_update_query(&self.schema, table, &key, &columns);

        let key_value = key_value.to_string();
        let mut params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|(_, v)| v as &(dyn ToSql + Sync)).collect();
        params.push(&key_value);
        self.client
            .execute(&query, &params)
            .await
            .map_err(|e| db_error(e, format!("Failed to update row in {}.{}", self.schema, table)))?;
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        tracing::info!("Truncating {}.{}", self.schema, table);
        self.client
            .batch_execute(&format!("TRUNCATE TABLE {}", qualified(&self.schema, table)))
            .await
            .map_err(|e| db_error(e, format!("Failed to truncate {}.{}", self.schema, table)))
    }

    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }
        let typed = self.typed_columns(table, columns).await?;
        let batch_size = std::cmp::max(1, MAX_PARAMS / columns.len());

        let mut total_inserted = 0u64;
        for chunk in rows.chunks(batch_size) {
            let query = build_insert_query(&self.schema, table, &typed, chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();
            total_inserted += self
                .client
                .execute(&query, &params)
                .await
                .map_err(|e| db_error(e, format!("Failed to load batch into {}.{}", self.schema, table)))?;
        }
        Ok(total_inserted)
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let query = format!(
            "SELECT value FROM {} WHERE key = $1",
            qualified(&self.schema, KV_TABLE)
        );
        let row = self
            .client
            .query_opt(&query, &[&key])
            .await
            .with_context(|| format!("Failed to read config key {}", key))
            .map_err(SyncError::transport)?;
        Ok(row.and_then(|r| r.get::<_, Option<String>>(0)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            qualified(&self.schema, KV_TABLE)
        );
        self.client
            .execute(&query, &[&key, &value])
            .await
            .with_context(|| format!("Failed to write config key {}", key))
            .map_err(SyncError::transport)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE key = $1", qualified(&self.schema, KV_TABLE));
        self.client
            .execute(&query, &[&key])
            .await
            .with_context(|| format!("Failed to delete config key {}", key))
            .map_err(SyncError::transport)?;
        Ok(())
    }
}

fn cast(param: usize, column_type: &str) -> String {
    format!("CAST(${}::text AS {})", param, column_type)
}

/// Build a single-row upsert keyed on `key_column`.
///
/// ```sql
/// INSERT INTO "schema"."table" ("id", "name")
/// VALUES (CAST($1::text AS character varying(18)), CAST($2::text AS text))
/// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
/// ```
fn build_upsert_query(
    schema: &str,
    table: &str,
    key_column: &str,
    columns: &[(String, String)],
) -> String {
    let quoted: Vec<String> = columns.iter().map(|(c, _)| quote_ident(c)).collect();
    let values: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (_, t))| cast(i + 1, t))
        .collect();

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|(c, _)| c != key_column)
        .map(|(c, _)| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        qualified(schema, table),
        quoted.join(", "),
        values.join(", "),
        quote_ident(key_column),
        update_clause
    )
}

/// Build a multi-row insert that skips rows conflicting on any unique index.
fn build_insert_query(
    schema: &str,
    table: &str,
    columns: &[(String, String)],
    num_rows: usize,
) -> String {
    let quoted: Vec<String> = columns.iter().map(|(c, _)| quote_ident(c)).collect();
    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(col_idx, (_, t))| cast(row_idx * num_cols + col_idx + 1, t))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT DO NOTHING",
        qualified(schema, table),
        quoted.join(", "),
        value_rows.join(", ")
    )
}

/// Build a select returning every column as text, filtered on one column.
fn build_select_query(
    schema: &str,
    table: &str,
    columns: &[String],
    filter: &(String, String),
) -> String {
    let selected: Vec<String> = columns
        .iter()
        .map(|c| format!("{}::text", quote_ident(c)))
        .collect();
    format!(
        "SELECT {} FROM {} WHERE {} = {}",
        selected.join(", "),
        qualified(schema, table),
        quote_ident(&filter.0),
        cast(1, &filter.1)
    )
}

/// Build an update of `columns` for the row whose `key` matches the last parameter.
fn build_update_query(
    schema: &str,
    table: &str,
    key: &(String, String),
    columns: &[(String, String)],
) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (c, t))| format!("{} = {}", quote_ident(c), cast(i + 1, t)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} = {}",
        qualified(schema, table),
        assignments.join(", "),
        quote_ident(&key.0),
        cast(columns.len() + 1, &key.1)
    )
}
