// ABOUTME: Target store interfaces - staging table DDL/DML and the key-value state table
// ABOUTME: PgStore is the PostgreSQL implementation; rows travel as text values

pub mod connection;
pub mod store;

pub use connection::connect;
pub use store::{kv_table_schema, PgStore, KV_TABLE};

use crate::error::Result;
use crate::schema::table::{SYNC_ID, SYNC_STATUS};
use crate::schema::{DdlStatement, LiveTable};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

/// Synchronization state of a staged row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered column/value pairs for a single row write.
pub type RowValues = Vec<(String, Option<String>)>;

/// One row read back from a staging table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedRecord {
    pub values: BTreeMap<String, Option<String>>,
}

impl StagedRecord {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }

    pub fn sync_id(&self) -> Option<&str> {
        self.get(SYNC_ID)
    }

    /// Remote id; blank strings count as absent.
    pub fn remote_id(&self) -> Option<&str> {
        self.get("id").filter(|id| !id.trim().is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        self.get(SYNC_STATUS)
    }
}

/// Equality predicate for row selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn status(status: SyncStatus) -> Self {
        Self::eq(SYNC_STATUS, status.as_str())
    }
}

/// Relational staging store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Schema that holds every staging table.
    fn schema_name(&self) -> &str;

    async fn inspect_table(&self, table: &str) -> Result<LiveTable>;

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()>;

    /// Insert the row, or overwrite the provided columns when `key_column` matches.
    async fn upsert_row(&self, table: &str, key_column: &str, row: &RowValues) -> Result<()>;

    async fn select_rows(
        &self,
        table: &str,
        columns: &[String],
        filter: &RowFilter,
    ) -> Result<Vec<StagedRecord>>;

    async fn update_row(
        &self,
        table: &str,
        key_column: &str,
        key_value: &str,
        values: &RowValues,
    ) -> Result<()>;

    async fn truncate(&self, table: &str) -> Result<()>;

    /// Load rows in a fixed column order; rows conflicting with existing ones are skipped.
    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<u64>;
}

/// String key-value store for cursors and schemas.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}
