// ABOUTME: SyncCursor - per-object watermark or in-flight bulk job, persisted as JSON
// ABOUTME: StateStore reads and writes cursors and table schemas through the key-value store

use crate::error::{Result, SyncError};
use crate::postgres::KvStore;
use crate::schema::TableSchema;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Full-load export that has been submitted but not finished loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBulkJob {
    pub job_id: String,
    /// Locator of the next result page; `None` before the first page.
    #[serde(default)]
    pub locator: Option<String>,
    /// Highest modification timestamp loaded so far.
    #[serde(default)]
    pub max_watermark: Option<String>,
    #[serde(default)]
    pub pages_loaded: u64,
    #[serde(default)]
    pub records_loaded: u64,
    pub submitted_at: DateTime<Utc>,
}

impl PendingBulkJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            locator: None,
            max_watermark: None,
            pages_loaded: 0,
            records_loaded: 0,
            submitted_at: Utc::now(),
        }
    }

    /// Whether result paging has already started.
    pub fn has_loaded_pages(&self) -> bool {
        self.pages_loaded > 0
    }
}

/// Exactly one of a completed-load watermark or an in-flight bulk job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CursorPosition {
    Watermark { last_modified: String },
    PendingBulkJob(PendingBulkJob),
}

/// Persisted sync position for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub object: String,
    pub position: CursorPosition,
    /// Rows written by the run that last moved this cursor.
    #[serde(default)]
    pub last_row_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn watermark(object: &str, last_modified: impl Into<String>) -> Self {
        Self {
            object: object.to_string(),
            position: CursorPosition::Watermark {
                last_modified: last_modified.into(),
            },
            last_row_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn pending(object: &str, job: PendingBulkJob) -> Self {
        Self {
            object: object.to_string(),
            position: CursorPosition::PendingBulkJob(job),
            last_row_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn last_modified(&self) -> Option<&str> {
        match &self.position {
            CursorPosition::Watermark { last_modified } => Some(last_modified),
            CursorPosition::PendingBulkJob(_) => None,
        }
    }

    pub fn pending_job(&self) -> Option<&PendingBulkJob> {
        match &self.position {
            CursorPosition::PendingBulkJob(job) => Some(job),
            CursorPosition::Watermark { .. } => None,
        }
    }

    /// Move the watermark forward to `candidate` if it is later.
    ///
    /// Returns whether the cursor changed. Never moves backwards.
    pub fn advance(&mut self, candidate: &str, rows: u64) -> bool {
        let moved = match &self.position {
            CursorPosition::Watermark { last_modified } => {
                compare_watermarks(candidate, last_modified) == Ordering::Greater
            }
            CursorPosition::PendingBulkJob(_) => true,
        };
        if moved {
            self.position = CursorPosition::Watermark {
                last_modified: candidate.to_string(),
            };
        }
        self.last_row_count = rows;
        self.updated_at = Utc::now();
        moved
    }
}

/// Parse a remote timestamp such as `2024-01-02T03:04:05.000+0000` or RFC 3339.
pub fn parse_watermark(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
}

/// Order two watermarks by time, falling back to string order when either
/// does not parse.
pub fn compare_watermarks(a: &str, b: &str) -> Ordering {
    match (parse_watermark(a), parse_watermark(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// The later of an optional running maximum and a candidate.
pub fn max_watermark(current: Option<String>, candidate: &str) -> Option<String> {
    match current {
        Some(existing) if compare_watermarks(candidate, &existing) != Ordering::Greater => {
            Some(existing)
        }
        _ => Some(candidate.to_string()),
    }
}

/// Render a timestamp in the form the remote query language accepts.
pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn cursor_key(object: &str) -> String {
    format!("{}-sync-cursor", object)
}

pub fn schema_key(object: &str) -> String {
    format!("{}-schema", object)
}

/// Typed access to cursors and schemas kept in the key-value store.
#[derive(Clone, Copy)]
pub struct StateStore<'a> {
    kv: &'a dyn KvStore,
}

impl<'a> StateStore<'a> {
    pub fn new(kv: &'a dyn KvStore) -> Self {
        Self { kv }
    }

    pub async fn load_cursor(&self, object: &str) -> Result<Option<SyncCursor>> {
        match self.kv.get(&cursor_key(object)).await? {
            Some(raw) => {
                let cursor = serde_json::from_str(&raw).map_err(|e| {
                    SyncError::State(format!("cursor for {} is unreadable: {}", object, e))
                })?;
                Ok(Some(cursor))
            }
            None => Ok(None),
        }
    }

    pub async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let raw = serde_json::to_string(cursor)?;
        self.kv.set(&cursor_key(&cursor.object), &raw).await
    }

    pub async fn clear_cursor(&self, object: &str) -> Result<()> {
        self.kv.delete(&cursor_key(object)).await
    }

    pub async fn load_schema(&self, object: &str) -> Result<Option<TableSchema>> {
        match self.kv.get(&schema_key(object)).await? {
            Some(raw) => {
                let schema = serde_json::from_str(&raw).map_err(|e| {
                    SyncError::State(format!("schema for {} is unreadable: {}", object, e))
                })?;
                Ok(Some(schema))
            }
            None => Ok(None),
        }
    }

    /// Load the persisted schema, failing when `sync-tables` has not run yet.
    pub async fn require_schema(&self, object: &str) -> Result<TableSchema> {
        self.load_schema(object).await?.ok_or_else(|| {
            SyncError::configuration(format!(
                "No schema recorded for {}; run sync-tables first",
                object
            ))
        })
    }

    pub async fn save_schema(&self, schema: &TableSchema) -> Result<()> {
        let raw = serde_json::to_string(schema)?;
        self.kv.set(&schema_key(&schema.object), &raw).await
    }
}
