// ABOUTME: Inbound sync engine - full load through bulk export, then watermark-bounded pulls
// ABOUTME: Watermark is persisted after every page so a crash replays at most one page

use super::bulk::{normalize_row, BulkExport, BulkExportConfig};
use super::state::{max_watermark, PendingBulkJob, StateStore, SyncCursor};
use crate::error::{Result, SyncError};
use crate::postgres::{RowValues, TargetStore};
use crate::remote::{BulkExportApi, QueryApi, QueryStream, RemoteRecord};
use crate::schema::table::{SYNC_MESSAGE, SYNC_STATUS, SYNC_UPDATE_TIMESTAMP};
use crate::schema::TableSchema;
use chrono::Utc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct InboundSettings {
    /// Remote modification timestamp used as the watermark.
    pub watermark_field: String,
    pub bulk: BulkExportConfig,
}

impl Default for InboundSettings {
    fn default() -> Self {
        Self {
            watermark_field: "SystemModstamp".to_string(),
            bulk: BulkExportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMode {
    Skipped,
    FullLoad,
    Incremental,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundOutcome {
    pub mode: InboundMode,
    pub rows: u64,
    pub watermark: Option<String>,
}

/// Pulls remote changes for one object at a time into its staging table.
pub struct InboundSync<'a> {
    query: &'a dyn QueryApi,
    bulk: &'a dyn BulkExportApi,
    store: &'a dyn TargetStore,
    state: StateStore<'a>,
    settings: &'a InboundSettings,
}

impl<'a> InboundSync<'a> {
    pub fn new(
        query: &'a dyn QueryApi,
        bulk: &'a dyn BulkExportApi,
        store: &'a dyn TargetStore,
        state: StateStore<'a>,
        settings: &'a InboundSettings,
    ) -> Self {
        Self {
            query,
            bulk,
            store,
            state,
            settings,
        }
    }

    /// Full load when no watermark exists yet, incremental pull otherwise.
    pub async fn sync_object(
        &self,
        object: &str,
        configured_fields: &[String],
    ) -> Result<InboundOutcome> {
        if configured_fields.is_empty() {
            debug!("{} has no configured fields, skipping pull", object);
            return Ok(InboundOutcome {
                mode: InboundMode::Skipped,
                rows: 0,
                watermark: None,
            });
        }

        let schema = self.state.require_schema(object).await?;
        if !schema.has_column("id") {
            return Err(SyncError::configuration(format!(
                "Table for {} has no id column to upsert on",
                object
            )));
        }
        if !schema.has_column(&self.settings.watermark_field) {
            return Err(SyncError::configuration(format!(
                "Table for {} has no {} column to track changes with",
                object, self.settings.watermark_field
            )));
        }

        match self.state.load_cursor(object).await? {
            Some(cursor) => match cursor.pending_job().cloned() {
                Some(job) => self.full_load(&schema, Some(job)).await,
                None => self.incremental(&schema, cursor).await,
            },
            None => self.full_load(&schema, None).await,
        }
    }

    async fn full_load(
        &self,
        schema: &TableSchema,
        resume: Option<PendingBulkJob>,
    ) -> Result<InboundOutcome> {
        let object = schema.object.as_str();
        let soql = select_statement(schema);
        info!("Starting full load of {}", object);

        let mut export = BulkExport::start(
            self.bulk,
            self.state,
            &self.settings.bulk,
            object,
            &soql,
            &self.settings.watermark_field,
            resume,
        )
        .await?;
        let resuming_pages = export.job().has_loaded_pages();
        export.wait_for_completion().await?;

        if !resuming_pages {
            self.store.truncate(&schema.table).await?;
        }

        let columns = load_columns(schema);
        while let Some(page) = export.next_page().await? {
            let rows: Vec<Vec<Option<String>>> = page
                .rows
                .iter()
                .map(|row| project(row, &columns))
                .collect();
            let loaded = self.store.bulk_load(&schema.table, &columns, rows).await?;
            debug!(
                "Loaded page of {} ({} reported, {} inserted)",
                object, page.record_count, loaded
            );
            export.commit_page(&page).await?;
        }

        let cursor = export.finish().await?;
        Ok(InboundOutcome {
            mode: InboundMode::FullLoad,
            rows: cursor.last_row_count,
            watermark: cursor.last_modified().map(str::to_string),
        })
    }

    async fn incremental(&self, schema: &TableSchema, mut cursor: SyncCursor) -> Result<InboundOutcome> {
        let object = schema.object.as_str();
        let since = cursor.last_modified().unwrap_or_default().to_string();
        let field = &self.settings.watermark_field;
        let watermark_column = field.to_lowercase();
        let soql = format!(
            "{} WHERE {} > {} ORDER BY {} ASC",
            select_statement(schema),
            field,
            since,
            field
        );
        debug!("Pulling {} changes since {}", object, since);

        let provenance = serde_json::json!({ "command": "incrementalUpdate" }).to_string();
        let columns = load_columns(schema);
        let mut stream = QueryStream::new(self.query, soql);
        let mut total = 0u64;

        while let Some(records) = stream.next_page().await? {
            let stamp = Utc::now().naive_utc().to_string();
            let mut page_max: Option<String> = None;

            for raw in records {
                let row = normalize_row(raw, &stamp, &provenance);
                if row.get("id").and_then(|v| v.as_deref()).is_none() {
                    warn!("Skipping {} record without an id", object);
                    continue;
                }

                let values: RowValues = columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().flatten()))
                    .collect();
                self.store.upsert_row(&schema.table, "id", &values).await?;
                total += 1;

                if let Some(Some(stamp)) = row.get(&watermark_column) {
                    page_max = max_watermark(page_max, stamp);
                }
            }

            if let Some(page_max) = page_max {
                if cursor.advance(&page_max, total) {
                    self.state.save_cursor(&cursor).await?;
                    debug!("{} watermark advanced to {}", object, page_max);
                }
            }
        }

        if total > 0 {
            info!(
                "Pulled {} changed record(s) for {}, watermark {}",
                total,
                object,
                cursor.last_modified().unwrap_or_default()
            );
        } else {
            debug!("No changes in {} since {}", object, since);
        }

        Ok(InboundOutcome {
            mode: InboundMode::Incremental,
            rows: total,
            watermark: cursor.last_modified().map(str::to_string),
        })
    }
}

/// `SELECT <remote fields> FROM <object>` for every remote-backed column.
pub fn select_statement(schema: &TableSchema) -> String {
    let fields: Vec<&str> = schema
        .remote_columns()
        .filter_map(|c| c.source.as_ref().map(|s| s.remote_name()))
        .collect();
    format!("SELECT {} FROM {}", fields.join(", "), schema.object)
}

/// Columns written by inbound sync: sync metadata plus remote-backed columns.
fn load_columns(schema: &TableSchema) -> Vec<String> {
    schema
        .columns
        .iter()
        .filter(|c| {
            c.is_remote()
                || c.name == SYNC_STATUS
                || c.name == SYNC_MESSAGE
                || c.name == SYNC_UPDATE_TIMESTAMP
        })
        .map(|c| c.name.clone())
        .collect()
}

fn project(row: &RemoteRecord, columns: &[String]) -> Vec<Option<String>> {
    columns
        .iter()
        .map(|c| row.get(c).cloned().flatten())
        .collect()
}
