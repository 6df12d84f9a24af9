// ABOUTME: Outbound sync engine - replays PENDING staged rows as remote creates and updates
// ABOUTME: Per-row rejections mark the row ERROR and the batch continues

use super::state::StateStore;
use crate::error::{Result, SyncError};
use crate::postgres::{RowFilter, RowValues, StagedRecord, SyncStatus, TargetStore};
use crate::remote::{RecordApi, RecordPayload};
use crate::schema::table::{SYNC_ID, SYNC_MESSAGE, SYNC_STATUS, SYNC_UPDATE_TIMESTAMP};
use crate::schema::{ColumnSpec, FieldResolution, FieldType, TableSchema};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundOutcome {
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

impl OutboundOutcome {
    pub fn pushed(&self) -> u64 {
        self.created + self.updated
    }
}

/// Pushes locally pending rows of one object back to the remote.
pub struct OutboundSync<'a> {
    records: &'a dyn RecordApi,
    store: &'a dyn TargetStore,
    state: StateStore<'a>,
}

impl<'a> OutboundSync<'a> {
    pub fn new(records: &'a dyn RecordApi, store: &'a dyn TargetStore, state: StateStore<'a>) -> Self {
        Self {
            records,
            store,
            state,
        }
    }

    /// Process every PENDING row sequentially.
    ///
    /// Rows without a remote id are created, the rest updated. A row whose
    /// populated fields are all read-only aborts the run with a configuration
    /// error; transport failures propagate.
    pub async fn sync_object(&self, object: &str) -> Result<OutboundOutcome> {
        let schema = self.state.require_schema(object).await?;
        for required in [SYNC_ID, SYNC_STATUS, "id"] {
            if !schema.has_column(required) {
                return Err(SyncError::configuration(format!(
                    "Table for {} has no {} column; outbound sync needs it",
                    object, required
                )));
            }
        }

        let createable = schema.createable_columns();
        let updateable = schema.updateable_columns();
        let pending = self
            .store
            .select_rows(
                &schema.table,
                &schema.column_names(),
                &RowFilter::status(SyncStatus::Pending),
            )
            .await?;

        let mut outcome = OutboundOutcome::default();
        if pending.is_empty() {
            debug!("No pending rows for {}", object);
            return Ok(outcome);
        }
        info!("Pushing {} pending row(s) for {}", pending.len(), object);

        for row in &pending {
            let Some(sync_id) = row.sync_id() else {
                warn!("Pending {} row has no {}, skipping", object, SYNC_ID);
                continue;
            };

            let result = match row.remote_id() {
                None => {
                    let payload = build_payload(row, &createable);
                    if payload.is_empty() {
                        return Err(SyncError::configuration(format!(
                            "No createable fields found for {} row {}",
                            object, sync_id
                        )));
                    }
                    debug!("Creating {} from row {}", object, sync_id);
                    self.records
                        .create_record(object, &payload)
                        .await
                        .map(Some)
                }
                Some(remote_id) => {
                    let payload = build_payload(row, &updateable);
                    if payload.is_empty() {
                        return Err(SyncError::configuration(format!(
                            "No updateable fields found for {} row {}",
                            object, sync_id
                        )));
                    }
                    debug!("Updating {} {} from row {}", object, remote_id, sync_id);
                    self.records
                        .update_record(object, remote_id, &payload)
                        .await
                        .map(|_| None)
                }
            };

            match result {
                Ok(created_id) => {
                    if created_id.is_some() {
                        outcome.created += 1;
                    } else {
                        outcome.updated += 1;
                    }
                    self.mark_synced(&schema, sync_id, created_id).await?;
                }
                Err(SyncError::RemoteRejection { status, message }) => {
                    warn!(
                        "{} row {} rejected by remote ({}): {}",
                        object, sync_id, status, message
                    );
                    outcome.failed += 1;
                    self.mark_error(&schema, sync_id, &message).await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Pushed {}: {} created, {} updated, {} failed",
            object, outcome.created, outcome.updated, outcome.failed
        );
        Ok(outcome)
    }

    async fn mark_synced(
        &self,
        schema: &TableSchema,
        sync_id: &str,
        created_id: Option<String>,
    ) -> Result<()> {
        let mut values: RowValues = Vec::new();
        if let Some(id) = created_id {
            values.push(("id".to_string(), Some(id)));
        }
        values.push((SYNC_STATUS.to_string(), Some(SyncStatus::Synced.to_string())));
        let provenance = serde_json::json!({ "command": "postgresToSalesforce" }).to_string();
        self.write_status(schema, sync_id, values, provenance).await
    }

    async fn mark_error(&self, schema: &TableSchema, sync_id: &str, message: &str) -> Result<()> {
        let message = if message.trim().is_empty() {
            "rejected by remote".to_string()
        } else {
            message.to_string()
        };
        let values = vec![(SYNC_STATUS.to_string(), Some(SyncStatus::Error.to_string()))];
        self.write_status(schema, sync_id, values, message).await
    }

    async fn write_status(
        &self,
        schema: &TableSchema,
        sync_id: &str,
        mut values: RowValues,
        message: String,
    ) -> Result<()> {
        if schema.has_column(SYNC_MESSAGE) {
            values.push((SYNC_MESSAGE.to_string(), Some(message)));
        }
        if schema.has_column(SYNC_UPDATE_TIMESTAMP) {
            values.push((
                SYNC_UPDATE_TIMESTAMP.to_string(),
                Some(Utc::now().naive_utc().to_string()),
            ));
        }
        self.store
            .update_row(&schema.table, SYNC_ID, sync_id, &values)
            .await
    }
}

/// Project the populated, allowed fields of `row` into a remote payload.
///
/// Keys use the remote field name. Values resolved through a relationship
/// are nested under the relationship name.
pub fn build_payload(row: &StagedRecord, columns: &[&ColumnSpec]) -> RecordPayload {
    let mut payload = Map::new();

    for column in columns {
        let Some(source) = column.source.as_ref() else {
            continue;
        };
        if column.name == "id" {
            continue;
        }
        let Some(raw) = row.get(&column.name) else {
            continue;
        };
        let value = remote_value(&source.effective_type, raw);

        // Reconciled calculated columns are never writable, so this only
        // fires for schemas that grant them a capability explicitly.
        match source.nested_under() {
            Some(relationship) => {
                let nested = payload
                    .entry(relationship.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(fields) = nested {
                    let key = match &source.resolution {
                        FieldResolution::Calculated { target_field, .. } => {
                            target_field.clone()
                        }
                        _ => source.remote_name().to_string(),
                    };
                    fields.insert(key, value);
                }
            }
            None => {
                payload.insert(source.remote_name().to_string(), value);
            }
        }
    }

    payload
}

/// Booleans go out as the literal strings the remote expects, numbers as
/// JSON numbers when they parse, and datetimes as ISO 8601 in UTC.
fn remote_value(field_type: &FieldType, raw: &str) -> Value {
    match field_type {
        FieldType::Datetime => Value::String(
            remote_datetime(raw.trim()).unwrap_or_else(|| raw.to_string()),
        ),
        FieldType::Boolean => {
            let truthy = matches!(raw.trim().to_ascii_lowercase().as_str(), "t" | "true" | "1" | "yes");
            Value::String(if truthy { "true" } else { "false" }.to_string())
        }
        t if t.is_numeric() => serde_json::from_str::<serde_json::Number>(raw.trim())
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

/// `timestamp::text` renders as `2024-02-01 10:00:00`; the remote wants
/// `2024-02-01T10:00:00.000Z`. Values that already carry an offset are
/// converted to UTC.
fn remote_datetime(raw: &str) -> Option<String> {
    let utc = match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()?
            .and_utc(),
    };
    Some(utc.to_rfc3339_opts(SecondsFormat::Millis, true))
}
