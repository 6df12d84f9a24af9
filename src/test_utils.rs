// ABOUTME: In-memory fakes of the remote APIs and the target/key-value stores for unit tests
// ABOUTME: Scripted responses plus call recording so tests can assert on traffic

use crate::error::{Result, SyncError};
use crate::postgres::{KvStore, RowFilter, RowValues, StagedRecord, TargetStore};
use crate::remote::{
    BulkExportApi, JobState, MetadataApi, QueryApi, QueryPage, RecordApi, RecordPayload,
    RemoteRecord, ResultPage,
};
use crate::schema::table::default_common_fields;
use crate::schema::{
    ColumnSpec, DdlStatement, FieldResolution, FieldSource, FieldType, LiveTable,
    ObjectFieldDescriptor, TableSchema,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

pub fn record(fields: &[(&str, &str)]) -> RemoteRecord {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect()
}

pub fn field(name: &str, declared: &str, createable: bool, updateable: bool) -> ObjectFieldDescriptor {
    ObjectFieldDescriptor {
        createable,
        updateable,
        ..ObjectFieldDescriptor::new(name, FieldType::from(declared))
    }
}

fn widget_fields() -> Vec<ObjectFieldDescriptor> {
    vec![
        ObjectFieldDescriptor {
            unique: true,
            filterable: true,
            ..field("Id", "id", false, false)
        },
        ObjectFieldDescriptor {
            filterable: true,
            ..field("SystemModstamp", "datetime", false, false)
        },
        field("IsDeleted", "boolean", false, false),
        field("CreatedDate", "datetime", false, false),
        field("Name", "string", true, true),
        field("Price", "currency", true, true),
    ]
}

/// Reconciled schema for `Widget { Name, Price }` with the default sync columns.
pub fn widget_schema() -> TableSchema {
    let mut columns: Vec<ColumnSpec> = default_common_fields()
        .iter()
        .filter(|c| !c.remote)
        .map(|c| c.to_local_column())
        .collect();

    for descriptor in widget_fields() {
        if matches!(descriptor.name.as_str(), "IsDeleted" | "CreatedDate") {
            continue;
        }
        let unique = descriptor.unique;
        let column_type = crate::schema::map_type(&descriptor.declared_type);
        columns.push(ColumnSpec {
            create_unique_index: unique,
            create_index: !unique && descriptor.filterable,
            source: Some(FieldSource {
                object: "Widget".into(),
                resolution: FieldResolution::Plain,
                effective_type: descriptor.declared_type.clone(),
                can_create: descriptor.createable,
                can_update: descriptor.updateable,
                descriptor: descriptor.clone(),
            }),
            ..ColumnSpec::local(&descriptor.name, column_type)
        });
    }

    TableSchema::new("Widget", columns)
}

#[derive(Default)]
struct RemoteState {
    objects: HashMap<String, Vec<ObjectFieldDescriptor>>,
    describe_calls: HashMap<String, usize>,
    query_pages: VecDeque<(Vec<RemoteRecord>, Option<String>)>,
    query_calls: Vec<String>,
    job_states: VecDeque<Result<JobState>>,
    poll_count: usize,
    submitted: Vec<(String, String)>,
    result_pages: VecDeque<(Vec<RemoteRecord>, Option<String>)>,
    result_requests: Vec<(String, Option<String>)>,
    fail_fetch_at: Option<usize>,
    create_results: VecDeque<Result<String>>,
    update_results: VecDeque<Result<()>>,
    created: Vec<(String, RecordPayload)>,
    updated: Vec<(String, String, RecordPayload)>,
}

/// Scripted remote: every API answers from queues filled by the test.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote that knows the `Widget` object.
    pub fn with_widget() -> Self {
        let remote = Self::new();
        remote.add_object("Widget", widget_fields());
        remote
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_object(&self, object: &str, fields: Vec<ObjectFieldDescriptor>) {
        self.lock().objects.insert(object.to_lowercase(), fields);
    }

    pub fn describe_calls(&self, object: &str) -> usize {
        self.lock()
            .describe_calls
            .get(&object.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn push_query_page(&self, records: Vec<RemoteRecord>, next: Option<&str>) {
        self.lock()
            .query_pages
            .push_back((records, next.map(str::to_string)));
    }

    pub fn query_calls(&self) -> Vec<String> {
        self.lock().query_calls.clone()
    }

    pub fn set_job_states(&self, states: Vec<Result<JobState>>) {
        self.lock().job_states = states.into();
    }

    pub fn poll_count(&self) -> usize {
        self.lock().poll_count
    }

    pub fn submitted_exports(&self) -> Vec<(String, String)> {
        self.lock().submitted.clone()
    }

    pub fn push_result_page(&self, rows: Vec<RemoteRecord>, next_locator: Option<&str>) {
        self.lock()
            .result_pages
            .push_back((rows, next_locator.map(str::to_string)));
    }

    pub fn result_page_requests(&self) -> Vec<(String, Option<String>)> {
        self.lock().result_requests.clone()
    }

    /// Fail the result fetch that follows `successful` earlier fetches, once.
    pub fn fail_result_page_after(&self, successful: usize) {
        self.lock().fail_fetch_at = Some(successful);
    }

    pub fn push_create_result(&self, result: Result<String>) {
        self.lock().create_results.push_back(result);
    }

    pub fn push_update_result(&self, result: Result<()>) {
        self.lock().update_results.push_back(result);
    }

    pub fn created_records(&self) -> Vec<(String, RecordPayload)> {
        self.lock().created.clone()
    }

    pub fn updated_records(&self) -> Vec<(String, String, RecordPayload)> {
        self.lock().updated.clone()
    }

    fn page(state: &mut RemoteState) -> QueryPage {
        let total_size = state.query_pages.iter().map(|(r, _)| r.len() as u64).sum();
        match state.query_pages.pop_front() {
            Some((records, next)) => QueryPage {
                total_size,
                done: next.is_none(),
                next_records_url: next,
                records,
            },
            None => QueryPage {
                done: true,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl MetadataApi for FakeRemote {
    async fn describe(&self, object: &str) -> Result<Vec<ObjectFieldDescriptor>> {
        let mut state = self.lock();
        let key = object.to_lowercase();
        *state.describe_calls.entry(key.clone()).or_insert(0) += 1;
        state.objects.get(&key).cloned().ok_or_else(|| {
            SyncError::rejection(404, format!("NOT_FOUND: sObject type '{}' is not supported", object))
        })
    }
}

#[async_trait]
impl QueryApi for FakeRemote {
    async fn query(&self, soql: &str) -> Result<QueryPage> {
        let mut state = self.lock();
        state.query_calls.push(soql.to_string());
        Ok(Self::page(&mut state))
    }

    async fn query_more(&self, next_records_url: &str) -> Result<QueryPage> {
        let mut state = self.lock();
        state.query_calls.push(next_records_url.to_string());
        Ok(Self::page(&mut state))
    }
}

#[async_trait]
impl BulkExportApi for FakeRemote {
    async fn submit_export(&self, object: &str, soql: &str) -> Result<String> {
        let mut state = self.lock();
        state.submitted.push((object.to_string(), soql.to_string()));
        Ok(format!("750xx00000000{:02}", state.submitted.len()))
    }

    async fn poll_status(&self, _job_id: &str) -> Result<JobState> {
        let mut state = self.lock();
        state.poll_count += 1;
        state.job_states.pop_front().unwrap_or(Ok(JobState::JobComplete))
    }

    async fn fetch_result_page(&self, job_id: &str, locator: Option<&str>) -> Result<ResultPage> {
        let mut state = self.lock();
        let attempt = state.result_requests.len();
        state
            .result_requests
            .push((job_id.to_string(), locator.map(str::to_string)));
        if state.fail_fetch_at == Some(attempt) {
            state.fail_fetch_at = None;
            return Err(SyncError::transport(anyhow::anyhow!("connection reset by peer")));
        }

        Ok(match state.result_pages.pop_front() {
            Some((rows, next_locator)) => ResultPage {
                record_count: rows.len() as u64,
                rows,
                next_locator,
            },
            None => ResultPage::default(),
        })
    }
}

#[async_trait]
impl RecordApi for FakeRemote {
    async fn create_record(&self, object: &str, payload: &RecordPayload) -> Result<String> {
        let mut state = self.lock();
        state.created.push((object.to_string(), payload.clone()));
        let generated = format!("a0Rfake{:011}", state.created.len());
        state.create_results.pop_front().unwrap_or(Ok(generated))
    }

    async fn update_record(&self, object: &str, id: &str, payload: &RecordPayload) -> Result<()> {
        let mut state = self.lock();
        state
            .updated
            .push((object.to_string(), id.to_string(), payload.clone()));
        state.update_results.pop_front().unwrap_or(Ok(()))
    }
}

type Row = BTreeMap<String, Option<String>>;

#[derive(Default)]
struct MemTable {
    columns: Vec<(String, String)>,
    indexes: HashSet<String>,
    triggers: HashSet<String>,
    rows: Vec<Row>,
    truncations: usize,
}

impl MemTable {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(c, _)| c == name)
    }

    fn check_columns<'c>(&self, table: &str, names: impl IntoIterator<Item = &'c String>) -> Result<()> {
        for name in names {
            if !self.has_column(name) {
                return Err(SyncError::transport(anyhow::anyhow!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    name,
                    table
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    schema_exists: bool,
    sequences: HashSet<String>,
    tables: HashMap<String, MemTable>,
    kv: HashMap<String, String>,
    kv_writes: HashMap<String, usize>,
    ddl: Vec<DdlStatement>,
    next_sync_id: u64,
}

impl StoreState {
    fn table(&mut self, table: &str) -> Result<&mut MemTable> {
        self.tables.get_mut(table).ok_or_else(|| {
            SyncError::transport(anyhow::anyhow!("relation \"{}\" does not exist", table))
        })
    }

    fn insert(&mut self, table: &str, values: Row) -> Result<()> {
        self.next_sync_id += 1;
        let sync_id = self.next_sync_id.to_string();
        let target = self.table(table)?;
        target.check_columns(table, values.keys())?;
        let mut row: Row = target.columns.iter().map(|(c, _)| (c.clone(), None)).collect();
        if target.has_column("_sync_id") {
            row.insert("_sync_id".into(), Some(sync_id));
        }
        row.extend(values);
        target.rows.push(row);
        Ok(())
    }
}

/// Target store and key-value store backed by plain maps.
pub struct MemoryStore {
    schema: String,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ddl_log(&self) -> Vec<DdlStatement> {
        self.lock().ddl.clone()
    }

    pub fn table_columns(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.columns.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }

    pub fn rows(&self, table: &str) -> Vec<StagedRecord> {
        self.lock()
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .map(|r| StagedRecord { values: r.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_row(&self, table: &str, column: &str, value: &str) -> Option<StagedRecord> {
        self.rows(table)
            .into_iter()
            .find(|r| r.get(column) == Some(value))
    }

    pub fn rows_without(&self, table: &str, ignored: &[&str]) -> Vec<Row> {
        self.rows(table)
            .into_iter()
            .map(|r| {
                r.values
                    .into_iter()
                    .filter(|(k, _)| !ignored.contains(&k.as_str()))
                    .collect()
            })
            .collect()
    }

    pub fn truncate_count(&self, table: &str) -> usize {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.truncations)
            .unwrap_or(0)
    }

    pub fn insert_row(&self, table: &str, values: &[(&str, &str)]) {
        let row = values
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.to_string())))
            .collect();
        if let Err(e) = self.lock().insert(table, row) {
            panic!("insert into {} failed: {}", table, e);
        }
    }

    pub fn kv_value(&self, key: &str) -> Option<String> {
        self.lock().kv.get(key).cloned()
    }

    pub fn kv_writes(&self, key: &str) -> usize {
        self.lock().kv_writes.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn schema_name(&self) -> &str {
        &self.schema
    }

    async fn inspect_table(&self, table: &str) -> Result<LiveTable> {
        let state = self.lock();
        let mut live = LiveTable {
            schema_exists: state.schema_exists,
            sequences: state.sequences.clone(),
            ..Default::default()
        };
        if let Some(t) = state.tables.get(table) {
            live.columns = t.columns.iter().cloned().collect();
            live.indexes = t.indexes.clone();
            live.triggers = t.triggers.clone();
        }
        Ok(live)
    }

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()> {
        let mut state = self.lock();
        state.ddl.push(statement.clone());
        match statement {
            DdlStatement::CreateSchema { .. } => state.schema_exists = true,
            DdlStatement::CreateSequence { sequence, .. } => {
                state.sequences.insert(sequence.clone());
            }
            DdlStatement::CreateTable { table, columns, .. } => {
                let entry = state.tables.entry(table.clone()).or_default();
                if entry.columns.is_empty() {
                    entry.columns = columns
                        .iter()
                        .map(|c| (c.name.clone(), c.column_type.clone()))
                        .collect();
                }
            }
            DdlStatement::AddColumn { table, column, .. } => {
                let target = state.table(table)?;
                if !target.has_column(&column.name) {
                    target
                        .columns
                        .push((column.name.clone(), column.column_type.clone()));
                    for row in &mut target.rows {
                        row.insert(column.name.clone(), None);
                    }
                }
            }
            DdlStatement::CreateIndex { table, index, .. } => {
                state.table(table)?.indexes.insert(index.clone());
            }
            DdlStatement::CreateTouchTrigger { table, trigger, .. } => {
                state.table(table)?.triggers.insert(trigger.clone());
            }
        }
        Ok(())
    }

    async fn upsert_row(&self, table: &str, key_column: &str, row: &RowValues) -> Result<()> {
        let mut state = self.lock();
        let key = row
            .iter()
            .find(|(c, _)| c == key_column)
            .and_then(|(_, v)| v.clone());

        let target = state.table(table)?;
        target.check_columns(table, row.iter().map(|(c, _)| c))?;
        if let Some(key) = &key {
            if let Some(existing) = target
                .rows
                .iter_mut()
                .find(|r| r.get(key_column).and_then(|v| v.as_ref()) == Some(key))
            {
                for (column, value) in row {
                    existing.insert(column.clone(), value.clone());
                }
                return Ok(());
            }
        }

        state.insert(table, row.iter().cloned().collect())
    }

    async fn select_rows(
        &self,
        table: &str,
        columns: &[String],
        filter: &RowFilter,
    ) -> Result<Vec<StagedRecord>> {
        let mut state = self.lock();
        let target = state.table(table)?;
        target.check_columns(table, columns.iter())?;
        Ok(target
            .rows
            .iter()
            .filter(|r| r.get(&filter.column).and_then(|v| v.as_deref()) == Some(filter.value.as_str()))
            .map(|r| StagedRecord {
                values: columns
                    .iter()
                    .map(|c| (c.clone(), r.get(c).cloned().flatten()))
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
        let mut state = self.lock();
        let target = state.table(table)?;
        target.check_columns(table, values.iter().map(|(c, _)| c))?;
        for row in target
            .rows
            .iter_mut()
            .filter(|r| r.get(key_column).and_then(|v| v.as_deref()) == Some(key_value))
        {
            for (column, value) in values {
                row.insert(column.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        let mut state = self.lock();
        let target = state.table(table)?;
        target.rows.clear();
        target.truncations += 1;
        Ok(())
    }

    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<u64> {
        let mut state = self.lock();
        let id_index = columns.iter().position(|c| c == "id");
        let mut inserted = 0;

        for values in rows {
            if let Some(Some(id)) = id_index.map(|i| values[i].clone()) {
                let target = state.table(table)?;
                if target
                    .rows
                    .iter()
                    .any(|r| r.get("id").and_then(|v| v.as_deref()) == Some(id.as_str()))
                {
                    continue;
                }
            }
            state.insert(table, columns.iter().cloned().zip(values).collect())?;
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        state.kv.insert(key.to_string(), value.to_string());
        *state.kv_writes.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().kv.remove(key);
        Ok(())
    }
}
