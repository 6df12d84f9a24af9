// ABOUTME: Remote object store interfaces - metadata, query, bulk export and record APIs
// ABOUTME: SalesforceClient implements all four; tests use in-memory fakes

pub mod client;
pub mod models;
pub mod stream;

pub use client::SalesforceClient;
pub use stream::QueryStream;

use crate::error::Result;
use crate::schema::ObjectFieldDescriptor;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One remote record, field name to textual value. Keys keep the remote casing.
pub type RemoteRecord = BTreeMap<String, Option<String>>;

/// Outbound record body, keyed by remote field name.
pub type RecordPayload = Map<String, Value>;

/// One page of query results plus its continuation.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub total_size: u64,
    pub done: bool,
    pub next_records_url: Option<String>,
    pub records: Vec<RemoteRecord>,
}

/// One page of bulk export results.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<RemoteRecord>,
    pub next_locator: Option<String>,
    pub record_count: u64,
}

/// Remote-reported state of a bulk export job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    InProgress,
    JobComplete,
    Failed(String),
}

impl JobState {
    /// Map the remote `state` string onto the job lifecycle.
    pub fn from_remote(state: &str, error_message: Option<&str>) -> Self {
        match state {
            "UploadComplete" | "Open" => JobState::Queued,
            "InProgress" => JobState::InProgress,
            "JobComplete" => JobState::JobComplete,
            other => JobState::Failed(
                error_message
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("job ended in state {}", other)),
            ),
        }
    }
}

#[async_trait]
pub trait MetadataApi: Send + Sync {
    async fn describe(&self, object: &str) -> Result<Vec<ObjectFieldDescriptor>>;
}

#[async_trait]
pub trait QueryApi: Send + Sync {
    async fn query(&self, soql: &str) -> Result<QueryPage>;

    async fn query_more(&self, next_records_url: &str) -> Result<QueryPage>;
}

#[async_trait]
pub trait BulkExportApi: Send + Sync {
    async fn submit_export(&self, object: &str, soql: &str) -> Result<String>;

    /// A job that is not visible yet fails with `SyncError::TransientRemote`.
    async fn poll_status(&self, job_id: &str) -> Result<JobState>;

    async fn fetch_result_page(&self, job_id: &str, locator: Option<&str>) -> Result<ResultPage>;
}

#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Returns the id assigned by the remote.
    async fn create_record(&self, object: &str, payload: &RecordPayload) -> Result<String>;

    async fn update_record(&self, object: &str, id: &str, payload: &RecordPayload) -> Result<()>;
}

/// Everything the sync runner needs from the remote side.
pub trait RemoteApi: MetadataApi + QueryApi + BulkExportApi + RecordApi {}

impl<T> RemoteApi for T where T: MetadataApi + QueryApi + BulkExportApi + RecordApi {}
