// ABOUTME: HTTP client for the Salesforce REST and Bulk 2.0 query APIs
// ABOUTME: Maps HTTP failures onto SyncError classes and retries idempotent reads

use super::models::{
    error_messages, flatten_record, parse_csv_page, ApiError, CreateQueryJob, CreateResponse,
    DescribeResponse, JobInfo, QueryResponse,
};
use super::{BulkExportApi, JobState, MetadataApi, QueryApi, QueryPage, RecordApi, RecordPayload, ResultPage};
use crate::error::{Result, SyncError};
use crate::schema::ObjectFieldDescriptor;
use crate::utils::retry_with_backoff;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

pub const DEFAULT_API_VERSION: &str = "60.0";
pub const DEFAULT_BULK_PAGE_SIZE: u64 = 50_000;

/// Salesforce API client bound to one org and access token.
pub struct SalesforceClient {
    client: Client,
    instance_url: String,
    api_version: String,
    access_token: String,
    page_size: u64,
}

impl SalesforceClient {
    pub fn new(instance_url: &str, api_version: &str, access_token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")
            .map_err(SyncError::transport)?;

        Ok(Self {
            client,
            instance_url: instance_url.trim_end_matches('/').to_string(),
            api_version: api_version.trim_start_matches('v').to_string(),
            access_token,
            page_size: DEFAULT_BULK_PAGE_SIZE,
        })
    }

    /// Maximum rows requested per bulk result page.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.instance_url,
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    /// GET with retries on network failures and 5xx responses.
    ///
    /// Other statuses are returned to the caller unchecked.
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
        retry_with_backoff(
            || async move {
                let response = self
                    .client
                    .get(url)
                    .bearer_auth(&self.access_token)
                    .query(query)
                    .send()
                    .await?;
                if response.status().is_server_error() {
                    return Err(error_for(response).await);
                }
                Ok(response)
            },
            3,
            Duration::from_millis(500),
        )
        .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = ensure_success(self.get(url, query).await?).await?;
        let parsed = response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
            .map_err(SyncError::transport)?;
        Ok(parsed)
    }

    fn query_page(response: QueryResponse) -> QueryPage {
        QueryPage {
            total_size: response.total_size,
            done: response.done,
            next_records_url: response.next_records_url.filter(|_| !response.done),
            records: response.records.into_iter().map(flatten_record).collect(),
        }
    }
}

/// Classify a non-success status.
///
/// 401 needs a new token, 5xx is a transport failure, any other 4xx is a
/// rejection carrying the remote messages.
pub fn status_error(status: u16, body: &str) -> SyncError {
    let message = error_messages(body);
    match status {
        401 => SyncError::configuration(format!(
            "Salesforce rejected the access token (401): {}",
            message
        )),
        500..=599 => SyncError::transport(anyhow::anyhow!(
            "Salesforce returned {}: {}",
            status,
            message
        )),
        _ => SyncError::rejection(status, message),
    }
}

async fn error_for(response: Response) -> SyncError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    status_error(status, &body)
}

async fn ensure_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_for(response).await)
    }
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl MetadataApi for SalesforceClient {
    async fn describe(&self, object: &str) -> Result<Vec<ObjectFieldDescriptor>> {
        let url = self.data_url(&format!("sobjects/{}/describe", object));
        let describe: DescribeResponse = self.get_json(&url, &[]).await?;
        tracing::debug!("Described {} ({} fields)", describe.name, describe.fields.len());
        Ok(describe.fields)
    }
}

#[async_trait]
impl QueryApi for SalesforceClient {
    async fn query(&self, soql: &str) -> Result<QueryPage> {
        let url = self.data_url("query");
        let response: QueryResponse = self.get_json(&url, &[("q", soql.to_string())]).await?;
        Ok(Self::query_page(response))
    }

    async fn query_more(&self, next_records_url: &str) -> Result<QueryPage> {
        let url = format!("{}{}", self.instance_url, next_records_url);
        let response: QueryResponse = self.get_json(&url, &[]).await?;
        Ok(Self::query_page(response))
    }
}

#[async_trait]
impl BulkExportApi for SalesforceClient {
    async fn submit_export(&self, object: &str, soql: &str) -> Result<String> {
        let url = self.data_url("jobs/query");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&CreateQueryJob::csv(soql))
            .send()
            .await?;
        let job: JobInfo = ensure_success(response)
            .await?
            .json()
            .await
            .context("Failed to parse bulk job response")
            .map_err(SyncError::transport)?;

        tracing::info!("Submitted bulk export {} for {}", job.id, object);
        Ok(job.id)
    }

    async fn poll_status(&self, job_id: &str) -> Result<JobState> {
        let url = self.data_url(&format!("jobs/query/{}", job_id));
        let response = self.get(&url, &[]).await?;

        // A freshly created job can 400/404 until it is visible.
        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND
        ) {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::TransientRemote(format!(
                "job {} not ready: {}",
                job_id,
                error_messages(&body)
            )));
        }

        let job: JobInfo = ensure_success(response)
            .await?
            .json()
            .await
            .context("Failed to parse bulk job status")
            .map_err(SyncError::transport)?;
        if let Some(processed) = job.number_records_processed {
            tracing::debug!("Job {} is {} ({} records)", job_id, job.state, processed);
        }
        Ok(JobState::from_remote(&job.state, job.error_message.as_deref()))
    }

    async fn fetch_result_page(&self, job_id: &str, locator: Option<&str>) -> Result<ResultPage> {
        let url = self.data_url(&format!("jobs/query/{}/results", job_id));
        let mut query = vec![("maxRecords", self.page_size.to_string())];
        if let Some(locator) = locator {
            query.push(("locator", locator.to_string()));
        }

        let response = ensure_success(self.get(&url, &query).await?).await?;
        let next_locator = header(&response, "Sforce-Locator");
        let reported = header(&response, "Sforce-NumberOfRecords").and_then(|n| n.parse().ok());
        let body = response
            .text()
            .await
            .context("Failed to read bulk result page")
            .map_err(SyncError::transport)?;

        let rows = parse_csv_page(&body)?;
        Ok(ResultPage {
            record_count: reported.unwrap_or(rows.len() as u64),
            rows,
            next_locator,
        })
    }
}

#[async_trait]
impl RecordApi for SalesforceClient {
    async fn create_record(&self, object: &str, payload: &RecordPayload) -> Result<String> {
        let url = self.data_url(&format!("sobjects/{}", object));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let status = response.status().as_u16();
        let created: CreateResponse = response
            .json()
            .await
            .context("Failed to parse create response")
            .map_err(SyncError::transport)?;

        if !created.success && !created.errors.is_empty() {
            let message = created
                .errors
                .iter()
                .map(ApiError::render)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SyncError::rejection(status, message));
        }
        Ok(created.id)
    }

    async fn update_record(&self, object: &str, id: &str, payload: &RecordPayload) -> Result<()> {
        let url = self.data_url(&format!("sobjects/{}/{}", object, id));
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryClass;

    fn client() -> SalesforceClient {
        SalesforceClient::new("https://example.my.salesforce.com/", "v60.0", "token".into()).unwrap()
    }

    #[test]
    fn test_data_url() {
        let client = client();
        assert_eq!(
            client.data_url("sobjects/Widget/describe"),
            "https://example.my.salesforce.com/services/data/v60.0/sobjects/Widget/describe"
        );
        assert_eq!(client.page_size, DEFAULT_BULK_PAGE_SIZE);
        assert_eq!(client.with_page_size(0).page_size, 1);
    }

    #[test]
    fn test_status_error_classes() {
        let body = r#"[{"message": "Price must be positive", "errorCode": "FIELD_CUSTOM_VALIDATION_EXCEPTION"}]"#;
        match status_error(400, body) {
            SyncError::RemoteRejection { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("Price must be positive"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(status_error(503, "busy").retry_class(), RetryClass::Retryable);
        assert!(status_error(401, "[]").is_configuration());
    }

    #[test]
    fn test_done_page_has_no_continuation() {
        let page = SalesforceClient::query_page(QueryResponse {
            total_size: 1,
            done: true,
            next_records_url: Some("/services/data/v60.0/query/01g-2000".into()),
            records: vec![],
        });
        assert!(page.done);
        assert!(page.next_records_url.is_none());
    }
}
