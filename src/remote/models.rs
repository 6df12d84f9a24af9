// ABOUTME: Salesforce REST and Bulk 2.0 wire structures
// ABOUTME: Also flattens JSON records and CSV result pages into RemoteRecord rows

use super::RemoteRecord;
use crate::error::{Result, SyncError};
use crate::schema::ObjectFieldDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct DescribeResponse {
    pub name: String,
    pub fields: Vec<ObjectFieldDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub total_size: u64,
    pub done: bool,
    #[serde(default)]
    pub next_records_url: Option<String>,
    #[serde(default)]
    pub records: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQueryJob {
    pub operation: String,
    pub query: String,
    pub content_type: String,
    pub column_delimiter: String,
    pub line_ending: String,
}

impl CreateQueryJob {
    pub fn csv(query: &str) -> Self {
        Self {
            operation: "query".to_string(),
            query: query.to_string(),
            content_type: "CSV".to_string(),
            column_delimiter: "COMMA".to_string(),
            line_ending: "LF".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub number_records_processed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

/// One entry of a Salesforce error response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub message: String,
    #[serde(default, alias = "statusCode")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl ApiError {
    pub fn render(&self) -> String {
        let mut text = match &self.error_code {
            Some(code) => format!("{}: {}", code, self.message),
            None => self.message.clone(),
        };
        if !self.fields.is_empty() {
            text.push_str(&format!(" [{}]", self.fields.join(", ")));
        }
        text
    }
}

/// Join the messages of an error body, falling back to the raw text.
pub fn error_messages(body: &str) -> String {
    match serde_json::from_str::<Vec<ApiError>>(body) {
        Ok(errors) if !errors.is_empty() => errors
            .iter()
            .map(ApiError::render)
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.trim().to_string(),
    }
}

/// Flatten a JSON query record: drop `attributes`, render scalars as text.
pub fn flatten_record(record: Map<String, Value>) -> RemoteRecord {
    record
        .into_iter()
        .filter(|(key, _)| key != "attributes")
        .map(|(key, value)| {
            let text = match value {
                Value::Null => None,
                Value::String(s) => Some(s),
                Value::Bool(b) => Some(b.to_string()),
                Value::Number(n) => Some(n.to_string()),
                nested => Some(nested.to_string()),
            };
            (key, text)
        })
        .collect()
}

/// Parse a Bulk 2.0 CSV result page. Empty cells are nulls.
pub fn parse_csv_page(body: &str) -> Result<Vec<RemoteRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| SyncError::transport(anyhow::anyhow!("unreadable CSV header: {}", e)))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| SyncError::transport(anyhow::anyhow!("unreadable CSV row: {}", e)))?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), (!v.is_empty()).then(|| v.to_string())))
                .collect(),
        );
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_record_drops_attributes() {
        let record: Map<String, Value> = serde_json::from_str(
            r#"{
                "attributes": {"type": "Widget", "url": "/services/data/v60.0/sobjects/Widget/a01"},
                "Id": "a01000000000001AAA",
                "Price": 9.5,
                "IsDeleted": false,
                "Description": null
            }"#,
        )
        .unwrap();

        let flat = flatten_record(record);
        assert!(!flat.contains_key("attributes"));
        assert_eq!(flat["Id"].as_deref(), Some("a01000000000001AAA"));
        assert_eq!(flat["Price"].as_deref(), Some("9.5"));
        assert_eq!(flat["IsDeleted"].as_deref(), Some("false"));
        assert_eq!(flat["Description"], None);
    }

    #[test]
    fn test_parse_csv_page_nulls_and_quotes() {
        let body = "Id,Name,Price\n\
                    a01000000000001AAA,\"Sprocket, large\",9.5\n\
                    a01000000000002AAA,Flange,\n";
        let rows = parse_csv_page(body).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Name"].as_deref(), Some("Sprocket, large"));
        assert_eq!(rows[1]["Price"], None);
    }

    #[test]
    fn test_parse_csv_page_header_only() {
        assert!(parse_csv_page("Id,Name\n").unwrap().is_empty());
    }

    #[test]
    fn test_error_messages_joins_remote_errors() {
        let body = r#"[
            {"message": "Required fields are missing: [Price]", "errorCode": "REQUIRED_FIELD_MISSING", "fields": ["Price"]},
            {"message": "Name too long", "errorCode": "STRING_TOO_LONG"}
        ]"#;
        assert_eq!(
            error_messages(body),
            "REQUIRED_FIELD_MISSING: Required fields are missing: [Price] [Price]; STRING_TOO_LONG: Name too long"
        );
        assert_eq!(error_messages("Service Unavailable\n"), "Service Unavailable");
    }

    #[test]
    fn test_create_query_job_shape() {
        let value = serde_json::to_value(CreateQueryJob::csv("SELECT Id FROM Widget")).unwrap();
        assert_eq!(value["operation"], "query");
        assert_eq!(value["contentType"], "CSV");
        assert_eq!(value["lineEnding"], "LF");
    }
}
