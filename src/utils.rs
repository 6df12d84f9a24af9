// ABOUTME: Utility functions for identifier handling, retries and log-safe URLs
// ABOUTME: Shared by the schema planner, the PostgreSQL store and the Salesforce client

use crate::error::{RetryClass, SyncError};
use anyhow::{bail, Result};
use std::time::Duration;

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Retry an operation with exponential backoff.
///
/// Only errors classified as [`RetryClass::Retryable`] are retried; anything
/// else is returned immediately.
///
/// # Arguments
///
/// * `operation` - Async function to retry
/// * `max_retries` - Maximum number of retry attempts (0 = just the initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> crate::error::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && e.retry_class() == RetryClass::Retryable => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Validate a PostgreSQL identifier (schema, table or column name).
///
/// Accepts letters, digits and underscores, starting with a letter or
/// underscore, at most 63 characters.
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > MAX_IDENTIFIER_LEN {
        bail!(
            "Identifier '{}' exceeds maximum length of {} characters (got {})",
            sanitize_identifier(trimmed),
            MAX_IDENTIFIER_LEN,
            trimmed.len()
        );
    }

    let mut chars = trimmed.chars();
    if let Some(first_char) = chars.next() {
        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first_char
            );
        }
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Sanitize an identifier for display: no control characters, at most 100 chars.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Check that a column type is a plain type expression such as
/// `varchar(18)` or `double precision`, so it can be spliced into DDL.
pub fn validate_column_type(column_type: &str) -> crate::error::Result<()> {
    let ok = !column_type.trim().is_empty()
        && column_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')' | ','));
    if ok {
        Ok(())
    } else {
        Err(SyncError::configuration(format!(
            "Column type '{}' is not a valid PostgreSQL type",
            sanitize_identifier(column_type)
        )))
    }
}

/// Shorten a generated identifier to what PostgreSQL will actually store.
pub fn truncate_identifier(identifier: &str) -> String {
    if identifier.len() <= MAX_IDENTIFIER_LEN {
        return identifier.to_string();
    }
    let mut end = MAX_IDENTIFIER_LEN;
    while !identifier.is_char_boundary(end) {
        end -= 1;
    }
    identifier[..end].to_string()
}

/// Quote a PostgreSQL identifier, escaping embedded double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a SQL string literal, escaping embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Qualified `"schema"."name"` reference.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Strip the password from a connection URL so it can be logged.
///
/// Unparseable input is replaced entirely rather than echoed back.
pub fn strip_password_from_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                return "<redacted>".to_string();
            }
            parsed.to_string()
        }
        Err(_) => "<redacted>".to_string(),
    }
}
