// ABOUTME: Error taxonomy for schema reconciliation and synchronization
// ABOUTME: Separates operator-facing config errors from retryable and per-row remote failures

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// How a caller should react to a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Safe to try again (inside a bounded loop or on the next run).
    Retryable,
    /// Retrying will not help; record it and move on.
    Permanent,
    /// Needs a human to fix configuration or persisted state.
    Operator,
}

/// Errors raised by the reconciler, the sync engines and their collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing configured field, nothing writable after projection, missing schema.
    /// Aborts the object's run and is never retried automatically.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote is not ready yet (bulk job status lookup before the job is visible).
    #[error("remote not ready: {0}")]
    TransientRemote(String),

    /// The remote rejected a record (validation rule, required field, bad value).
    #[error("rejected by remote ({status}): {message}")]
    RemoteRejection { status: u16, message: String },

    /// Network, timeout, or database connectivity failure.
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    /// Persisted cursor or schema could not be decoded.
    #[error("corrupt sync state: {0}")]
    State(String),

    /// Bulk export ended in a failure state or never finished.
    #[error("bulk export failed: {0}")]
    BulkJob(String),
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn rejection(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteRejection {
            status,
            message: message.into(),
        }
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::TransientRemote(_) | Self::Transport(_) => RetryClass::Retryable,
            Self::RemoteRejection { .. } => RetryClass::Permanent,
            Self::Configuration(_) | Self::State(_) | Self::BulkJob(_) => RetryClass::Operator,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.into())
    }
}

impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::Transport(err.into())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::State(err.to_string())
    }
}
