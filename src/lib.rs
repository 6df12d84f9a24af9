// ABOUTME: Library root for salesforce-replicator
// ABOUTME: Schema reconciliation and bidirectional Salesforce/PostgreSQL sync

pub mod commands;
pub mod config;
pub mod error;
pub mod postgres;
pub mod remote;
pub mod schema;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Result, SyncError};
