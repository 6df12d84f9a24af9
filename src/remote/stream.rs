// ABOUTME: Pull-based page stream over a remote query and its continuation URLs
// ABOUTME: Finite and not restartable; each next_page call suspends on one fetch

use super::{QueryApi, RemoteRecord};
use crate::error::Result;

/// Lazily walks a query result set one page at a time.
///
/// The first call issues the query, later calls follow `nextRecordsUrl`
/// until the remote reports `done`.
pub struct QueryStream<'a> {
    api: &'a dyn QueryApi,
    soql: String,
    next_records_url: Option<String>,
    started: bool,
    exhausted: bool,
    total_size: Option<u64>,
}

impl<'a> QueryStream<'a> {
    pub fn new(api: &'a dyn QueryApi, soql: impl Into<String>) -> Self {
        Self {
            api,
            soql: soql.into(),
            next_records_url: None,
            started: false,
            exhausted: false,
            total_size: None,
        }
    }

    /// Total number of matching records, known after the first page.
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Fetch the next page, or `None` once the result set is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RemoteRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = if !self.started {
            self.started = true;
            self.api.query(&self.soql).await?
        } else {
            match self.next_records_url.take() {
                Some(url) => self.api.query_more(&url).await?,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        };

        if self.total_size.is_none() {
            self.total_size = Some(page.total_size);
        }

        self.next_records_url = page.next_records_url.filter(|u| !u.is_empty());
        if page.done || self.next_records_url.is_none() {
            self.exhausted = true;
        }

        if page.records.is_empty() && self.exhausted {
            return Ok(None);
        }

        Ok(Some(page.records))
    }
}
