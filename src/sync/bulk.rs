// ABOUTME: Bulk export state machine - submit, poll with a wall-clock ceiling, then page results
// ABOUTME: Job id, locator and running max watermark are persisted so restarts resume the same job

use super::state::{max_watermark, PendingBulkJob, StateStore, SyncCursor};
use crate::error::{Result, SyncError};
use crate::remote::{BulkExportApi, JobState, RemoteRecord};
use crate::schema::table::{SYNC_MESSAGE, SYNC_STATUS, SYNC_UPDATE_TIMESTAMP};
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to do when a job is still running at the poll ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTimeoutPolicy {
    /// Abort with `SyncError::BulkJob`, keeping the job for the next run.
    #[default]
    Fail,
    /// Log a warning and page whatever results are available.
    Proceed,
}

#[derive(Debug, Clone)]
pub struct BulkExportConfig {
    pub poll_interval: Duration,
    pub poll_ceiling: Duration,
    pub on_timeout: PollTimeoutPolicy,
}

impl Default for BulkExportConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            poll_ceiling: Duration::from_secs(90 * 60),
            on_timeout: PollTimeoutPolicy::Fail,
        }
    }
}

/// Lifecycle of one export as seen by this process. An object with no
/// pending job in its cursor has not submitted one yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkPhase {
    Queued,
    InProgress,
    JobComplete,
    Failed(String),
}

/// One normalized page of export results.
#[derive(Debug, Clone)]
pub struct ExportPage {
    /// Rows with lower-cased keys and sync metadata prepended.
    pub rows: Vec<RemoteRecord>,
    pub record_count: u64,
    /// Locator for the following page, `None` on the last page.
    pub next_locator: Option<String>,
}

/// Drives one full-object export for one object.
pub struct BulkExport<'a> {
    api: &'a dyn BulkExportApi,
    state: StateStore<'a>,
    config: &'a BulkExportConfig,
    object: String,
    watermark_column: String,
    job: PendingBulkJob,
    phase: BulkPhase,
    exhausted: bool,
}

impl<'a> BulkExport<'a> {
    /// Resume the persisted job for `object`, or submit a new export and
    /// persist its id before anything else happens.
    pub async fn start(
        api: &'a dyn BulkExportApi,
        state: StateStore<'a>,
        config: &'a BulkExportConfig,
        object: &str,
        soql: &str,
        watermark_field: &str,
        resume: Option<PendingBulkJob>,
    ) -> Result<BulkExport<'a>> {
        let (job, phase) = match resume {
            Some(job) => {
                info!(
                    "Resuming bulk export {} for {} ({} page(s) already loaded)",
                    job.job_id, object, job.pages_loaded
                );
                let phase = if job.has_loaded_pages() {
                    BulkPhase::JobComplete
                } else {
                    BulkPhase::Queued
                };
                (job, phase)
            }
            None => {
                let job_id = api.submit_export(object, soql).await?;
                info!("Submitted bulk export {} for {}", job_id, object);
                let job = PendingBulkJob::new(job_id);
                state.save_cursor(&SyncCursor::pending(object, job.clone())).await?;
                (job, BulkPhase::Queued)
            }
        };

        Ok(BulkExport {
            api,
            state,
            config,
            object: object.to_string(),
            watermark_column: watermark_field.to_lowercase(),
            job,
            phase,
            exhausted: false,
        })
    }

    pub fn job(&self) -> &PendingBulkJob {
        &self.job
    }

    pub fn phase(&self) -> &BulkPhase {
        &self.phase
    }

    /// Poll until the job completes, fails, or the ceiling is reached.
    ///
    /// Not-ready status checks are retried; any other error aborts and leaves
    /// the persisted job in place. A failed job is forgotten so the next run
    /// submits a fresh export.
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        if self.phase == BulkPhase::JobComplete {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            match self.api.poll_status(&self.job.job_id).await {
                Ok(JobState::JobComplete) => {
                    info!("Bulk export {} for {} complete", self.job.job_id, self.object);
                    self.phase = BulkPhase::JobComplete;
                    return Ok(());
                }
                Ok(JobState::Failed(reason)) => {
                    self.phase = BulkPhase::Failed(reason.clone());
                    self.state.clear_cursor(&self.object).await?;
                    return Err(SyncError::BulkJob(format!(
                        "job {} for {}: {}",
                        self.job.job_id, self.object, reason
                    )));
                }
                Ok(JobState::Queued) => self.phase = BulkPhase::Queued,
                Ok(JobState::InProgress) => self.phase = BulkPhase::InProgress,
                Err(SyncError::TransientRemote(message)) => {
                    warn!(
                        "Bulk export {} not ready yet ({}), polling again",
                        self.job.job_id, message
                    );
                }
                Err(e) => return Err(e),
            }

            if started.elapsed() >= self.config.poll_ceiling {
                return self.on_ceiling();
            }

            debug!(
                "Bulk export {} is {:?}, next check in {:?}",
                self.job.job_id, self.phase, self.config.poll_interval
            );
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn on_ceiling(&mut self) -> Result<()> {
        match self.config.on_timeout {
            PollTimeoutPolicy::Fail => Err(SyncError::BulkJob(format!(
                "job {} for {} still {:?} after {:?}; it will be resumed on the next run",
                self.job.job_id, self.object, self.phase, self.config.poll_ceiling
            ))),
            PollTimeoutPolicy::Proceed => {
                warn!(
                    "Bulk export {} for {} still {:?} after {:?}; loading available results",
                    self.job.job_id, self.object, self.phase, self.config.poll_ceiling
                );
                self.phase = BulkPhase::JobComplete;
                Ok(())
            }
        }
    }

    /// Fetch and normalize the next result page, `None` after the last one.
    ///
    /// The page is not recorded as loaded until [`commit_page`](Self::commit_page).
    pub async fn next_page(&mut self) -> Result<Option<ExportPage>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.phase != BulkPhase::JobComplete {
            return Err(SyncError::BulkJob(format!(
                "job {} paged before completion ({:?})",
                self.job.job_id, self.phase
            )));
        }

        let page = self
            .api
            .fetch_result_page(&self.job.job_id, self.job.locator.as_deref())
            .await?;
        let next_locator = page.next_locator.filter(|l| !l.is_empty() && l != "null");
        if next_locator.is_none() {
            self.exhausted = true;
        }

        let stamp = Utc::now().naive_utc().to_string();
        let provenance = serde_json::json!({
            "command": "cleanSync",
            "jobId": self.job.job_id,
        })
        .to_string();

        let rows = page
            .rows
            .into_iter()
            .map(|raw| normalize_row(raw, &stamp, &provenance))
            .collect();

        Ok(Some(ExportPage {
            rows,
            record_count: page.record_count,
            next_locator,
        }))
    }

    /// Record a loaded page: advance the locator, fold in the page's max
    /// watermark and persist the job so a restart resumes after this page.
    pub async fn commit_page(&mut self, page: &ExportPage) -> Result<()> {
        for row in &page.rows {
            if let Some(Some(stamp)) = row.get(&self.watermark_column) {
                self.job.max_watermark = max_watermark(self.job.max_watermark.take(), stamp);
            }
        }
        self.job.locator = page.next_locator.clone();
        self.job.pages_loaded += 1;
        self.job.records_loaded += page.rows.len() as u64;

        if page.next_locator.is_some() {
            self.state
                .save_cursor(&SyncCursor::pending(&self.object, self.job.clone()))
                .await?;
        }
        Ok(())
    }

    /// Replace the pending job with the final watermark in a single write.
    ///
    /// An export that returned no rows falls back to the submission time.
    pub async fn finish(self) -> Result<SyncCursor> {
        let watermark = self
            .job
            .max_watermark
            .clone()
            .unwrap_or_else(|| super::state::format_watermark(self.job.submitted_at));
        let mut cursor = SyncCursor::watermark(&self.object, watermark);
        cursor.last_row_count = self.job.records_loaded;
        self.state.save_cursor(&cursor).await?;
        info!(
            "Full load of {} finished: {} record(s) in {} page(s), watermark {}",
            self.object,
            self.job.records_loaded,
            self.job.pages_loaded,
            cursor.last_modified().unwrap_or_default()
        );
        Ok(cursor)
    }
}

/// Lower-case field names and prepend the sync metadata columns.
pub fn normalize_row(raw: RemoteRecord, stamp: &str, provenance: &str) -> RemoteRecord {
    let mut row = RemoteRecord::new();
    row.insert(SYNC_UPDATE_TIMESTAMP.to_string(), Some(stamp.to_string()));
    row.insert(SYNC_STATUS.to_string(), Some("SYNCED".to_string()));
    row.insert(SYNC_MESSAGE.to_string(), Some(provenance.to_string()));
    for (key, value) in raw {
        row.insert(key.to_lowercase(), value);
    }
    row
}
