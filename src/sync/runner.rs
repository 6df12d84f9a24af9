// ABOUTME: SyncRunner - per-object orchestration of schema sync, pull and push
// ABOUTME: Isolates failures per object and runs cycles at a fixed interval until shutdown

use super::inbound::{InboundSettings, InboundSync};
use super::outbound::OutboundSync;
use super::state::StateStore;
use crate::error::Result;
use crate::postgres::{KvStore, TargetStore};
use crate::remote::RemoteApi;
use crate::schema::{apply_schema, CommonField, ObjectRules, SchemaReconciler};
use futures::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tokio::time::interval;

/// One configured remote object.
#[derive(Debug, Clone, Default)]
pub struct SyncObject {
    pub name: String,
    pub fields: Vec<String>,
    pub rules: ObjectRules,
}

/// Configuration for the SyncRunner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub objects: Vec<SyncObject>,
    pub common_fields: Vec<CommonField>,
    pub inbound: InboundSettings,
    /// Interval between cycles in continuous mode
    pub sync_interval: Duration,
    /// Objects processed at the same time; each object is owned by one task
    pub max_concurrent_objects: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            common_fields: crate::schema::table::default_common_fields(),
            inbound: InboundSettings::default(),
            sync_interval: Duration::from_secs(3600), // 1 hour
            max_concurrent_objects: 1,
        }
    }
}

/// Statistics from one pass over the configured objects.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub objects_synced: usize,
    pub rows_pulled: u64,
    pub rows_pushed: u64,
    /// Rows the remote rejected and that were marked ERROR.
    pub row_errors: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Check if every object completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Tables,
    Pull,
    Push,
    Cycle,
}

impl Phase {
    fn tables(self) -> bool {
        matches!(self, Phase::Tables | Phase::Cycle)
    }

    fn pull(self) -> bool {
        matches!(self, Phase::Pull | Phase::Cycle)
    }

    fn push(self) -> bool {
        matches!(self, Phase::Push | Phase::Cycle)
    }
}

#[derive(Debug, Default)]
struct ObjectReport {
    rows_pulled: u64,
    rows_pushed: u64,
    row_errors: u64,
}

/// SyncRunner drives the schema, inbound and outbound engines.
///
/// Every phase runs per object. An object that fails is recorded in
/// [`SyncStats::errors`] and the remaining objects still run.
pub struct SyncRunner<R, S> {
    remote: R,
    store: S,
    config: RunnerConfig,
}

impl<R, S> SyncRunner<R, S>
where
    R: RemoteApi,
    S: TargetStore + KvStore,
{
    pub fn new(remote: R, store: S, config: RunnerConfig) -> Self {
        Self {
            remote,
            store,
            config,
        }
    }

    fn state(&self) -> StateStore<'_> {
        StateStore::new(&self.store)
    }

    /// Reconcile and apply every object's table.
    pub async fn sync_tables(&self) -> SyncStats {
        self.run_phase(Phase::Tables).await
    }

    /// Pull remote changes for every object.
    pub async fn pull(&self) -> SyncStats {
        self.run_phase(Phase::Pull).await
    }

    /// Push pending rows for every object.
    pub async fn push(&self) -> SyncStats {
        self.run_phase(Phase::Push).await
    }

    /// Schema sync, pull and push for every object.
    pub async fn run_cycle(&self) -> SyncStats {
        self.run_phase(Phase::Cycle).await
    }

    /// Run cycles at the configured interval until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut ticker = interval(self.config.sync_interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting SyncRunner for {} objects with sync_interval={:?}",
            self.config.objects.len(),
            self.config.sync_interval
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncRunner");
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    tracing::info!("Starting sync cycle {}", cycles);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during sync cycle, aborting");
                            break;
                        }
                        stats = self.run_cycle() => {
                            tracing::info!(
                                "Sync cycle {} completed: {} objects, {} rows pulled, {} rows pushed in {}ms",
                                cycles,
                                stats.objects_synced,
                                stats.rows_pulled,
                                stats.rows_pushed,
                                stats.duration_ms
                            );
                            if !stats.is_success() {
                                tracing::warn!("Sync cycle had {} errors", stats.errors.len());
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_phase(&self, phase: Phase) -> SyncStats {
        let start = Instant::now();
        let mut stats = SyncStats::default();

        let results: Vec<(&str, Result<ObjectReport>)> = stream::iter(&self.config.objects)
            .map(|object| async move { (object.name.as_str(), self.process(object, phase).await) })
            .buffer_unordered(self.config.max_concurrent_objects.max(1))
            .collect()
            .await;

        for (name, result) in results {
            match result {
                Ok(report) => {
                    stats.objects_synced += 1;
                    stats.rows_pulled += report.rows_pulled;
                    stats.rows_pushed += report.rows_pushed;
                    stats.row_errors += report.row_errors;
                }
                Err(e) => {
                    // Log with :? to show the variant alongside the message
                    tracing::error!("Failed to sync {}: {:?}", name, e);
                    if e.is_configuration() {
                        tracing::error!("{} needs operator attention: {}", name, e);
                    }
                    stats.errors.push(format!("Failed to sync {}: {}", name, e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    async fn process(&self, object: &SyncObject, phase: Phase) -> Result<ObjectReport> {
        let mut report = ObjectReport::default();

        if phase.tables() {
            self.sync_table(object).await?;
        }

        if phase.pull() {
            let inbound = InboundSync::new(
                &self.remote,
                &self.remote,
                &self.store,
                self.state(),
                &self.config.inbound,
            );
            let outcome = inbound.sync_object(&object.name, &object.fields).await?;
            report.rows_pulled = outcome.rows;
        }

        if phase.push() {
            let outbound = OutboundSync::new(&self.remote, &self.store, self.state());
            let outcome = outbound.sync_object(&object.name).await?;
            report.rows_pushed = outcome.pushed();
            report.row_errors = outcome.failed;
        }

        Ok(report)
    }

    async fn sync_table(&self, object: &SyncObject) -> Result<()> {
        let mut reconciler = SchemaReconciler::new(&self.remote);
        let schema = reconciler
            .reconcile(
                &object.name,
                &object.fields,
                &self.config.common_fields,
                &object.rules,
            )
            .await?;

        let applied = apply_schema(&self.store, &schema).await?;
        self.state().save_schema(&schema).await?;

        if applied.is_empty() {
            tracing::debug!("Table {} already up to date", schema.table);
        } else {
            tracing::info!("Applied {} DDL statements for {}", applied.len(), object.name);
        }
        Ok(())
    }
}
