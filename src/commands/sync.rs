// ABOUTME: Wires configuration into the PostgreSQL store, Salesforce client and SyncRunner
// ABOUTME: Each command reports per-object failures and exits non-zero when any object failed

use anyhow::{bail, Context, Result};

use crate::config::AppConfig;
use crate::postgres::{connect, kv_table_schema, PgStore};
use crate::remote::SalesforceClient;
use crate::schema::apply_schema;
use crate::sync::{CursorPosition, StateStore, SyncRunner, SyncStats};
use crate::utils::strip_password_from_url;

async fn open_store(config: &AppConfig) -> Result<PgStore> {
    let url = config.database_url()?;
    tracing::info!("Connecting to target {}", strip_password_from_url(url));
    let client = connect(url, config.postgres.allow_self_signed_certs)
        .await
        .context("Failed to connect to target database")?;
    Ok(PgStore::new(client, config.postgres.schema.clone()))
}

fn open_remote(config: &AppConfig) -> Result<SalesforceClient> {
    let client = SalesforceClient::new(
        config.instance_url()?,
        &config.salesforce.api_version,
        config.access_token()?.to_string(),
    )
    .context("Failed to create Salesforce client")?;
    Ok(client.with_page_size(config.sync.bulk_page_size))
}

async fn runner(
    config: &AppConfig,
    objects: &[String],
) -> Result<SyncRunner<SalesforceClient, PgStore>> {
    let runner_config = config.runner_config(objects)?;
    if runner_config.objects.is_empty() {
        bail!("No objects configured. Add [objects.<Name>] sections to the config file");
    }
    let remote = open_remote(config)?;
    let store = open_store(config).await?;
    Ok(SyncRunner::new(remote, store, runner_config))
}

fn report(label: &str, stats: &SyncStats) -> Result<()> {
    tracing::info!(
        "{} finished: {} objects, {} rows pulled, {} rows pushed, {} rows rejected in {}ms",
        label,
        stats.objects_synced,
        stats.rows_pulled,
        stats.rows_pushed,
        stats.row_errors,
        stats.duration_ms
    );
    if !stats.is_success() {
        for error in &stats.errors {
            tracing::error!("{}", error);
        }
        bail!("{} failed for {} object(s)", label, stats.errors.len());
    }
    Ok(())
}

/// Create the target schema and the key-value table.
pub async fn setup(config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    let applied = apply_schema(&store, &kv_table_schema())
        .await
        .context("Failed to create the key-value table")?;
    if applied.is_empty() {
        tracing::info!("Nothing to do: {} is already set up", config.postgres.schema);
    } else {
        tracing::info!("✓ Applied {} statements", applied.len());
    }
    Ok(())
}

pub async fn sync_tables(config: &AppConfig, objects: &[String]) -> Result<()> {
    let stats = runner(config, objects).await?.sync_tables().await;
    report("Table sync", &stats)
}

pub async fn pull(config: &AppConfig, objects: &[String]) -> Result<()> {
    let stats = runner(config, objects).await?.pull().await;
    report("Pull", &stats)
}

pub async fn push(config: &AppConfig, objects: &[String]) -> Result<()> {
    let stats = runner(config, objects).await?.push().await;
    report("Push", &stats)
}

/// One full cycle, or cycles at `sync_interval_secs` until Ctrl-C.
pub async fn run(config: &AppConfig, objects: &[String], once: bool) -> Result<()> {
    let runner = runner(config, objects).await?;
    if once {
        let stats = runner.run_cycle().await;
        return report("Sync cycle", &stats);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });
    runner.run(shutdown_rx).await
}

/// Print each object's persisted schema and cursor.
pub async fn status(config: &AppConfig, objects: &[String]) -> Result<()> {
    let runner_config = config.runner_config(objects)?;
    let store = open_store(config).await?;
    let state = StateStore::new(&store);

    for object in &runner_config.objects {
        let schema = state.load_schema(&object.name).await?;
        let cursor = state.load_cursor(&object.name).await?;

        let position = match cursor.as_ref().map(|c| &c.position) {
            None => "never pulled".to_string(),
            Some(CursorPosition::Watermark { last_modified }) => {
                format!("watermark {}", last_modified)
            }
            Some(CursorPosition::PendingBulkJob(job)) => format!(
                "full load in progress (job {}, {} pages / {} records loaded)",
                job.job_id, job.pages_loaded, job.records_loaded
            ),
        };
        println!(
            "{:<30} table: {:<8} {}",
            object.name,
            if schema.is_some() { "synced" } else { "missing" },
            position
        );
        if let Some(cursor) = cursor {
            println!(
                "{:<30} last run wrote {} rows at {}",
                "", cursor.last_row_count, cursor.updated_at
            );
        }
    }
    Ok(())
}
