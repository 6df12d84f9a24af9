// ABOUTME: CLI entry point for salesforce-replicator
// ABOUTME: Parses commands, loads the config file and routes to command handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use salesforce_replicator::commands;
use salesforce_replicator::config::{AppConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "salesforce-replicator")]
#[command(about = "Salesforce to PostgreSQL replication with write-back", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the replicator config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Only process these objects (comma-separated)
    #[arg(long, global = true, value_delimiter = ',')]
    objects: Vec<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the target schema and the key-value table
    Setup,
    /// Reconcile each object's table with its Salesforce describe
    SyncTables,
    /// Pull Salesforce changes into the staging tables
    Pull,
    /// Push PENDING staging rows back to Salesforce
    Push,
    /// Sync tables, pull and push, continuously or once
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Show each object's table and cursor
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Setup => commands::setup(&config).await,
        Commands::SyncTables => commands::sync_tables(&config, &cli.objects).await,
        Commands::Pull => commands::pull(&config, &cli.objects).await,
        Commands::Push => commands::push(&config, &cli.objects).await,
        Commands::Run { once } => commands::run(&config, &cli.objects, once).await,
        Commands::Status => commands::status(&config, &cli.objects).await,
    }
}
