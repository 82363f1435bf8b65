// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use mirror_sync::{ServiceState, SyncConfig, SyncService};

#[derive(Parser)]
#[command(name = "mirror-syncd")]
#[command(about = "Keeps JSON mirrors and the MySQL change ledger in step", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file (environment variables override it)
    #[arg(short, long, env = "MIRROR_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both sync loops until ctrl-c
    Run,
    /// Apply pending ledger rows to the mirrors once
    Forward,
    /// Replay unprocessed audit log lines once
    Reverse,
    /// Seed the database from bootstrap JSON
    Upload {
        /// Directory holding stores.json, users.json, ... (defaults to the mirror dir)
        #[arg(long)]
        source: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = SyncConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting mirror-syncd");

    let mut service = SyncService::new(config);
    service.start().await.context("starting sync service")?;

    let outcome = execute(&service, cli.command).await;
    if service.state() != ServiceState::ShuttingDown {
        service.shutdown().await;
    }
    outcome
}

async fn execute(service: &SyncService, command: Commands) -> Result<()> {
    match command {
        Commands::Run => run(service).await,
        Commands::Forward => {
            let forward = service.forward()?;
            let report = forward.run_pass().await?;
            let removed = forward.cleanup_logs().await?;
            info!(
                rows = report.rows,
                applied = report.applied,
                notifications = report.notifications,
                cursor = report.cursor,
                logs_removed = removed,
                "Forward pass complete"
            );
            Ok(())
        }
        Commands::Reverse => {
            let report = service.reverse()?.run_once().await?;
            for file in &report.files {
                info!(
                    file = %file.file,
                    applied = file.applied,
                    skipped = file.skipped,
                    cursor = file.cursor,
                    failed = file.failed,
                    "Audit log replayed"
                );
            }
            if report.applied() > 0 {
                service.forward()?.run_pass().await?;
            }
            Ok(())
        }
        Commands::Upload { source } => {
            let report = service.bulk_loader(source)?.load().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn run(service: &SyncService) -> Result<()> {
    service.run()?;
    info!("Mirror sync is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    service.shutdown().await;
    Ok(())
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}
