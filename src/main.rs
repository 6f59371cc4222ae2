//! `bucketsync`: keeps a catalog of a source bucket and copies what changed to a destination.
//!
//! # Usage
//!
//! ```bash
//! bucketsync --project backup update-list
//! bucketsync --project backup sync --workers 8
//! bucketsync --project backup status --errors 20
//! ```
//!
//! `RUST_LOG` controls log verbosity (default: `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bucketsync_engine::execution::status::{DEFAULT_RECENT_ERRORS, human_size};
use bucketsync_engine::ops::interface::StorageError;
use bucketsync_engine::settings::{DEFAULT_CONFIG_PATH, Settings};
use bucketsync_engine::{RunFailed, SyncService};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Resumable, catalog-driven bucket synchronization
#[derive(Parser)]
#[command(name = "bucketsync")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "BUCKETSYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Project to operate on
    #[arg(short, long)]
    project: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the source and merge the listing into the catalog
    UpdateList,

    /// Add entries from an `mc ls --json` listing without touching known ones
    Import {
        /// JSON-lines listing, keys relative to the source folder
        file: PathBuf,
    },

    /// Copy every object that is pending or failed last time
    Sync {
        /// Number of concurrent copy workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show the status distribution and the most recent failures
    Status {
        /// How many recent failures to list
        #[arg(short, long, default_value_t = DEFAULT_RECENT_ERRORS)]
        errors: usize,
    },
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing in-flight work; press Ctrl-C again to abort");
            token.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });
    cancel
}

async fn print_status(service: &SyncService, errors: usize) -> Result<()> {
    let counts = service.status_counts().await?;
    println!("Project: {}", service.project());
    if counts.is_empty() {
        println!("  catalog is empty, run `update-list` first");
    }
    let (mut total_count, mut total_size) = (0, 0);
    for count in &counts {
        println!(
            "  {:<10} {:>10} files {:>12}",
            count.status.as_str(),
            count.count,
            human_size(count.total_size)
        );
        total_count += count.count;
        total_size += count.total_size;
    }
    println!(
        "  {:<10} {:>10} files {:>12}",
        "total",
        total_count,
        human_size(total_size)
    );

    if errors > 0 {
        let recent = service.recent_errors(errors).await?;
        if !recent.is_empty() {
            println!();
            println!("Recent errors:");
            for entry in recent {
                println!(
                    "  {} [{}]: {}",
                    entry.path,
                    entry.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(&cli.config)?;
    let service = SyncService::open(&settings, &cli.project)
        .await
        .with_context(|| format!("Failed to open project `{}`", cli.project))?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Command::UpdateList => {
            let stats = service.reconcile(&cancel).await?;
            println!("{stats}");
        }
        Command::Import { file } => {
            let stats = service.import_file(&file, &cancel).await?;
            println!("{stats}");
        }
        Command::Sync { workers } => {
            let workers = workers.unwrap_or(service.default_workers());
            let summary = service.run(workers, &cancel).await?;
            println!("{summary}");
        }
        Command::Status { errors } => print_status(&service, errors).await?,
    }
    service.catalog().close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(failed) = err.downcast_ref::<RunFailed>() {
                eprintln!("error: {failed}");
                eprintln!("run `status` to see the failed objects");
            } else if err.downcast_ref::<StorageError>() == Some(&StorageError::Cancelled) {
                eprintln!("cancelled");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
