use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mrip_storage::ProcessedFileTracker;
use mrip_sync::{dataset_status, FamilyConfig, IngestError, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mrip")]
#[command(about = "Market report ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and exit.
    Sync {
        /// Only this report family (runs even when disabled in the config).
        #[arg(long)]
        family: Option<String>,
    },
    /// Run syncs on the configured cron until interrupted (needs MRIP_SCHEDULER_ENABLED).
    Schedule,
    /// Create the per-family tracker databases.
    Migrate,
    Tracker {
        #[command(subcommand)]
        command: TrackerCommands,
    },
    /// Row and file counts per dataset partition.
    Status {
        #[arg(long)]
        family: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum TrackerCommands {
    /// Processed files, oldest first.
    List {
        #[arg(long)]
        family: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(report) = run(Cli::parse()).await {
        eprintln!("error: {report:#}");
        if let Some(ingest) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(ingest));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::ListingUnavailable { .. } => 3,
        IngestError::TrackerUnavailable { .. } => 4,
        IngestError::RunLocked(_) => 5,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { family: None }) {
        Commands::Sync { family } => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_once(family.as_deref()).await?;
            println!(
                "sync complete: run_id={} discovered={} downloaded={} processed={} rows_written={} rows_dropped={} failures={} reports={}",
                summary.run_id,
                summary.files_discovered(),
                summary.files_downloaded(),
                summary.files_processed(),
                summary.rows_written(),
                summary.rows_dropped(),
                summary.failures_by_stage().values().sum::<usize>(),
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
                println!("scheduler disabled; set MRIP_SCHEDULER_ENABLED=true to run on {cron}");
                return Ok(());
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let pipeline = SyncPipeline::new(config)?;
            for family in &pipeline.reports().families {
                let tracker = open_tracker(pipeline.config(), family).await?;
                let count = tracker.count().await?;
                tracker.close().await;
                println!("{}: tracker ready ({count} processed files)", family.id);
            }
        }
        Commands::Tracker {
            command: TrackerCommands::List { family },
        } => {
            let pipeline = SyncPipeline::new(config)?;
            for family in pipeline.selected_families(family.as_deref())? {
                let tracker = open_tracker(pipeline.config(), &family).await?;
                for record in tracker.list().await? {
                    println!(
                        "{}\t{}\t{}",
                        family.id,
                        record.processed_at.to_rfc3339(),
                        record.filename
                    );
                }
                tracker.close().await;
            }
        }
        Commands::Status { family } => {
            let pipeline = SyncPipeline::new(config)?;
            for family in pipeline.selected_families(family.as_deref())? {
                let partitions = dataset_status(&pipeline.config().dataset_dir(&family.id))?;
                let rows = partitions.iter().map(|p| p.rows).sum::<i64>();
                println!("{}: {} partitions, {rows} rows", family.id, partitions.len());
                for partition in partitions {
                    println!(
                        "  {}\tfiles={}\trows={}",
                        partition.partition, partition.files, partition.rows
                    );
                }
            }
        }
    }

    Ok(())
}

async fn open_tracker(config: &SyncConfig, family: &FamilyConfig) -> Result<ProcessedFileTracker> {
    ProcessedFileTracker::open(config.tracker_path(&family.id))
        .await
        .map_err(|source| {
            IngestError::TrackerUnavailable {
                family: family.id.clone(),
                source,
            }
            .into()
        })
}
