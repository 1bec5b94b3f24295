//! prodsync - product record reconciliation and indexing

use anyhow::{Context, Result};
use clap::Parser;
use prodsync_common::logging::{init_logging, LogConfig, LogLevel};
use prodsync_ingest::config::{IngestConfig, DEFAULT_SNAPSHOT_PATH};
use prodsync_ingest::consumer::EnrichmentConsumer;
use prodsync_ingest::pipeline::{PipelineOptions, SyncPipeline};
use prodsync_ingest::snapshot::SnapshotStore;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "prodsync")]
#[command(author, version, about = "Reconcile product sources into a search index")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fetch every source, merge, and upload the full record set
    Sync {
        /// Upload into memory only; no snapshot or event position is written
        #[arg(long)]
        dry_run: bool,

        /// Do not read the enrichment event feed
        #[arg(long)]
        skip_events: bool,
    },

    /// Consume enrichment events until Ctrl-C
    Consume,

    /// Show the stored merge snapshot
    Inspect {
        /// Print one record with its field ranks
        #[arg(long)]
        id: Option<String>,

        /// Snapshot file
        #[arg(long, env = "PRODSYNC_SNAPSHOT_PATH", default_value = DEFAULT_SNAPSHOT_PATH)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("prodsync")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Sync {
            dry_run,
            skip_events,
        } => {
            let config = IngestConfig::from_env()?;
            let options = PipelineOptions {
                dry_run,
                skip_events,
            };
            let mut pipeline = SyncPipeline::from_config(&config, options)?;
            info!(run_id = %pipeline.run_id(), "Starting sync");

            match pipeline.run().await {
                Ok(stats) => {
                    stats.log_summary();
                    println!(
                        "Synced {} records ({} uploaded, {} conflicts, {} rejected)",
                        pipeline.engine().len(),
                        stats.records_uploaded,
                        stats.conflicts,
                        stats.records_rejected
                    );
                },
                Err(failure) => {
                    failure.statistics.log_summary();
                    error!(stage = %failure.stage, error = %failure.error, "Sync failed");
                    return Err(failure.into());
                },
            }
        },
        Command::Consume => {
            let config = IngestConfig::from_env()?;
            let mut consumer = EnrichmentConsumer::from_config(&config).await?;

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C");
                    trigger.cancel();
                }
            });

            let stats = match consumer.run(cancel).await {
                Ok(stats) => stats,
                Err(failure) => {
                    failure.statistics.log_summary();
                    error!(buffered = failure.buffered, error = %failure.error, "Consume failed");
                    return Err(failure.into());
                },
            };
            stats.log_summary();
            println!(
                "Consumed {} events ({} records uploaded, {} still buffered)",
                stats.events_consumed,
                stats.records_uploaded,
                consumer.buffered()
            );
        },
        Command::Inspect { id, snapshot } => {
            let store = SnapshotStore::new(&snapshot);
            let Some(snapshot) = store.load().await? else {
                println!("No snapshot at {}", store.path().display());
                return Ok(());
            };

            match id {
                Some(id) => {
                    let record = snapshot
                        .records
                        .iter()
                        .find(|r| r.id == id)
                        .with_context(|| format!("no record with id {}", id))?;
                    println!("{}", serde_json::to_string_pretty(record)?);
                },
                None => {
                    let fields: usize = snapshot.records.iter().map(|r| r.fields.len()).sum();
                    println!("Snapshot: {}", store.path().display());
                    println!("Version:  {}", snapshot.version);
                    println!("Taken at: {}", snapshot.taken_at);
                    println!("Records:  {}", snapshot.records.len());
                    println!("Fields:   {}", fields);
                },
            }
        },
    }

    Ok(())
}
