use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phishfeed_storage::FeedStore;
use phishfeed_sync::{CollectorConfig, RunOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "phishfeed")]
#[command(about = "Incremental phishing feed collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest records newer than the stored last id (default).
    Ingest,
    /// Show the stored last id and table sizes.
    Status,
    /// Create the database file and tables without ingesting.
    InitDb,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = phishfeed_sync::run_ingest_once_from_env().await?;
            let result = match &summary.outcome {
                RunOutcome::NothingToDo => "nothing to do".to_string(),
                RunOutcome::NoValidRecords => "no valid records".to_string(),
                RunOutcome::Ingested {
                    persisted,
                    new_last_id,
                    cursor_advanced,
                } => format!(
                    "persisted={persisted} new_last_id={new_last_id} cursor_advanced={cursor_advanced}"
                ),
                RunOutcome::ScanFailed { error } => format!("scan failed: {error}"),
                RunOutcome::PersistFailed { error } => format!("persist failed: {error}"),
            };
            println!(
                "ingest complete: run_id={} shards={} skipped={} selected={} rejected={} {}",
                summary.run_id,
                summary.shards_found,
                summary.shards_skipped,
                summary.selected,
                summary.rejected,
                result
            );
        }
        Commands::Status => {
            let config = CollectorConfig::from_env()?;
            let store = FeedStore::open(&config.database_path)
                .await
                .with_context(|| format!("opening {}", config.database_path.display()))?;
            let status = store.status().await;
            store.close().await;
            let status = status?;
            let last_id = status
                .last_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unset".to_string());
            println!(
                "store {}: last_id={} records={} queued={}",
                config.database_path.display(),
                last_id,
                status.records,
                status.queued
            );
        }
        Commands::InitDb => {
            let config = CollectorConfig::from_env()?;
            let store = FeedStore::open(&config.database_path)
                .await
                .with_context(|| format!("opening {}", config.database_path.display()))?;
            store.close().await;
            println!("initialized {}", config.database_path.display());
        }
    }

    Ok(())
}
