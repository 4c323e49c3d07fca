use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mfr_sync::{build_pipeline, connect_warehouse, FeedRegistry, JobConfig};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "mfr-cli")]
#[command(about = "Metric feed ingest and reconcile job")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process every enabled feed once.
    Run {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply warehouse migrations.
    Migrate,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// List configured feeds.
    Feeds,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    let cli = Cli::parse();
    let config = JobConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let pipeline = build_pipeline(config).await?;
            let summary = pipeline.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let processed: usize = summary.feeds.iter().map(|f| f.processed).sum();
                println!(
                    "run complete: run_id={} feeds={} files={} changed={}",
                    summary.run_id,
                    summary.feeds.len(),
                    processed,
                    summary.data_changed
                );
            }
        }
        Commands::Migrate => {
            let pool = connect_warehouse(&config).await?;
            mfr_warehouse::run_migrations(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline(config).await?);
            let cron = pipeline.config().schedule_cron.clone();
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Feeds => {
            let registry = FeedRegistry::load(&config.feeds_file).await?;
            for feed in &registry.feeds {
                println!(
                    "{}\t{}\t{}/{}\tstaging={}\ttarget={}\tarchive={}",
                    feed.name,
                    if feed.enabled { "enabled" } else { "disabled" },
                    feed.storage,
                    feed.source_path,
                    feed.staging_table,
                    feed.target
                        .as_ref()
                        .map(|t| t.table.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    feed.archive_path.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}
