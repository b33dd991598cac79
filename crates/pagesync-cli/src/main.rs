use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pagesync_sync::{report_recent_markdown, store_stats, RefreshConfig, Updater};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pagesync")]
#[command(about = "Merge Graph API data and Meta CSV exports into one post table")]
struct Cli {
    /// YAML config file (defaults to ./pagesync.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extract -> normalize -> reconcile -> persist cycle.
    Refresh {
        /// Export file or directory, overriding the configured one.
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Canonical store path, overriding the configured one.
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        skip_api: bool,
        #[arg(long)]
        skip_csv: bool,
    },
    /// Summarize the canonical store.
    Stats,
    /// Print a digest of recent refresh runs.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = RefreshConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Refresh {
        csv: None,
        store: None,
        skip_api: false,
        skip_csv: false,
    }) {
        Commands::Refresh {
            csv,
            store,
            skip_api,
            skip_csv,
        } => {
            if let Some(csv) = csv {
                config.csv_export = Some(csv);
            }
            if let Some(store) = store {
                config.store_path = store;
            }
            if skip_api {
                config.access_token = None;
            }
            if skip_csv {
                config.csv_export = None;
            }
            tracing::debug!(?config, "configuration resolved");

            let summary = Updater::from_config(config)?.run_once().await?;
            println!(
                "refresh complete: run_id={} inserted={} updated={} unchanged={} skipped={} records={} reports={}",
                summary.run_id,
                summary.inserted,
                summary.updated,
                summary.unchanged,
                summary.skipped,
                summary.store_records,
                summary.reports_dir
            );
            for outcome in &summary.sources {
                println!(
                    "  {}: {:?}{}",
                    outcome.source,
                    outcome.status,
                    outcome
                        .detail
                        .as_deref()
                        .map(|d| format!(" ({d})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Stats => {
            let stats = store_stats(config.store_path.clone()).await?;
            println!("{}", stats.to_markdown());
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
