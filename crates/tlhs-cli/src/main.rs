use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tlhs_core::SyncDecision;
use tlhs_sync::{RunOutcome, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tlhs-cli")]
#[command(about = "Teamleader to HubSpot sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the OAuth callback, sync trigger and status endpoints.
    Serve,
    /// Run one sync in the foreground using TEAMLEADER_TOKEN.
    Sync,
    /// Summarize the action log as markdown.
    Report {
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => tlhs_web::serve_from_env().await?,
        Commands::Sync => {
            let summary = tlhs_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: run_id={} pages={} created={} updated={} errors={}",
                match summary.outcome {
                    RunOutcome::Completed => "complete",
                    RunOutcome::Aborted => "aborted",
                },
                summary.run_id,
                summary.pages,
                summary.count(SyncDecision::Created),
                summary.count(SyncDecision::Updated),
                summary.count(SyncDecision::Error),
            );
            if let Some(err) = summary.error {
                anyhow::bail!("run aborted: {err}");
            }
        }
        Commands::Report { log, runs } => {
            let path = log.unwrap_or_else(|| SyncConfig::from_env().log_path);
            let md = tlhs_sync::report_from_log(&path, runs).await?;
            println!("{md}");
        }
    }

    Ok(())
}
