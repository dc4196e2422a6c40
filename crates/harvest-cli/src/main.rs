use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use harvest_sync::{RunOptions, SyncConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Campus data harvester: scrape, reconcile and sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every enabled source and sync it to the database.
    Run(RunArgs),
    /// List configured sources with their sync plan and last snapshot.
    Sources,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Bypass the change threshold for this run (initial bootstrap).
    #[arg(long)]
    force: bool,
    /// Only run these sources. Repeatable.
    #[arg(long = "source", value_name = "ID")]
    sources: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvest_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let report = harvest_sync::run_from_env(RunOptions {
                force: args.force,
                only: args.sources,
            })
            .await?;
            println!(
                "run complete: run_id={} sources={} records={} changes={} all_ok={}",
                report.run_id,
                report.summaries.len(),
                report.total_records(),
                report.total_changes(),
                report.all_succeeded()
            );
            if !report.all_succeeded() {
                tracing::warn!("one or more sources did not complete successfully");
            }
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            for line in harvest_sync::source_overview(&config).await? {
                println!("{line}");
            }
        }
    }

    Ok(())
}
