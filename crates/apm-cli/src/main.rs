use anyhow::Result;
use apm_sync::{build_cycle, MonitorConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "apm_core=info,apm_storage=info,apm_adapters=info,apm_sync=info,apm_web=info,apm_cli=info,warn";

#[derive(Debug, Parser)]
#[command(name = "apm-cli")]
#[command(about = "arXiv paper monitor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web dashboard and the fetch scheduler.
    Serve,
    /// Run one fetch cycle and exit.
    Fetch,
    /// Print the outcome of the most recent cycle.
    Status,
    /// List stored papers, newest update first.
    List {
        #[arg(long)]
        new_only: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Clear the new flag on every stored paper.
    MarkSeen,
    /// Delete all stored papers and seen ids.
    Clear,
    /// Print the category configuration as JSON.
    Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    let cycle = || build_cycle(&config);

    let command = cli.command.unwrap_or(Commands::Serve);
    info!(?command, "running command");

    match command {
        Commands::Serve => apm_web::serve(config.clone()).await?,
        Commands::Fetch => {
            let report = cycle()?.trigger().await?;
            println!(
                "fetch complete: found={} new={} failed_categories={}",
                report.records_found,
                report.new_records,
                report.failed_categories.len()
            );
            for failure in &report.failed_categories {
                println!("  skipped {}: {}", failure.category, failure.message);
            }
        }
        Commands::Status => {
            let status = cycle()?.status().await?;
            let last = status
                .last_fetch_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!("status={} last_fetch={} {}", status.status.as_str(), last, status.message);
        }
        Commands::List { new_only, limit } => {
            let records = cycle()?.list_records().await?;
            let rows = records
                .iter()
                .filter(|r| !new_only || r.is_new)
                .take(limit.unwrap_or(usize::MAX));
            for record in rows {
                println!(
                    "{}{}  {}  {}",
                    if record.is_new { "* " } else { "  " },
                    record.identifier,
                    record.updated_at.format("%Y-%m-%d"),
                    record.title
                );
            }
        }
        Commands::MarkSeen => {
            let cleared = cycle()?.mark_all_seen().await?;
            println!("marked {cleared} papers as seen");
        }
        Commands::Clear => {
            cycle()?.clear_all().await?;
            println!("all data cleared");
        }
        Commands::Config => {
            let categories = cycle()?.config().await?;
            println!("{}", serde_json::to_string_pretty(&categories)?);
        }
    }

    Ok(())
}
