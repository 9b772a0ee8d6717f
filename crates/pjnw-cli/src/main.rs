use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pjnw_sync::{Schedule, ScheduleRunner, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pjnw-cli")]
#[command(about = "PJN portal case-update watcher")]
struct Cli {
    /// Log at debug level instead of info.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured identity and upsert the updates.
    Run(RunArgs),
    /// Serve the operator JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Run a single pass and exit.
    #[arg(long, conflicts_with_all = ["interval", "cron"])]
    once: bool,
    /// Minutes between passes (defaults to PJN_INTERVAL_MINUTES or 15).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,
    /// Six-field cron expression, e.g. "0 */15 * * * *".
    #[arg(long, conflicts_with = "interval")]
    cron: Option<String>,
    /// Write to an in-memory store instead of Firestore.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await?,
        Commands::Serve { port, dry_run } => {
            let mut config = SyncConfig::from_env();
            config.dry_run = dry_run;
            if let Some(port) = port {
                config.web_port = port;
            }
            pjnw_web::serve(config).await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug,hyper=info,reqwest=info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = SyncConfig::from_env();
    config.dry_run = args.dry_run;
    let schedule = if args.once {
        Schedule::Once
    } else if let Some(cron) = args.cron.or_else(|| config.sync_cron.clone()) {
        Schedule::Cron(cron)
    } else {
        let minutes = args.interval.unwrap_or(config.interval_minutes).max(1);
        Schedule::Interval(Duration::from_secs(minutes * 60))
    };
    info!(identities = config.identities.len(), ?schedule, "starting pjn watcher");

    let pipeline = Arc::new(SyncPipeline::from_config(config)?);
    if schedule == Schedule::Once {
        let summary = pjnw_sync::run_once_until(&pipeline, pjnw_sync::ctrl_c_signal()).await?;
        println!(
            "sync complete: run_id={} identities={} failed_sessions={} records={} written={} elapsed={}s",
            summary.run_id,
            summary.identities,
            summary.sessions_failed,
            summary.records,
            summary.upsert.documents_written,
            summary.elapsed().num_seconds()
        );
        for outcome in &summary.outcomes {
            println!("  {}", outcome.summary);
        }
        if args.dry_run {
            let json = serde_json::to_string_pretty(&summary).context("rendering run summary")?;
            println!("{json}");
        }
        return Ok(());
    }

    ScheduleRunner::new(pipeline, schedule).run().await
}
