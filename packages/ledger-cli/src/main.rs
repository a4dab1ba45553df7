//! `ledger` - watch transcription jobs and tidy up their event logs.
//!
//! Reads the same logs the transcriber writes; never modifies a running
//! job's log.

mod cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcript_ledger::LedgerConfig;

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Inspect transcription job progress and clean up event logs")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List jobs under the output root with progress and ETA
    Jobs {
        /// Output root to scan (defaults to the configured output dir)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Heartbeat age in seconds after which a job counts as stalled
        #[arg(long)]
        stale_secs: Option<u64>,

        /// Refresh every SECS seconds until Ctrl-C
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },

    /// Replay one job's log and show its derived state
    Inspect {
        /// Job output directory containing events.jsonl
        job_dir: PathBuf,
    },

    /// Delete event logs of jobs whose final output exists
    Cleanup {
        /// Telemetry directory to sweep (defaults to the configured one)
        #[arg(long)]
        telemetry_dir: Option<PathBuf>,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = LedgerConfig::from_env().context("Failed to load ledger configuration")?;

    match cli.command {
        Commands::Jobs {
            root,
            stale_secs,
            watch,
        } => {
            let mut config = config;
            if let Some(root) = root {
                config = config.with_output_dir(root);
            }
            if let Some(secs) = stale_secs {
                config = config.with_stale_threshold(std::time::Duration::from_secs(secs));
            }
            match watch {
                Some(secs) => cmd::jobs::watch(&config, secs.max(1)).await,
                None => cmd::jobs::list(&config),
            }
        }
        Commands::Inspect { job_dir } => cmd::inspect::run(&config, &job_dir),
        Commands::Cleanup {
            telemetry_dir,
            dry_run,
        } => {
            let dir = telemetry_dir.unwrap_or_else(|| config.telemetry_dir.clone());
            let clean = cmd::cleanup::run(&dir, dry_run, cli.verbose)?;
            if !clean {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "warn,transcript_ledger=debug,ledger=debug"
    } else {
        "warn,transcript_ledger=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}
