//! # Soundboard CLI (`soundboard`)
//!
//! Runs the chart maintenance job by hand or starts the trigger server.
//!
//! ## Usage
//!
//! ```bash
//! soundboard --config ./config/soundboard.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `soundboard maintain --mode <update\|deploy\|refresh>` | One maintenance run |
//! | `soundboard fetch --start <date> --end <date>` | Download a chart range only |
//! | `soundboard status` | Remote freshness marker and whether an update is due |
//! | `soundboard serve` | Start the trigger and views HTTP server |

use std::path::PathBuf;

use anyhow::bail;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};

use soundboard::charts::FetchOutcome;
use soundboard::config;
use soundboard::dates::parse_iso_date;
use soundboard::logging::init_logging;
use soundboard::maintain::{MaintenanceOutcome, Maintainer, Mode};
use soundboard::server;

/// Soundboard: weekly Spotify chart maintenance.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/soundboard.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "soundboard",
    about = "Weekly Spotify chart dataset maintenance",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/soundboard.toml")]
    config: PathBuf,

    /// Log at debug level unless LOG_LEVEL says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the maintenance job once.
    Maintain {
        /// `update` (default), `deploy` or `refresh`.
        #[arg(long, default_value = "update")]
        mode: String,

        /// Pretend today is this date (YYYY-MM-DD).
        #[arg(long)]
        today: Option<String>,
    },

    /// Download weekly charts for a date range into the scratch directory.
    Fetch {
        /// First week start (YYYY-MM-DD); rounded down to a Friday.
        #[arg(long)]
        start: String,

        /// Last week end (YYYY-MM-DD).
        #[arg(long)]
        end: String,

        /// Limit to these country codes (repeatable). Defaults to all
        /// configured countries.
        #[arg(long = "country")]
        countries: Vec<String>,
    },

    /// Show the remote dataset's freshness marker.
    Status {
        #[arg(long)]
        today: Option<String>,
    },

    /// Start the trigger and dashboard views HTTP server.
    Serve,
}

fn today_or(value: Option<&str>) -> anyhow::Result<NaiveDate> {
    match value {
        Some(s) => parse_iso_date(s),
        None => Ok(Utc::now().date_naive()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Maintain { mode, today } => {
            let mode: Mode = mode.parse()?;
            let today = today_or(today.as_deref())?;
            let maintainer = Maintainer::from_config(cfg);
            let outcome = maintainer.run(mode, today).await;
            println!("{}", outcome);
            if let MaintenanceOutcome::Failed { reason } = outcome {
                bail!("maintenance run failed: {}", reason);
            }
        }
        Commands::Fetch {
            start,
            end,
            countries,
        } => {
            let start = parse_iso_date(&start)?;
            let end = parse_iso_date(&end)?;
            if end < start {
                bail!("--end must not be before --start");
            }
            let charts_dir = cfg.paths.charts_dir();
            let maintainer = Maintainer::from_config(cfg);
            let countries = (!countries.is_empty()).then_some(countries);
            match maintainer.fetch(start, end, countries.as_deref()).await? {
                FetchOutcome::Unavailable => println!("chart data unavailable for {}", start),
                FetchOutcome::Completed(summary) => println!(
                    "{} written, {} already present, {} failed → {}",
                    summary.written,
                    summary.existing,
                    summary.failed,
                    charts_dir.display()
                ),
            }
        }
        Commands::Status { today } => {
            let today = today_or(today.as_deref())?;
            let bucket = cfg.storage.bucket.clone();
            let key = cfg.storage.dataset_key.clone();
            let freshness = Maintainer::from_config(cfg).freshness(today).await;
            match freshness.last_data_date {
                Some(date) => println!("s3://{}/{}: last data {}", bucket, key, date),
                None => println!("s3://{}/{}: no dataset or marker", bucket, key),
            }
            println!(
                "update due: {}",
                if freshness.update_due { "yes" } else { "no" }
            );
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
