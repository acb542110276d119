//! Background clustering for fieldclusters.
//!
//! Newly ingested files arrive without a cluster. Each pass assigns them to
//! nearby open clusters (or opens new ones) and merges open clusters whose
//! files overlap in time and space. The daemon shares the database with the
//! HTTP server; a pass that loses a race with an operator's merge or split
//! is rolled back and retried on the next cycle.
//!
//! ## Usage
//!
//! ```bash
//! fieldclusters-daemon              # Run in foreground
//! fieldclusters-daemon --once       # Run a single pass and exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use fieldclusters::{cluster, logging, Config, Database};

#[derive(Default)]
struct DaemonArgs {
    /// Overrides `[clustering] poll_interval_secs`
    poll_interval: Option<u64>,
    once: bool,
    config_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    logging::init("fieldclusters-daemon", &config.log_dir())?;
    info!("fieldclusters daemon starting...");

    let db = Database::open(&config.database).context("Failed to open database")?;
    db.initialize().context("Failed to initialize schema")?;
    info!(backend = ?config.database.backend, "Database opened");

    if args.once {
        info!("Running in single-shot mode");
        run_once(&db, &config)?;
    } else {
        let interval = args
            .poll_interval
            .unwrap_or(config.clustering.poll_interval_secs);
        info!("Running in daemon mode, polling every {} seconds", interval);
        run_daemon_loop(&db, &config, interval);
    }

    info!("fieldclusters daemon stopped");
    Ok(())
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = DaemonArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                parsed.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(interval) => parsed.poll_interval = Some(interval),
                        Err(_) => {
                            eprintln!("Error: --interval expects a number of seconds");
                            std::process::exit(1);
                        }
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"fieldclusters-daemon - Background clustering of new uploads

USAGE:
    fieldclusters-daemon [OPTIONS]

OPTIONS:
    --once, -1          Run one clustering pass and exit
    --interval, -i N    Poll interval in seconds (default: [clustering] poll_interval_secs)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    FIELDCLUSTERS_CONFIG   Path to config file (overrides default location)
    FIELDCLUSTERS_LOG      Log level (trace, debug, info, warn, error)

Each pass:
  - assigns unclustered files with a position and capture time to the
    nearest open cluster within the time and distance thresholds
  - opens new clusters for files that fit nowhere
  - merges open clusters whose files overlap
Clusters marked readyforsigma are left alone.
"#
    );
}

fn run_once(db: &Database, config: &Config) -> Result<()> {
    let summary = cluster::run_pass(db, &config.clustering).context("Clustering pass failed")?;
    if summary.is_empty() {
        info!("No unclustered files");
    }
    Ok(())
}

fn run_daemon_loop(db: &Database, config: &Config, poll_interval: u64) {
    loop {
        match cluster::run_pass(db, &config.clustering) {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!("Clustering pass lost a concurrent update, retrying next cycle: {}", e);
            }
            Err(e) => {
                error!("Clustering pass failed: {}", e);
            }
        }

        thread::sleep(Duration::from_secs(poll_interval));
    }
}
