use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use fieldclusters::{logging, server, Config, Database};

struct Args {
    config_path: Option<PathBuf>,
    bind: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: None,
        bind: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("fieldclusters {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    parsed.bind = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --bind requires an address argument");
                    std::process::exit(1);
                }
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
        r#"fieldclusters - cluster review API for geotagged uploads

USAGE:
    fieldclusters [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --bind, -b ADDR     Listen address (overrides [server] bind)
    --version, -V       Show version
    --help, -h          Show this help message

ENDPOINTS:
    POST /merge         {{"clusters": [id, ...]}}
    POST /split         {{"cluster_id": id, "polygon": <GeoJSON>}}
    POST /update        {{"cluster_id": id, <editable fields>}}
    GET  /clusters      FeatureCollection of cluster footprints
    GET  /points        ?cluster_id=ID
    GET  /health

ENVIRONMENT:
    FIELDCLUSTERS_CONFIG   Path to config file (overrides default location)
    FIELDCLUSTERS_LOG      Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/fieldclusters/config.toml

See also: fieldclusters-daemon --help"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    logging::init("fieldclusters", &config.log_dir())?;

    let db = Database::open(&config.database).context("Failed to open database")?;
    db.initialize().context("Failed to initialize schema")?;
    info!(backend = ?config.database.backend, "Database ready");

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    let router = server::router(server::AppState::new(db));
    server::serve(listener, router).await?;

    info!("fieldclusters stopped");
    Ok(())
}
