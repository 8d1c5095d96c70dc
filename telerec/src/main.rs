//! telerec: broadcast television recording server.
//!
//! Loads the channel/tuner configuration, opens the EPG store and runs
//! the recording scheduler until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use telerec::capture::ProcessGraph;
use telerec::config::{ChannelMap, Config};
use telerec::database::{Database, DatabaseHandle};
use telerec::logging;
use telerec::scheduler::Recorder;

/// telerec - broadcast television recording server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Path to the database file
    #[arg(short, long, default_value = "telerec.db")]
    database: PathBuf,

    /// Directory where recordings are stored
    #[arg(short, long, default_value = "recordings")]
    recording_dir: PathBuf,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file: explicit path > telerec.toml next to the binary.
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("telerec.toml");
        default_path.exists().then_some(default_path)
    });
    let config = match &config_path {
        Some(path) => match Config::load(path) {
            Ok(config) => {
                eprintln!("Loaded config from: {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => Config::default(),
    };

    logging::init_logging(&args.log_dir, args.log_retention_days, args.verbose)
        .expect("Failed to initialize logging");

    let db_path = config
        .server
        .database
        .clone()
        .unwrap_or_else(|| args.database.clone());
    let recording_dir = config
        .server
        .recording_dir
        .clone()
        .unwrap_or_else(|| args.recording_dir.clone());

    info!("Opening database: {:?}", db_path);
    let db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };
    let db: DatabaseHandle = Arc::new(tokio::sync::Mutex::new(db));

    if let Err(e) = std::fs::create_dir_all(&recording_dir) {
        error!(
            "Failed to create recording directory {:?}: {}",
            recording_dir, e
        );
        return Err(e.into());
    }

    let map = Arc::new(ChannelMap::new(&config));
    info!(
        "Configured {} channels on {} tuners",
        map.channels().len(),
        map.ranked_tuners().len()
    );
    if map.ranked_tuners().is_empty() {
        warn!("No tuners configured; nothing will be recorded");
    }

    let capture_command = config.capture.command.as_deref().unwrap_or_default();
    if capture_command.is_empty() {
        warn!("No capture command configured; captures will fail until one is set");
    }
    let graph = Arc::new(ProcessGraph::new(capture_command));

    // Sweep out-of-history rows once an hour.
    let clean_db = db.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            tick.tick().await;
            let db = clean_db.lock().await;
            if let Err(e) = db.clean(chrono::Utc::now()) {
                warn!("Database clean failed: {}", e);
            }
        }
    });

    let recorder = Recorder::new(map, db, graph, recording_dir);
    let (handle, join) = recorder.spawn();

    info!("telerec running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    if let Err(e) = handle.shutdown().await {
        warn!("Recorder shutdown failed: {}", e);
    }
    join.await?;

    Ok(())
}
