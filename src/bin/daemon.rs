//! facesync daemon: folder ingestion and store upkeep in the background.
//!
//! Runs the maintenance jobs on their cron schedules and, when
//! `sync.local_root` is configured, the sync worker over the local drive
//! mirror. Face detection needs a detector implementation, so the face
//! worker runs only in programs that link one in.
//!
//! ## Usage
//!
//! ```bash
//! facesync-daemon              # Run in foreground
//! facesync-daemon --once       # Run maintenance and pending syncs once and exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use facesync::config::Config;
use facesync::db::Database;
use facesync::maintenance;
use facesync::schedule::Scheduler;
use facesync::workers::{DriveSource, LocalDriveSource, SyncWorker};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct DaemonArgs {
    /// Run once and exit
    once: bool,
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let config = load_config(&args)?;
    facesync::logging::init(config.log_dir.clone())?;
    info!("facesync daemon starting...");

    let db = Arc::new(open_database(&config)?);
    info!("Database opened at {:?}", config.db_path());

    if args.once {
        info!("Running in single-shot mode");
        run_once(db, &config).await?;
    } else {
        run_daemon(db, &config).await?;
    }

    info!("facesync daemon stopped");
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
        r#"facesync-daemon - Background ingestion and maintenance for facesync

USAGE:
    facesync-daemon [OPTIONS]

OPTIONS:
    --once, -1          Run maintenance and pending syncs once and exit
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    FACESYNC_CONFIG     Path to config file (overrides default location)
    FACESYNC_LOG        Log filter (trace, debug, info, warn, error)
"#
    );
}

fn load_config(args: &DaemonArgs) -> Result<Config> {
    match &args.config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn open_database(config: &Config) -> Result<Database> {
    let db = Database::open(config.db_path(), config.faces.embedding_dim)
        .with_context(|| format!("Failed to open database {:?}", config.db_path()))?;
    db.initialize().context("Failed to initialize schema")?;
    Ok(db)
}

fn sync_worker(db: &Arc<Database>, config: &Config) -> Option<Arc<SyncWorker>> {
    let Some(root) = &config.sync.local_root else {
        warn!("sync.local_root is not set, folder ingestion disabled");
        return None;
    };
    info!("Ingesting from local drive mirror {:?}", root);
    let drive: Arc<dyn DriveSource> = Arc::new(LocalDriveSource::new(root));
    Some(Arc::new(SyncWorker::new(
        db.clone(),
        drive,
        config.sync.clone(),
    )))
}

async fn run_once(db: Arc<Database>, config: &Config) -> Result<()> {
    let maintenance_config = config.maintenance.clone();
    let store = db.clone();
    tokio::task::spawn_blocking(move || maintenance::run_all(&store, &maintenance_config))
        .await??;

    if let Some(worker) = sync_worker(&db, config) {
        let cancel = CancellationToken::new();
        let ran = tokio::task::spawn_blocking(move || worker.run_pending(&cancel)).await??;
        info!(jobs = ran, "Pending sync jobs processed");
    }
    Ok(())
}

async fn run_daemon(db: Arc<Database>, config: &Config) -> Result<()> {
    let scheduler = Scheduler::new();
    maintenance::register(&scheduler, db.clone(), &config.maintenance)
        .context("Failed to register maintenance jobs")?;
    scheduler.start();

    let cancel = CancellationToken::new();
    let mut workers = Vec::new();
    if let Some(worker) = sync_worker(&db, config) {
        workers.push(tokio::spawn(worker.run(cancel.clone())));
    }

    shutdown_signal().await?;
    info!("Shutdown requested");

    cancel.cancel();
    if !scheduler.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!("Scheduled jobs still running after {:?}", SHUTDOWN_TIMEOUT);
    }
    for handle in workers {
        if let Err(e) = handle.await {
            error!("Worker task failed: {}", e);
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
