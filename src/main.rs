//! CLI entry point for the GTFS mirror.
//!
//! `serve` keeps the realtime feed and static tables fresh in the background
//! and answers queries over HTTP; `update` runs one acquisition pass and
//! exits.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use gtfs_mirror::{
    config::Settings,
    fetch::{BasicClient, ChallengeBypass, Fetcher, SessionStore},
    persist::DatasetArchive,
    query::QueryEngine,
    scheduler::{Scheduler, UpdateOutcome},
    server::{self, AppState},
    snapshot::SnapshotStore,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_mirror")]
#[command(about = "Mirror and query a challenge-protected GTFS source", long_about = None)]
struct Cli {
    /// Directory holding persisted datasets [default: $DATA_DIR or data]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition cycles and the HTTP API
    Serve {
        /// Address to listen on [default: $BIND_ADDR or 0.0.0.0:5000]
        #[arg(short, long)]
        bind: Option<String>,

        /// Seconds between realtime fetches [default: $FAST_INTERVAL_SECS or 30]
        #[arg(long)]
        fast_interval: Option<u64>,

        /// Seconds between static archive fetches [default: $SLOW_INTERVAL_SECS or 86400]
        #[arg(long)]
        slow_interval: Option<u64>,
    },
    /// Fetch the static archive and realtime feed once, persist, and exit
    Update,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_mirror.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_mirror.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }

    match cli.command {
        Commands::Serve {
            bind,
            fast_interval,
            slow_interval,
        } => {
            if let Some(bind) = bind {
                settings.bind_addr = bind;
            }
            if let Some(secs) = fast_interval {
                settings.fast_interval = std::time::Duration::from_secs(secs.max(1));
            }
            if let Some(secs) = slow_interval {
                settings.slow_interval = std::time::Duration::from_secs(secs.max(1));
            }
            serve(settings).await?;
        }
        Commands::Update => update(settings).await?,
    }

    Ok(())
}

fn build_scheduler(
    settings: &Settings,
    store: Arc<SnapshotStore>,
    shutdown: CancellationToken,
) -> Result<Scheduler> {
    let bypass = ChallengeBypass::new(
        BasicClient::new(settings.fetch_timeout)?,
        settings.landing_url.clone(),
        settings.fetch_timeout,
    );
    let fetcher = Fetcher::new(
        BasicClient::new(settings.fetch_timeout)?,
        bypass,
        settings.endpoints(),
        settings.retry_policy(),
    )
    .with_session_store(SessionStore::new(&settings.cookies_file));

    Ok(Scheduler::new(
        Arc::new(fetcher),
        store,
        settings.fast_interval,
        settings.slow_interval,
    )
    .with_archive(DatasetArchive::new(&settings.data_dir))
    .with_shutdown(shutdown))
}

/// Seeds the store from the last good copies on disk.
fn restore(settings: &Settings, store: &SnapshotStore) {
    if let Err(e) = DatasetArchive::new(&settings.data_dir).restore(store) {
        warn!(error = %e, "Could not restore persisted data, starting empty");
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let store = Arc::new(SnapshotStore::new());
    restore(&settings, &store);

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(build_scheduler(&settings, store.clone(), shutdown.clone())?);
    let state = Arc::new(AppState {
        engine: QueryEngine::new(store),
        scheduler: scheduler.clone(),
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Unable to listen for shutdown signal"),
            }
        }
    });

    let cycles = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let served = server::serve(&settings.bind_addr, state, shutdown.clone()).await;
    shutdown.cancel();
    cycles.await?;
    served
}

async fn update(settings: Settings) -> Result<()> {
    let store = Arc::new(SnapshotStore::new());
    restore(&settings, &store);

    let scheduler = build_scheduler(&settings, store, CancellationToken::new())?;
    let mut failed = false;
    for outcome in [scheduler.slow_cycle().await, scheduler.fast_cycle().await] {
        match &outcome {
            UpdateOutcome::Updated(report) | UpdateOutcome::Failed(report) => {
                println!("{}", serde_json::to_string_pretty(report)?);
                failed |= !report.is_success();
            }
            UpdateOutcome::AlreadyRunning | UpdateOutcome::Cancelled => {}
        }
    }

    if failed {
        bail!("update finished with failures");
    }
    info!("Update complete");
    Ok(())
}
