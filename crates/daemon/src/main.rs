//! shelfsync daemon entry point.
//!
//! Loads configuration, opens the catalog, builds the provider registry and
//! sync engine, starts the refresh scheduler and the web server, and handles
//! graceful shutdown.

mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::notify::BroadcastChannel;
use shelfsync_core::providers::ProviderRegistry;
use shelfsync_core::scheduler::Scheduler;
use shelfsync_core::status::SyncStatusRegistry;
use shelfsync_core::sync_engine::SyncEngine;
use shelfsync_web::WebServer;

/// shelfsync catalog sync daemon.
#[derive(Parser, Debug)]
#[command(
    name = "shelfsync-daemon",
    version,
    about = "Keeps the book catalog in sync with external libraries"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

/// Install the tracing subscriber. With a log directory configured, events
/// are also written to a daily-rolling file; the returned guard flushes it
/// and must live until exit.
fn init_logging(level: &str, config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);

    match config.daemon.log_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir).context("failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "shelfsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(file)
                .try_init()
                .context("failed to initialize logging")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .try_init()
                .context("failed to initialize logging")?;
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_and_resolve(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = init_logging(&log_level, &config)?;

    info!("========================================");
    info!("  shelfsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file      : {}", args.config.display());
    info!("Web listen       : {}", config.web.listen);
    info!("Data dir         : {}", config.daemon.data_dir.display());
    info!("Default interval : {}", config.daemon.refresh_interval);
    info!("Log level        : {}", log_level);
    info!("========================================");

    let db_path = config.daemon.database_path();
    let db = Arc::new(Database::open(&db_path).context("failed to open database")?);
    info!("Database initialized at {}", db_path.display());

    let providers = ProviderRegistry::from_config(&config.providers)
        .context("failed to build provider registry")?;
    for provider in providers.all() {
        info!(
            provider = provider.provider_name(),
            configured = provider.is_configured(),
            "provider registered"
        );
    }

    let channel = BroadcastChannel::new();
    let status = SyncStatusRegistry::spawn(Arc::new(channel.clone()));
    let engine = SyncEngine::new(providers, db.clone(), status);
    let scheduler = Scheduler::spawn(
        Arc::new(engine.clone()),
        db,
        &config.daemon.refresh_interval,
    );
    info!("Sync engine and scheduler initialized");

    let web_server = WebServer::new(engine, scheduler.clone(), channel);
    let listen_addr = config.web.listen.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start(&listen_addr).await {
            error!("Web server error: {}", e);
        }
    });

    let signal = signals::wait_for_shutdown().await;
    info!("{} received, stopping...", signal);

    // Running passes are left to finish or be dropped with the runtime.
    scheduler.shutdown().await;
    web_handle.abort();

    info!("shelfsync daemon stopped.");
    Ok(())
}
