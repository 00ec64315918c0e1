//! Offline Music Cache
//!
//! Runs the edge cache proxy in front of the music server, together with the
//! engine's background work: the retention sweeper and, on request, the
//! one-shot legacy key migration.
//!
//! # Architecture
//!
//! ```text
//!   browser ──► Edge Cache Proxy ──► origin (music server)
//!                    │
//!                    └── versioned namespaces (<version>-static, <version>-images)
//!
//!   Retention Sweeper ──► Durable Object Store ◄── Legacy Migrator ◄── Backup Store
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offline_music_cache::{
    AppConfig, DatabaseHandle, EdgeCacheProxy, EdgeServer, EdgeServerConfig,
    EventBus, HttpFetcher, HttpUpstream, LegacyMigrator, LegacyOptions, QuotaBackupStore,
    RetentionSweeper,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Offline Music Cache - edge cache proxy and offline cache maintenance
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "OMC_CONFIG")]
    config: Option<PathBuf>,

    /// Edge proxy bind address (overrides edge.listen)
    #[arg(long, env = "OMC_LISTEN")]
    listen: Option<String>,

    /// Origin server URL (overrides edge.origin)
    #[arg(long, env = "OMC_ORIGIN")]
    origin: Option<String>,

    /// Database directory (overrides database.data_dir)
    #[arg(long, env = "OMC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Backup store mirror file (overrides backup.path)
    #[arg(long, env = "OMC_BACKUP_FILE")]
    backup_file: Option<PathBuf>,

    /// Seconds between retention sweeps (overrides retention.interval_secs)
    #[arg(long, env = "OMC_SWEEP_INTERVAL")]
    sweep_interval_secs: Option<u64>,

    /// Move legacy backup keys into the database before serving
    #[arg(long, env = "OMC_MIGRATE_LEGACY")]
    migrate_legacy: bool,

    /// Migrate history and listen stats even when the backup store has room
    #[arg(long, env = "OMC_MIGRATE_ALL")]
    migrate_all: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args).await?;

    info!("Starting Offline Music Cache");
    info!("  Version: {}", offline_music_cache::VERSION);
    info!("  Edge proxy: {}", config.edge.listen);
    info!("  Origin: {}", config.edge.origin);
    info!("  Cache version: {}", config.edge.cache_version);
    match &config.database.data_dir {
        Some(dir) => info!("  Database: {}", dir.display()),
        None => info!("  Database: in-memory"),
    }

    let events = EventBus::default();
    spawn_event_logger(&events);

    let store = Arc::new(DatabaseHandle::new(config.database_config(), events.clone()));
    let backup = Arc::new(
        QuotaBackupStore::open(config.backup_config()).context("Failed to open backup store")?,
    );

    if args.migrate_legacy {
        let origin = config.edge.origin_url()?;
        let fetcher = Arc::new(HttpFetcher::new(Some(origin), config.timeouts.binary())?);
        let migrator = LegacyMigrator::new(
            store.clone(),
            backup.clone(),
            fetcher,
            config.ttl.playlist_snapshot(),
            config.ttl.covers(),
            config.timeouts.legacy_item(),
            events.clone(),
        );
        let report = migrator
            .run(LegacyOptions {
                force_all: args.migrate_all,
            })
            .await;
        info!(
            migrated = report.migrated,
            failed = report.failed,
            records = report.records,
            "Legacy migration finished"
        );
    }

    // Start retention sweeper
    let cancel = CancellationToken::new();
    let sweeper = RetentionSweeper::new(store.clone(), &config.retention, events.clone())
        .spawn(config.retention.interval(), cancel.clone());
    info!(
        "Retention sweeper started (every {}s)",
        config.retention.interval().as_secs()
    );

    // Edge proxy: pre-cache, drop stale namespaces, then serve
    let upstream = Arc::new(HttpUpstream::new(
        config.edge.origin_url()?,
        config.timeouts.edge_upstream(),
    )?);
    let proxy = Arc::new(EdgeCacheProxy::new(config.edge.clone(), upstream)?);

    let install = proxy.install().await;
    info!(
        cached = install.cached.len(),
        failed = install.failed.len(),
        "Edge install finished"
    );
    for (path, reason) in &install.failed {
        warn!(path = %path, reason = %reason, "Asset not pre-cached");
    }
    let activate = proxy.activate();
    info!(removed = ?activate.removed, "Edge proxy activated");

    let server = Arc::new(EdgeServer::new(
        EdgeServerConfig {
            addr: config.edge.listen_addr()?,
        },
        proxy,
    ));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_server.shutdown();
    });

    server.run().await?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        error!("Retention sweeper task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

async fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_yaml_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.edge.listen = listen.clone();
    }
    if let Some(origin) = &args.origin {
        config.edge.origin = origin.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.database.data_dir = Some(dir.clone());
    }
    if let Some(path) = &args.backup_file {
        config.backup.path = Some(path.clone());
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.retention.interval_secs = secs;
    }

    config.validate().context("Invalid configuration")?;
    if args.migrate_legacy {
        config
            .validate_legacy_migration()
            .context("Refusing --migrate-legacy")?;
    }
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "tower=warn", "axum=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Log error events from the engine
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.is_error() => warn!(event = ?event, "Cache event"),
                Ok(event) => debug!(event = ?event, "Cache event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
