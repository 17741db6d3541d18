//! footfalld - multi-tenant people analytics daemon
//!
//! This daemon:
//! 1. Loads configuration (file + FOOTFALL_* environment)
//! 2. Starts the persistence worker on the SQLite analytics store
//! 3. Serves the lifecycle HTTP API and the duplex frame stream
//! 4. Reaps idle sessions in the background
//! 5. On Ctrl-C stops every session (flushing final statistics) before the
//!    persistence worker drains

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use footfall::{
    api::{ApiConfig, ApiServer},
    transport::{StreamConfig, StreamServer},
    BackendRegistry, FootfallConfig, PersistenceWorker, SessionRegistry, SqliteAnalyticsStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-tenant real-time people analytics daemon")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "FOOTFALL_CONFIG")]
    config: Option<PathBuf>,

    /// Detection backend (overrides the configuration file).
    #[arg(long, env = "FOOTFALL_BACKEND")]
    backend: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = FootfallConfig::load_from(args.config.as_deref())?;
    if args.backend.is_some() {
        config.backend = args.backend;
    }

    let backends = BackendRegistry::with_builtin();
    let factory = backends.resolve(config.backend.as_deref())?;
    log::info!(
        "footfalld {} starting: backend={} (available: {})",
        env!("CARGO_PKG_VERSION"),
        factory.name(),
        backends.list().join(", ")
    );

    let store = SqliteAnalyticsStore::open(&config.db_path)?;
    let worker = PersistenceWorker::spawn(Box::new(store), config.worker)?;
    log::info!("analytics store at {}", config.db_path);

    let registry = Arc::new(SessionRegistry::new(
        config.registry.clone(),
        config.session.clone(),
        factory,
        Some(worker.handle()),
    ));
    let reaper = registry.spawn_reaper(config.reap_interval)?;

    // The API reads records through its own connection; writes stay on the worker.
    let api_store = SqliteAnalyticsStore::open(&config.db_path)?;
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        registry.clone(),
        Some(Box::new(api_store)),
    )
    .spawn()?;

    let stream_handle = StreamServer::new(
        StreamConfig {
            addr: config.stream_addr.clone(),
            stats_interval: config.stats_interval,
        },
        registry.clone(),
    )
    .spawn()?;

    log::info!(
        "footfalld running: api={} stream={} max_sessions={} idle_timeout={:?}",
        api_handle.addr,
        stream_handle.addr,
        config.registry.max_sessions,
        config.registry.idle_timeout
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    let _ = rx.recv();

    log::info!("shutdown signal received, stopping servers...");
    stream_handle.stop()?;
    api_handle.stop()?;
    reaper.stop()?;
    let stopped = registry.stop_all()?;
    log::info!("stopped {} session(s), draining persistence...", stopped);
    worker.shutdown()?;
    log::info!("footfalld stopped");
    Ok(())
}
