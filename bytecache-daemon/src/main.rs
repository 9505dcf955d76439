//! # bytecache-daemon
//!
//! Keeps an offline copy of the DevBytes catalog fresh.
//!
//! This daemon is responsible for:
//! - Owning the single SQLite cache store
//! - Refreshing the catalog once a day, only under favourable device conditions
//! - Publishing every committed cache state to in-process observers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    bytecache-daemon                       │
//! │                                                           │
//! │  ┌──────────────┐   refresh   ┌──────────────────────┐   │
//! │  │    Local     │────────────▶│  CatalogRepository   │   │
//! │  │  Scheduler   │             └──────────────────────┘   │
//! │  └──────────────┘               │ fetch        │ write   │
//! │                                 ▼              ▼         │
//! │                       ┌──────────────┐ ┌──────────────┐  │
//! │                       │   DevBytes   │ │ SqliteCache  │  │
//! │                       │   provider   │ │ (one handle) │  │
//! │                       └──────────────┘ └──────────────┘  │
//! │                                              │ snapshots │
//! │                                              ▼           │
//! │                                        observers         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/bytecache/config.toml`.
//!
//! ## Running
//!
//! ```bash
//! # Start the daemon
//! cargo run --bin bytecache-daemon
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin bytecache-daemon
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bytecache_daemon::cache::{CacheStore, SqliteCache, StoreProvider};
use bytecache_daemon::config::Config;
use bytecache_daemon::repository::{CatalogRepository, RefreshJob};
use bytecache_daemon::scheduler::{
    Constraints, DeviceConditions, JobScheduler, JobStateStore, LocalScheduler, PeriodicJob,
    StaticProbe,
};
use provider_devbytes::{DevBytesConfig, DevBytesProvider};

#[tokio::main]
async fn main() -> Result<()> {
    let loaded = Config::load_default();
    let config = loaded.as_ref().cloned().unwrap_or_default();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting bytecache-daemon v{}", env!("CARGO_PKG_VERSION"));
    match &loaded {
        Ok(_) => info!("Loaded configuration from default path"),
        Err(e) => warn!("Failed to load config, using defaults: {:#}", e),
    }

    // Initialize cache (SQLite)
    let cache_path = config.cache_path()?;
    info!("Initializing cache at: {}", cache_path.display());
    let provider = StoreProvider::new(move || SqliteCache::open_at(&cache_path));
    let cache = provider
        .get_store()
        .await
        .context("Failed to initialize cache")?;
    let cached = {
        let cache = Arc::clone(&cache);
        tokio::task::spawn_blocking(move || cache.count()).await??
    };
    info!("Cache holds {} item(s)", cached);

    let source = DevBytesProvider::new(DevBytesConfig {
        url: config.source.url.clone(),
        timeout: config.source.timeout(),
        ..Default::default()
    })
    .context("Failed to build catalog client")?;
    info!("Catalog source: {}", source.url());

    let repository = Arc::new(CatalogRepository::new(
        Arc::new(source),
        Arc::clone(&cache) as Arc<dyn CacheStore>,
    ));

    // Log every committed cache state
    let mut feed = repository.observe_items();
    let observer = tokio::spawn(async move {
        while let Some(items) = feed.next().await {
            info!("Catalog snapshot: {} item(s)", items.len());
        }
    });

    let probe = StaticProbe::new(DeviceConditions::from(&config.scheduler.conditions));
    let scheduler = LocalScheduler::new(Arc::new(probe))
        .with_state_store(Arc::clone(&cache) as Arc<dyn JobStateStore>)
        .with_condition_poll(config.scheduler.condition_poll());

    let job = PeriodicJob::new(config.scheduler.job_name.clone(), config.scheduler.period())
        .with_constraints(Constraints::refresh_defaults(scheduler.supports_idle()));
    match scheduler
        .enqueue_unique_periodic(
            job,
            config.scheduler.policy,
            Arc::new(RefreshJob::new(Arc::clone(&repository))),
        )
        .await
    {
        Ok(outcome) => info!("Refresh job registration: {:?}", outcome),
        Err(e) => error!("Failed to register refresh job: {:#}", e),
    }

    info!("Daemon startup complete");
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    scheduler.shutdown().await;
    observer.abort();

    info!("Daemon stopped");
    Ok(())
}
