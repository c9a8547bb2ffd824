use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use geolens::config::Config;
use geolens::geo::{provider_from_config, GeoResolver, RunFlag};
use geolens::storage::{CachedLocations, GeoRepository, SqliteStorage};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    info!("Loaded configuration");

    // Initialize storage
    info!("Using SQLite storage: {}", config.database.url);
    let storage = SqliteStorage::new(&config.database.url, config.database.max_connections).await?;
    storage.init().await?;
    let repo: Arc<dyn GeoRepository> = Arc::new(storage);
    info!("Database initialized successfully");

    let provider = provider_from_config(&config.provider)?;
    info!("Using geolocation provider: {}", provider.name());

    let locations = Arc::new(CachedLocations::new(
        Arc::clone(&repo),
        config.resolver.memory_cache_entries,
        config.resolver.memory_cache_ttl_secs,
    ));
    let ingest = Arc::new(RunFlag::new());
    let resolver = GeoResolver::new(
        Arc::clone(&repo),
        provider,
        locations,
        ingest,
        config.resolver_settings(),
    );

    let period = Duration::from_secs(config.resolver.interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Resolving pending IPs every {:?}", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let resolved = resolver.resolve_batch(0).await;
                if resolved > 0 {
                    let progress = resolver.progress();
                    info!(
                        "Resolved {} IPs ({}/{} in current pass)",
                        resolved, progress.processed, progress.pending_total
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
