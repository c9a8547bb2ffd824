use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geolens::config::Config;
use geolens::geo::{load_progress, provider_from_config, GeoResolver, RunFlag};
use geolens::models::NewAccessLog;
use geolens::storage::{CachedLocations, GeoRepository, SqliteStorage};
use geolens::whitelist::WhitelistMatcher;
use serde_json::json;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "geolens-admin")]
#[command(about = "GeoLens maintenance CLI", long_about = None)]
struct Cli {
    /// Configuration file (TOML/YAML); falls back to GEOLENS_CONFIG
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one resolution batch
    Resolve {
        /// Maximum IPs to resolve (defaults to the configured batch size)
        #[arg(short, long, default_value_t = 0)]
        limit: usize,
    },
    /// Print pending queue, cache and progress counters as JSON
    Status,
    /// Evaluate an IP against the whitelist
    Check {
        ip: String,
    },
    /// Trim the persistent geo cache down to at most MAX entries
    Trim {
        max: u64,
    },
    /// Record placeholder access logs for IPs and enqueue them for resolution
    Enqueue {
        website_id: String,
        #[arg(required = true)]
        ips: Vec<String>,
    },
    /// List recent notifications
    Notifications {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let storage = SqliteStorage::new(&config.database.url, config.database.max_connections).await?;
    // Ensure database is initialized
    storage.init().await?;
    let repo: Arc<dyn GeoRepository> = Arc::new(storage);

    let locations = Arc::new(CachedLocations::new(
        Arc::clone(&repo),
        config.resolver.memory_cache_entries,
        config.resolver.memory_cache_ttl_secs,
    ));

    match cli.command {
        Commands::Resolve { limit } => {
            let provider = provider_from_config(&config.provider)?;
            let resolver = GeoResolver::new(
                Arc::clone(&repo),
                provider,
                locations,
                Arc::new(RunFlag::new()),
                config.resolver_settings(),
            );
            let resolved = resolver.resolve_batch(limit).await;
            println!(
                "✓ Resolved {} IPs, {} still pending",
                resolved,
                resolver.pending_count().await
            );
        }
        Commands::Status => {
            let pending = repo.count_pending().await?;
            let cached = repo.count_geo_cache().await?;
            let progress = load_progress(repo.as_ref()).await?;
            let status = json!({
                "pending": pending,
                "cache_entries": cached,
                "cache_limit": config.resolver.cache_limit,
                "provider": config.provider.kind,
                "whitelist_enabled": config.whitelist.enabled,
                "progress": progress,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Check { ip } => {
            let matcher = WhitelistMatcher::new(&config.whitelist).with_locations(locations);
            if !matcher.enabled() {
                println!("⚠ Whitelist is disabled");
            }
            match matcher.match_ip(&ip).await {
                Some(found) => println!("{}", serde_json::to_string_pretty(&found)?),
                None => println!("No whitelist rule matches {}", ip),
            }
        }
        Commands::Trim { max } => {
            let removed = repo.trim_geo_cache(max).await?;
            println!("✓ Removed {} geo cache entries", removed);
        }
        Commands::Enqueue { website_id, ips } => {
            let provider = provider_from_config(&config.provider)?;
            let resolver = GeoResolver::new(
                Arc::clone(&repo),
                provider,
                locations,
                Arc::new(RunFlag::new()),
                config.resolver_settings(),
            );
            let prepared = resolver.prepare_locations(&ips).await;
            let timestamp = chrono::Utc::now().timestamp();

            for ip in &ips {
                let Some(location) = prepared.get(ip.trim()) else {
                    continue;
                };
                let record = NewAccessLog {
                    website_id: website_id.clone(),
                    ip: ip.trim().to_string(),
                    timestamp,
                    method: String::new(),
                    url: String::new(),
                    status: 0,
                    domestic_location: location.domestic.clone(),
                    global_location: location.global.clone(),
                };
                repo.insert_access_log(&record)
                    .await
                    .with_context(|| format!("Failed to record access log for {}", ip))?;
                println!("{:<40} {} / {}", ip, location.domestic, location.global);
            }
        }
        Commands::Notifications { limit } => {
            let notifications = repo.list_notifications(limit).await?;
            if notifications.is_empty() {
                println!("No notifications found.");
            } else {
                println!("{:<8} {:<10} {:>6}  {}", "Level", "Category", "Count", "Message");
                println!("{}", "-".repeat(80));
                for entry in notifications {
                    println!(
                        "{:<8} {:<10} {:>6}  {}",
                        entry.level, entry.category, entry.occurrences, entry.message
                    );
                }
            }
        }
    }

    Ok(())
}
