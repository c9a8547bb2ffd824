use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::geo::ResolverSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub websites: Vec<WebsiteConfig>,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "DatabaseConfig::default_url")]
    pub url: String,
    #[serde(default = "DatabaseConfig::default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// IPs resolved per batch
    #[serde(default = "ResolverConfig::default_batch_size")]
    pub batch_size: usize,
    /// Seconds between batches in the daemon loop
    #[serde(default = "ResolverConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds a failed IP is excluded from batches
    #[serde(default = "ResolverConfig::default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Maximum persisted cache entries, 0 for unbounded
    #[serde(default)]
    pub cache_limit: u64,
    /// Maximum IPs recovered from access logs per call
    #[serde(default = "ResolverConfig::default_recovery_limit")]
    pub recovery_limit: usize,
    #[serde(default = "ResolverConfig::default_memory_cache_entries")]
    pub memory_cache_entries: u64,
    #[serde(default = "ResolverConfig::default_memory_cache_ttl_secs")]
    pub memory_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    IpApi,
    #[serde(alias = "max-mind")]
    Maxmind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "ProviderConfig::default_kind")]
    pub kind: ProviderKind,
    #[serde(default = "ProviderConfig::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "ProviderConfig::default_lang")]
    pub lang: String,
    #[serde(default = "ProviderConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Path to a GeoLite2/GeoIP2 City database, required for `maxmind`
    #[serde(default)]
    pub city_db_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Single IPs, CIDR blocks (`10.0.0.0/8`) and ranges (`10.0.0.1-10.0.0.9`)
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default)]
    pub non_mainland: bool,
}

impl DatabaseConfig {
    fn default_url() -> String {
        "sqlite://./geolens.db?mode=rwc".to_string()
    }

    const fn default_max_connections() -> u32 {
        5
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            max_connections: Self::default_max_connections(),
        }
    }
}

impl ResolverConfig {
    const fn default_batch_size() -> usize {
        1000
    }

    const fn default_interval_secs() -> u64 {
        30
    }

    const fn default_cooldown_secs() -> u64 {
        12 * 60 * 60
    }

    const fn default_recovery_limit() -> usize {
        1000
    }

    const fn default_memory_cache_entries() -> u64 {
        100_000
    }

    const fn default_memory_cache_ttl_secs() -> u64 {
        300
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            interval_secs: Self::default_interval_secs(),
            cooldown_secs: Self::default_cooldown_secs(),
            cache_limit: 0,
            recovery_limit: Self::default_recovery_limit(),
            memory_cache_entries: Self::default_memory_cache_entries(),
            memory_cache_ttl_secs: Self::default_memory_cache_ttl_secs(),
        }
    }
}

impl ProviderConfig {
    const fn default_kind() -> ProviderKind {
        ProviderKind::IpApi
    }

    fn default_endpoint() -> String {
        "http://ip-api.com/batch".to_string()
    }

    fn default_lang() -> String {
        "zh-CN".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        10
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: Self::default_kind(),
            endpoint: Self::default_endpoint(),
            lang: Self::default_lang(),
            timeout_secs: Self::default_timeout_secs(),
            city_db_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `GEOLENS__*` environment overrides
    /// (e.g. `GEOLENS__DATABASE__URL`, `GEOLENS__RESOLVER__BATCH_SIZE`).
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("GEOLENS_CONFIG").ok());

        let mut builder = config::Config::builder();
        if let Some(ref path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GEOLENS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .with_context(|| match path {
                Some(ref path) => format!("Failed to read configuration from {}", path),
                None => "Failed to read configuration from environment".to_string(),
            })?
            .try_deserialize::<Config>()
            .context("Invalid configuration")?;

        if config.provider.kind == ProviderKind::Maxmind && config.provider.city_db_path.is_none() {
            anyhow::bail!("provider.city_db_path must be set when provider.kind = maxmind");
        }

        Ok(config)
    }

    pub fn website_ids(&self) -> Vec<String> {
        self.websites.iter().map(|site| site.id.clone()).collect()
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            batch_size: self.resolver.batch_size.max(1),
            failure_cooldown: Duration::from_secs(self.resolver.cooldown_secs),
            cache_limit: self.resolver.cache_limit,
            recovery_limit: self.resolver.recovery_limit,
            website_ids: self.website_ids(),
        }
    }
}
