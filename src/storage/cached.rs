use crate::models::GeoResolution;
use crate::storage::GeoRepository;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Read-through memory cache in front of the persistent geo cache.
///
/// Lookups never trigger resolution: an IP without a persisted entry is reported as
/// absent. The resolver keeps this layer coherent by calling [`CachedLocations::remember`]
/// after writes and [`CachedLocations::invalidate`] after deletes.
pub struct CachedLocations {
    /// Underlying storage implementation
    inner: Arc<dyn GeoRepository>,
    /// Read cache for location lookups (Moka cache)
    read_cache: Cache<String, GeoResolution>,
}

impl CachedLocations {
    pub fn new(inner: Arc<dyn GeoRepository>, max_cache_entries: u64, ttl_secs: u64) -> Self {
        let read_cache = Cache::builder()
            .max_capacity(max_cache_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { inner, read_cache }
    }

    /// Cached location for an IP, consulting storage on a memory miss
    pub async fn lookup(&self, ip: &str) -> Option<GeoResolution> {
        if let Some(cached) = self.read_cache.get(ip).await {
            return Some(cached);
        }

        // Cache miss - fetch from underlying storage
        let key = [ip.to_string()];
        let entry = match self.inner.get_geo_cache(&key).await {
            Ok(mut entries) => entries.remove(ip)?,
            Err(e) => {
                tracing::warn!("Failed to read geo cache for {}: {}", ip, e);
                return None;
            }
        };

        self.read_cache
            .insert(ip.to_string(), entry.location.clone())
            .await;

        Some(entry.location)
    }

    /// Store freshly written locations in the memory layer
    pub async fn remember(&self, entries: &HashMap<String, GeoResolution>) {
        for (ip, location) in entries {
            self.read_cache.insert(ip.clone(), location.clone()).await;
        }
    }

    /// Drop IPs from the memory layer after their persisted entries were removed
    pub async fn invalidate(&self, ips: &[String]) {
        for ip in ips {
            self.read_cache.invalidate(ip.as_str()).await;
        }
    }
}
