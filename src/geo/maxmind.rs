//! Local geolocation provider backed by a MaxMind GeoLite2/GeoIP2 City MMDB
//!
//! Useful when no remote provider is reachable. Lookups are memory-mapped and
//! never rate limited; only a corrupt database produces failures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

use crate::geo::provider::{BatchLookup, GeoProvider, ProviderError};
use crate::models::GeoLocation;

/// GeoIP provider reading a City database
pub struct MaxMindProvider {
    city_reader: Arc<Reader<Mmap>>,
}

impl MaxMindProvider {
    /// Open a City database at `city_path`
    pub fn new(city_path: &str) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(city_path) }
            .with_context(|| format!("Failed to open GeoIP City database at {}", city_path))?;

        Ok(Self {
            city_reader: Arc::new(reader),
        })
    }

    /// Lookup a single IP. `Ok(None)` means the database has no usable record.
    fn lookup(&self, ip: IpAddr) -> Result<Option<GeoLocation>, String> {
        let result = self.city_reader.lookup(ip).map_err(|e| e.to_string())?;
        let city = match result.decode::<geoip2::City>() {
            Ok(Some(city)) => city,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };

        Ok(Self::location_from_city(&city, self.name()))
    }

    fn location_from_city(city: &geoip2::City, source: &str) -> Option<GeoLocation> {
        let global = city.country.names.english?.to_string();

        let region = city
            .subdivisions
            .first()
            .and_then(|subdivision| subdivision.names.english);
        let city_name = city.city.names.english;
        let parts: Vec<&str> = [region, city_name].into_iter().flatten().collect();
        let domestic = if parts.is_empty() {
            global.clone()
        } else {
            parts.join("·")
        };

        Some(GeoLocation {
            domestic,
            global,
            source: source.to_string(),
        })
    }
}

#[async_trait]
impl GeoProvider for MaxMindProvider {
    fn name(&self) -> &str {
        "maxmind"
    }

    async fn lookup_batch(&self, ips: &[String]) -> BatchLookup {
        let mut lookup = BatchLookup::default();

        for ip in ips {
            let Ok(addr) = ip.parse::<IpAddr>() else {
                // Not an address at all; no data rather than a retryable failure
                continue;
            };

            match self.lookup(addr) {
                Ok(Some(location)) => {
                    lookup.resolved.insert(ip.clone(), location);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("GeoIP lookup failed for {}: {}", ip, e);
                    lookup.failed.insert(ip.clone(), "lookup_error".to_string());
                    lookup.error = Some(ProviderError::Database(e));
                }
            }
        }

        lookup
    }
}

// Implement Clone by cloning the Arc
impl Clone for MaxMindProvider {
    fn clone(&self) -> Self {
        Self {
            city_reader: self.city_reader.clone(),
        }
    }
}
