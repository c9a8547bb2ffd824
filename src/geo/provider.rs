use crate::models::GeoLocation;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Failure reason recorded for IPs caught in a batch-level error
pub const REQUEST_ERROR_REASON: &str = "request_error";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("geolocation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geolocation provider is rate limiting requests")]
    RateLimited,
    #[error("geolocation provider returned HTTP {0}")]
    Status(u16),
    #[error("geolocation database error: {0}")]
    Database(String),
}

/// Result of one batched lookup.
///
/// `resolved` and `failed` may both be populated even when `error` is set: a provider
/// that fails half-way reports what it got before the failure.
#[derive(Debug, Default)]
pub struct BatchLookup {
    pub resolved: HashMap<String, GeoLocation>,
    pub failed: HashMap<String, String>,
    pub error: Option<ProviderError>,
}

/// Remote (or local database) geolocation source
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Name recorded as provenance and in failure rows
    fn name(&self) -> &str;

    /// Resolve a batch of IPs. IPs absent from both `resolved` and `failed`
    /// had no usable data.
    async fn lookup_batch(&self, ips: &[String]) -> BatchLookup;
}
