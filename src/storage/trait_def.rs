use crate::models::{
    AccessLogRecord, GeoApiFailure, GeoCacheEntry, GeoResolution, NewAccessLog,
    StoredNotification, SystemNotification,
};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} failed for {subject}")]
    Query {
        action: &'static str,
        subject: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to encode or decode stored JSON")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn query(action: &'static str, subject: impl Into<String>, source: sqlx::Error) -> Self {
        StorageError::Query {
            action,
            subject: subject.into(),
            source,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent repository behind the geolocation pipeline.
///
/// Every method reports failures to the caller; it is up to the caller to decide
/// whether a failure degrades (e.g. into a cache miss) or aborts the current step.
#[async_trait]
pub trait GeoRepository: Send + Sync {
    /// Initialize the storage (create tables and indexes)
    async fn init(&self) -> StorageResult<()>;

    // Pending queue

    async fn count_pending(&self) -> StorageResult<u64>;

    /// Insert IPs into the pending queue; IPs already pending keep their position
    async fn upsert_pending(&self, ips: &[String]) -> StorageResult<()>;

    /// Oldest pending IPs, skipping any with a failure recorded at or after
    /// `cooldown_cutoff`
    async fn fetch_pending_with_cooldown(
        &self,
        limit: usize,
        cooldown_cutoff: i64,
    ) -> StorageResult<Vec<String>>;

    async fn delete_pending(&self, ips: &[String]) -> StorageResult<()>;

    // Geo cache

    /// Cached entries for the given IPs; IPs without an entry are absent from the map
    async fn get_geo_cache(
        &self,
        ips: &[String],
    ) -> StorageResult<HashMap<String, GeoCacheEntry>>;

    /// Insert or overwrite entries, last write wins per IP
    async fn upsert_geo_cache(
        &self,
        entries: &HashMap<String, GeoResolution>,
    ) -> StorageResult<()>;

    async fn delete_geo_cache(&self, ips: &[String]) -> StorageResult<()>;

    /// Evict entries until at most `max_size` remain, unresolved and oldest first.
    /// Returns the number of evicted entries.
    async fn trim_geo_cache(&self, max_size: u64) -> StorageResult<u64>;

    async fn count_geo_cache(&self) -> StorageResult<u64>;

    // Failures

    async fn insert_geo_failures(
        &self,
        failures: &HashMap<String, String>,
        provider: &str,
        detail: &str,
        occurred_at: i64,
    ) -> StorageResult<()>;

    async fn list_geo_failures(&self, ip: &str) -> StorageResult<Vec<GeoApiFailure>>;

    // Access logs

    async fn insert_access_log(&self, record: &NewAccessLog) -> StorageResult<i64>;

    async fn list_access_logs(
        &self,
        website_id: &str,
        limit: i64,
    ) -> StorageResult<Vec<AccessLogRecord>>;

    /// Distinct IPs of a website whose location still carries `placeholder`
    async fn fetch_pending_ips_from_logs(
        &self,
        website_id: &str,
        placeholder: &str,
        limit: usize,
    ) -> StorageResult<Vec<String>>;

    /// Backfill resolved locations into log records still labeled with `placeholder`.
    /// Returns the number of updated records.
    async fn update_log_locations(
        &self,
        locations: &HashMap<String, GeoResolution>,
        placeholder: &str,
    ) -> StorageResult<u64>;

    // Notifications

    async fn create_notification(&self, entry: &SystemNotification) -> StorageResult<()> {
        self.create_notification_with_count(entry, 1).await
    }

    /// Create a notification, or add `count` occurrences to the one sharing its fingerprint
    async fn create_notification_with_count(
        &self,
        entry: &SystemNotification,
        count: u64,
    ) -> StorageResult<()>;

    async fn list_notifications(&self, limit: i64) -> StorageResult<Vec<StoredNotification>>;

    // Resolver state

    /// Store a JSON value under `key`, replacing any previous value
    async fn save_state(&self, key: &str, value: &serde_json::Value) -> StorageResult<()>;

    async fn load_state(&self, key: &str) -> StorageResult<Option<serde_json::Value>>;
}
