//! Pending-IP resolution pipeline
//!
//! Drains the pending queue in batches: cached locations are reused, misses go
//! to the provider in one batched call, and every IP that leaves a batch is
//! backfilled into the access logs and retired from the queue. Provider failures
//! leave IPs pending behind a cooldown instead of retrying them immediately.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::geo::normalize::normalize_location;
use crate::geo::progress::{ProgressSnapshot, ResolveProgress};
use crate::geo::provider::{GeoProvider, REQUEST_ERROR_REASON};
use crate::geo::run_flag::RunFlag;
use crate::models::{
    GeoLocation, GeoResolution, NotificationLevel, SystemNotification, PENDING_LOCATION_LABEL,
};
use crate::storage::{CachedLocations, GeoRepository, StorageResult};

/// Key of the last progress snapshot in the repository's state table
pub const PROGRESS_STATE_KEY: &str = "ip_geo_progress";

const FAILURE_FINGERPRINT: &str = "ip_geo_api_failure";
const FAILURE_SAMPLE_SIZE: usize = 3;

/// Tunables for [`GeoResolver`]
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Batch size used when `resolve_batch` is called with a zero limit
    pub batch_size: usize,
    /// How long a failed IP is kept out of batches
    pub failure_cooldown: Duration,
    /// Maximum cache entries kept after a write; zero disables trimming
    pub cache_limit: u64,
    /// Upper bound on IPs recovered from logs per call
    pub recovery_limit: usize,
    /// Websites scanned during recovery
    pub website_ids: Vec<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            failure_cooldown: Duration::from_secs(12 * 60 * 60),
            cache_limit: 0,
            recovery_limit: 1000,
            website_ids: Vec::new(),
        }
    }
}

/// Location handed to the ingestion side for a freshly parsed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLocation {
    pub domestic: String,
    pub global: String,
}

impl LogLocation {
    fn pending() -> Self {
        Self {
            domestic: PENDING_LOCATION_LABEL.to_string(),
            global: PENDING_LOCATION_LABEL.to_string(),
        }
    }
}

/// Single-flight resolver for pending IPs
pub struct GeoResolver {
    repo: Arc<dyn GeoRepository>,
    provider: Arc<dyn GeoProvider>,
    locations: Arc<CachedLocations>,
    settings: ResolverSettings,
    running: RunFlag,
    ingest: Arc<RunFlag>,
    progress: ResolveProgress,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Progress last persisted by a resolver, readable from another process
pub async fn load_progress(repo: &dyn GeoRepository) -> StorageResult<Option<ProgressSnapshot>> {
    match repo.load_state(PROGRESS_STATE_KEY).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

fn normalized(location: GeoLocation) -> GeoResolution {
    let (domestic, global) = normalize_location(&location.domestic, &location.global);
    GeoResolution::from_parts(&domestic, &global, &location.source)
}

impl GeoResolver {
    pub fn new(
        repo: Arc<dyn GeoRepository>,
        provider: Arc<dyn GeoProvider>,
        locations: Arc<CachedLocations>,
        ingest: Arc<RunFlag>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            repo,
            provider,
            locations,
            settings,
            running: RunFlag::new(),
            ingest,
            progress: ResolveProgress::new(),
        }
    }

    /// Whether a resolution pass is in flight
    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub async fn pending_count(&self) -> u64 {
        match self.repo.count_pending().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to count pending IPs: {}", e);
                0
            }
        }
    }

    pub async fn has_pending(&self) -> bool {
        self.pending_count().await > 0
    }

    /// Locations for IPs of freshly ingested records.
    ///
    /// Resolved cache entries are returned as-is; every other IP gets the pending
    /// placeholder and is enqueued. Unresolved entries count as misses so the IP
    /// is retried.
    pub async fn prepare_locations(&self, ips: &[String]) -> HashMap<String, LogLocation> {
        let unique: Vec<String> = ips
            .iter()
            .map(|ip| ip.trim())
            .filter(|ip| !ip.is_empty())
            .collect::<HashSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect();

        let cached = self.repo.get_geo_cache(&unique).await.unwrap_or_else(|e| {
            warn!("Failed to read geo cache for ingestion: {}", e);
            HashMap::new()
        });

        let mut result = HashMap::with_capacity(unique.len());
        let mut missing = Vec::new();
        for ip in unique {
            match cached.get(&ip).map(|entry| &entry.location) {
                Some(location @ GeoResolution::Resolved { .. }) => {
                    let known = LogLocation {
                        domestic: location.domestic().to_string(),
                        global: location.global().to_string(),
                    };
                    result.insert(ip, known);
                }
                _ => {
                    missing.push(ip.clone());
                    result.insert(ip, LogLocation::pending());
                }
            }
        }

        if let Err(e) = self.repo.upsert_pending(&missing).await {
            warn!("Failed to enqueue {} pending IPs: {}", missing.len(), e);
        }

        result
    }

    /// Resolve up to `limit` pending IPs (the configured batch size when zero).
    ///
    /// Returns the number of IPs retired from the queue. Returns 0 without doing
    /// any work while another pass or log ingestion is running.
    pub async fn resolve_batch(&self, limit: usize) -> usize {
        if self.ingest.is_running() {
            debug!("Log ingestion in progress, deferring IP resolution");
            return 0;
        }
        let Some(_guard) = self.running.try_acquire() else {
            debug!("IP resolution already running");
            return 0;
        };

        let limit = if limit == 0 {
            self.settings.batch_size
        } else {
            limit
        };
        let retired = self.run_batch(limit).await;
        self.persist_progress().await;
        retired
    }

    async fn persist_progress(&self) {
        let snapshot = match serde_json::to_value(self.progress.snapshot()) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode resolve progress: {}", e);
                return;
            }
        };
        if let Err(e) = self.repo.save_state(PROGRESS_STATE_KEY, &snapshot).await {
            warn!("Failed to persist resolve progress: {}", e);
        }
    }

    async fn run_batch(&self, limit: usize) -> usize {
        let pending_total = match self.repo.count_pending().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to count pending IPs: {}", e);
                return 0;
            }
        };
        if pending_total == 0 {
            self.progress.reset();
            return self.recover_from_logs(limit).await;
        }
        self.progress.begin_batch(pending_total, now());

        let cutoff = now() - self.settings.failure_cooldown.as_secs() as i64;
        let pending = match self.repo.fetch_pending_with_cooldown(limit, cutoff).await {
            Ok(ips) => ips,
            Err(e) => {
                warn!("Failed to fetch pending IPs: {}", e);
                return 0;
            }
        };

        let mut seen = HashSet::with_capacity(pending.len());
        let pending: Vec<String> = pending
            .into_iter()
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty() && seen.insert(ip.clone()))
            .collect();
        if pending.is_empty() {
            debug!("All {} pending IPs are cooling down", pending_total);
            return 0;
        }

        let cached = self.repo.get_geo_cache(&pending).await.unwrap_or_else(|e| {
            warn!("Failed to read geo cache: {}", e);
            HashMap::new()
        });

        let mut results: HashMap<String, GeoResolution> = HashMap::with_capacity(pending.len());
        let mut missing = Vec::new();
        let mut unknown_cached = Vec::new();
        for ip in &pending {
            match cached.get(ip).map(|entry| &entry.location) {
                Some(location @ GeoResolution::Resolved { .. }) => {
                    results.insert(ip.clone(), location.clone());
                }
                Some(GeoResolution::Unresolved) => {
                    unknown_cached.push(ip.clone());
                    missing.push(ip.clone());
                }
                None => missing.push(ip.clone()),
            }
        }

        if !unknown_cached.is_empty() {
            if let Err(e) = self.repo.delete_geo_cache(&unknown_cached).await {
                warn!("Failed to purge {} unknown cache entries: {}", unknown_cached.len(), e);
            }
            self.locations.invalidate(&unknown_cached).await;
        }

        let mut failures: HashMap<String, String> = HashMap::new();
        let mut batch_error = None;
        if !missing.is_empty() {
            let lookup = self.provider.lookup_batch(&missing).await;
            let requested: HashSet<&String> = missing.iter().collect();
            let fetched: HashMap<String, GeoResolution> = lookup
                .resolved
                .into_iter()
                .filter(|(ip, _)| requested.contains(ip))
                .map(|(ip, location)| (ip, normalized(location)))
                .collect();

            self.store_fetched(&fetched).await;
            results.extend(fetched);
            failures = lookup.failed;
            batch_error = lookup.error;
        }

        // Every dispatched IP ends this batch either resolved, unknown, or failed
        let mut unknown = HashMap::new();
        for ip in &pending {
            if results.contains_key(ip) || failures.contains_key(ip) {
                continue;
            }
            if batch_error.is_some() {
                failures.insert(ip.clone(), REQUEST_ERROR_REASON.to_string());
            } else {
                unknown.insert(ip.clone(), GeoResolution::Unresolved);
            }
        }
        if !unknown.is_empty() {
            if let Err(e) = self.repo.upsert_geo_cache(&unknown).await {
                warn!("Failed to cache {} unknown locations: {}", unknown.len(), e);
            }
            results.extend(unknown);
        }

        if !failures.is_empty() {
            let detail = batch_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            self.record_failures(&failures, &detail).await;
        }

        let retired = self.retire(&results).await;
        self.progress.advance(retired as u64, now());
        if retired > 0 {
            info!(
                "Resolved {} pending IPs ({} failed, {} pending at start)",
                retired,
                failures.len(),
                pending_total
            );
        }
        retired
    }

    async fn store_fetched(&self, fetched: &HashMap<String, GeoResolution>) {
        if fetched.is_empty() {
            return;
        }

        if let Err(e) = self.repo.upsert_geo_cache(fetched).await {
            warn!("Failed to write {} geo cache entries: {}", fetched.len(), e);
        }
        self.locations.remember(fetched).await;

        if self.settings.cache_limit > 0 {
            match self.repo.trim_geo_cache(self.settings.cache_limit).await {
                Ok(0) => {}
                Ok(evicted) => debug!("Trimmed {} geo cache entries", evicted),
                Err(e) => warn!("Failed to trim geo cache: {}", e),
            }
        }
    }

    /// Backfill logs and drop IPs from the queue; returns how many were retired
    async fn retire(&self, results: &HashMap<String, GeoResolution>) -> usize {
        if results.is_empty() {
            return 0;
        }

        if let Err(e) = self
            .repo
            .update_log_locations(results, PENDING_LOCATION_LABEL)
            .await
        {
            warn!("Failed to backfill log locations: {}", e);
            return 0;
        }

        let resolved: Vec<String> = results.keys().cloned().collect();
        if let Err(e) = self.repo.delete_pending(&resolved).await {
            warn!("Failed to remove {} IPs from the pending queue: {}", resolved.len(), e);
            return 0;
        }

        resolved.len()
    }

    async fn record_failures(&self, failures: &HashMap<String, String>, detail: &str) {
        let provider = self.provider.name();
        if let Err(e) = self
            .repo
            .insert_geo_failures(failures, provider, detail, now())
            .await
        {
            warn!("Failed to record {} geo lookup failures: {}", failures.len(), e);
        }

        let mut samples: Vec<&String> = failures.keys().collect();
        samples.sort();
        samples.truncate(FAILURE_SAMPLE_SIZE);

        let entry = SystemNotification {
            level: NotificationLevel::Warning,
            category: "ip_geo".to_string(),
            title: "IP geolocation lookup failed".to_string(),
            message: format!(
                "Remote IP geolocation lookup failed, {} IPs recorded.",
                failures.len()
            ),
            fingerprint: FAILURE_FINGERPRINT.to_string(),
            metadata: json!({
                "provider": provider,
                "count": failures.len(),
                "samples": samples,
                "error": detail,
            }),
        };
        if let Err(e) = self.repo.create_notification(&entry).await {
            warn!("Failed to create geo failure notification: {}", e);
        }
    }

    /// Re-enqueue IPs stranded in logs with the pending placeholder.
    ///
    /// IPs that are already cached are backfilled directly; the rest go back into
    /// the pending queue. Returns the number backfilled from cache.
    async fn recover_from_logs(&self, limit: usize) -> usize {
        let limit = limit.min(self.settings.recovery_limit);
        if limit == 0 {
            return 0;
        }

        let mut pending = Vec::with_capacity(limit);
        let mut seen = HashSet::with_capacity(limit);
        for website_id in &self.settings.website_ids {
            if pending.len() >= limit {
                break;
            }
            let ips = match self
                .repo
                .fetch_pending_ips_from_logs(
                    website_id,
                    PENDING_LOCATION_LABEL,
                    limit - pending.len(),
                )
                .await
            {
                Ok(ips) => ips,
                Err(e) => {
                    warn!("Failed to scan logs of {} for pending IPs: {}", website_id, e);
                    continue;
                }
            };
            for ip in ips {
                if pending.len() >= limit {
                    break;
                }
                if !ip.is_empty() && seen.insert(ip.clone()) {
                    pending.push(ip);
                }
            }
        }
        if pending.is_empty() {
            return 0;
        }

        let cached: HashMap<String, GeoResolution> = match self.repo.get_geo_cache(&pending).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|(_, entry)| entry.location.is_resolved())
                .map(|(ip, entry)| (ip, entry.location))
                .collect(),
            Err(e) => {
                warn!("Failed to read geo cache during recovery: {}", e);
                HashMap::new()
            }
        };
        if !cached.is_empty() {
            if let Err(e) = self
                .repo
                .update_log_locations(&cached, PENDING_LOCATION_LABEL)
                .await
            {
                warn!("Failed to backfill cached locations during recovery: {}", e);
            }
        }

        let missing: Vec<String> = pending
            .into_iter()
            .filter(|ip| !cached.contains_key(ip))
            .collect();
        if !missing.is_empty() {
            info!("Recovered {} pending IPs from access logs", missing.len());
            if let Err(e) = self.repo.upsert_pending(&missing).await {
                warn!("Failed to re-enqueue {} recovered IPs: {}", missing.len(), e);
            }
        }

        cached.len()
    }
}
