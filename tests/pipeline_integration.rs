//! Integration tests for the pending-IP resolution pipeline
//!
//! Every test runs against an in-memory SQLite repository and a scripted provider
//! whose answers (and failures) are set up per test.

use async_trait::async_trait;
use geolens::geo::{
    load_progress, BatchLookup, GeoProvider, GeoResolver, ProviderError, ResolverSettings,
    RunFlag,
};
use geolens::models::{
    AccessLogRecord, GeoApiFailure, GeoCacheEntry, GeoLocation, GeoResolution, NewAccessLog,
    StoredNotification, SystemNotification, PENDING_LOCATION_LABEL,
};
use geolens::storage::{
    CachedLocations, GeoRepository, SqliteStorage, StorageError, StorageResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct ScriptedProvider {
    answers: Mutex<HashMap<String, GeoLocation>>,
    per_ip_failures: Mutex<HashMap<String, String>>,
    batch_error: AtomicBool,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedProvider {
    fn answer(&self, ip: &str, domestic: &str, global: &str) {
        self.answers.lock().unwrap().insert(
            ip.to_string(),
            GeoLocation {
                domestic: domestic.to_string(),
                global: global.to_string(),
                source: "scripted".to_string(),
            },
        );
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requested(&self) -> Vec<String> {
        let mut requested = self.requested.lock().unwrap().clone();
        requested.sort();
        requested
    }
}

#[async_trait]
impl GeoProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn lookup_batch(&self, ips: &[String]) -> BatchLookup {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().extend(ips.iter().cloned());

        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }

        let mut lookup = BatchLookup::default();
        {
            let answers = self.answers.lock().unwrap();
            let failures = self.per_ip_failures.lock().unwrap();
            for ip in ips {
                if let Some(location) = answers.get(ip) {
                    lookup.resolved.insert(ip.clone(), location.clone());
                } else if let Some(reason) = failures.get(ip) {
                    lookup.failed.insert(ip.clone(), reason.clone());
                }
            }
        }
        if self.batch_error.load(Ordering::SeqCst) {
            lookup.error = Some(ProviderError::RateLimited);
        }
        lookup
    }
}

struct Harness {
    repo: Arc<dyn GeoRepository>,
    provider: Arc<ScriptedProvider>,
    ingest: Arc<RunFlag>,
    resolver: Arc<GeoResolver>,
}

async fn create_repo() -> Arc<dyn GeoRepository> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

/// Repository whose geo cache table is unreachable; everything else is delegated
struct CacheOutage {
    inner: Arc<dyn GeoRepository>,
}

fn cache_offline() -> StorageError {
    StorageError::Other(anyhow::anyhow!("cache offline"))
}

#[async_trait]
impl GeoRepository for CacheOutage {
    async fn init(&self) -> StorageResult<()> {
        self.inner.init().await
    }

    async fn count_pending(&self) -> StorageResult<u64> {
        self.inner.count_pending().await
    }

    async fn upsert_pending(&self, ips: &[String]) -> StorageResult<()> {
        self.inner.upsert_pending(ips).await
    }

    async fn fetch_pending_with_cooldown(
        &self,
        limit: usize,
        cooldown_cutoff: i64,
    ) -> StorageResult<Vec<String>> {
        self.inner.fetch_pending_with_cooldown(limit, cooldown_cutoff).await
    }

    async fn delete_pending(&self, ips: &[String]) -> StorageResult<()> {
        self.inner.delete_pending(ips).await
    }

    async fn get_geo_cache(
        &self,
        _ips: &[String],
    ) -> StorageResult<HashMap<String, GeoCacheEntry>> {
        Err(cache_offline())
    }

    async fn upsert_geo_cache(
        &self,
        _entries: &HashMap<String, GeoResolution>,
    ) -> StorageResult<()> {
        Err(cache_offline())
    }

    async fn delete_geo_cache(&self, _ips: &[String]) -> StorageResult<()> {
        Err(cache_offline())
    }

    async fn trim_geo_cache(&self, _max_size: u64) -> StorageResult<u64> {
        Err(cache_offline())
    }

    async fn count_geo_cache(&self) -> StorageResult<u64> {
        self.inner.count_geo_cache().await
    }

    async fn insert_geo_failures(
        &self,
        failures: &HashMap<String, String>,
        provider: &str,
        detail: &str,
        occurred_at: i64,
    ) -> StorageResult<()> {
        self.inner
            .insert_geo_failures(failures, provider, detail, occurred_at)
            .await
    }

    async fn list_geo_failures(&self, ip: &str) -> StorageResult<Vec<GeoApiFailure>> {
        self.inner.list_geo_failures(ip).await
    }

    async fn insert_access_log(&self, record: &NewAccessLog) -> StorageResult<i64> {
        self.inner.insert_access_log(record).await
    }

    async fn list_access_logs(
        &self,
        website_id: &str,
        limit: i64,
    ) -> StorageResult<Vec<AccessLogRecord>> {
        self.inner.list_access_logs(website_id, limit).await
    }

    async fn fetch_pending_ips_from_logs(
        &self,
        website_id: &str,
        placeholder: &str,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        self.inner
            .fetch_pending_ips_from_logs(website_id, placeholder, limit)
            .await
    }

    async fn update_log_locations(
        &self,
        locations: &HashMap<String, GeoResolution>,
        placeholder: &str,
    ) -> StorageResult<u64> {
        self.inner.update_log_locations(locations, placeholder).await
    }

    async fn create_notification_with_count(
        &self,
        entry: &SystemNotification,
        count: u64,
    ) -> StorageResult<()> {
        self.inner.create_notification_with_count(entry, count).await
    }

    async fn list_notifications(&self, limit: i64) -> StorageResult<Vec<StoredNotification>> {
        self.inner.list_notifications(limit).await
    }

    async fn save_state(&self, key: &str, value: &serde_json::Value) -> StorageResult<()> {
        self.inner.save_state(key, value).await
    }

    async fn load_state(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        self.inner.load_state(key).await
    }
}

async fn harness_with(provider: ScriptedProvider, settings: ResolverSettings) -> Harness {
    let repo = create_repo().await;
    harness_on(repo, provider, settings)
}

fn harness_on(
    repo: Arc<dyn GeoRepository>,
    provider: ScriptedProvider,
    settings: ResolverSettings,
) -> Harness {
    let provider = Arc::new(provider);
    let locations = Arc::new(CachedLocations::new(Arc::clone(&repo), 1_000, 300));
    let ingest = Arc::new(RunFlag::new());
    let resolver = Arc::new(GeoResolver::new(
        Arc::clone(&repo),
        provider.clone() as Arc<dyn GeoProvider>,
        locations,
        Arc::clone(&ingest),
        settings,
    ));
    Harness {
        repo,
        provider,
        ingest,
        resolver,
    }
}

async fn harness() -> Harness {
    harness_with(ScriptedProvider::default(), ResolverSettings::default()).await
}

fn ips(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn resolved(domestic: &str, global: &str, source: &str) -> GeoResolution {
    GeoResolution::Resolved {
        domestic: domestic.to_string(),
        global: global.to_string(),
        source: source.to_string(),
    }
}

fn pending_log(website_id: &str, ip: &str) -> NewAccessLog {
    NewAccessLog {
        website_id: website_id.to_string(),
        ip: ip.to_string(),
        timestamp: 1_700_000_000,
        method: "GET".to_string(),
        url: "/".to_string(),
        status: 200,
        domestic_location: PENDING_LOCATION_LABEL.to_string(),
        global_location: PENDING_LOCATION_LABEL.to_string(),
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[tokio::test]
async fn test_resolves_and_normalizes_carrier_location() {
    let h = harness().await;
    h.provider.answer("1.2.3.4", "广东·深圳·电信", "中国");
    h.repo.upsert_pending(&ips(&["1.2.3.4"])).await.unwrap();
    h.repo.insert_access_log(&pending_log("blog", "1.2.3.4")).await.unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 1);

    let cache = h.repo.get_geo_cache(&ips(&["1.2.3.4"])).await.unwrap();
    assert_eq!(cache["1.2.3.4"].location, resolved("广东·深圳", "中国", "scripted"));
    assert_eq!(h.repo.count_pending().await.unwrap(), 0);

    let logs = h.repo.list_access_logs("blog", 10).await.unwrap();
    assert_eq!(logs[0].domestic_location, "广东·深圳");
    assert_eq!(logs[0].global_location, "中国");

    let progress = h.resolver.progress();
    assert!(!progress.running);
    assert_eq!(progress.processed, 1);
    assert_eq!(progress.pending_total, 1);
    assert!(progress.finished_at.is_some());
}

#[tokio::test]
async fn test_batch_error_leaves_ips_pending_with_single_notification() {
    let h = harness().await;
    h.provider.batch_error.store(true, Ordering::SeqCst);
    let batch = ips(&["1.1.1.1", "1.1.1.2", "1.1.1.3", "1.1.1.4", "1.1.1.5"]);
    h.repo.upsert_pending(&batch).await.unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 0);
    assert_eq!(h.repo.count_pending().await.unwrap(), 5);

    for ip in &batch {
        let failures = h.repo.list_geo_failures(ip).await.unwrap();
        assert_eq!(failures.len(), 1, "ip {}", ip);
        assert_eq!(failures[0].reason, "request_error");
        assert_eq!(failures[0].provider, "scripted");
    }

    let notifications = h.repo.list_notifications(10).await.unwrap();
    assert_eq!(notifications.len(), 1);
    let notification = &notifications[0];
    assert_eq!(notification.fingerprint, "ip_geo_api_failure");
    assert_eq!(notification.level, "warning");
    let metadata = notification.metadata_json();
    assert_eq!(metadata["count"], 5);
    assert_eq!(metadata["samples"].as_array().unwrap().len(), 3);
    assert_eq!(metadata["provider"], "scripted");

    // Failed IPs are cooling down, so the next pass does not call the provider
    assert_eq!(h.resolver.resolve_batch(0).await, 0);
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn test_partial_success_commits_resolved_ips() {
    let h = harness().await;
    h.provider.answer("1.1.1.1", "上海", "中国");
    h.provider.batch_error.store(true, Ordering::SeqCst);
    h.repo.upsert_pending(&ips(&["1.1.1.1", "2.2.2.2"])).await.unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    assert_eq!(h.repo.count_pending().await.unwrap(), 1);
    assert_eq!(h.repo.list_geo_failures("2.2.2.2").await.unwrap().len(), 1);
    assert!(h.repo.list_geo_failures("1.1.1.1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_per_ip_failure_is_recorded_with_reason() {
    let h = harness().await;
    h.provider
        .per_ip_failures
        .lock()
        .unwrap()
        .insert("3.3.3.3".to_string(), "invalid query".to_string());
    h.repo.upsert_pending(&ips(&["3.3.3.3"])).await.unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 0);
    let failures = h.repo.list_geo_failures("3.3.3.3").await.unwrap();
    assert_eq!(failures[0].reason, "invalid query");
    assert_eq!(h.repo.count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn test_cooldown_excludes_recent_failures_only() {
    let h = harness().await;
    h.provider.answer("1.1.1.1", "北京", "中国");
    h.provider.answer("2.2.2.2", "北京", "中国");
    h.repo.upsert_pending(&ips(&["1.1.1.1", "2.2.2.2"])).await.unwrap();

    let mut expired = HashMap::new();
    expired.insert("1.1.1.1".to_string(), "request_error".to_string());
    h.repo
        .insert_geo_failures(&expired, "scripted", "", now() - 13 * 3600)
        .await
        .unwrap();
    let mut recent = HashMap::new();
    recent.insert("2.2.2.2".to_string(), "request_error".to_string());
    h.repo
        .insert_geo_failures(&recent, "scripted", "", now() - 3600)
        .await
        .unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    assert_eq!(h.provider.requested(), ips(&["1.1.1.1"]));
    assert_eq!(
        h.repo.fetch_pending_with_cooldown(10, i64::MAX).await.unwrap(),
        ips(&["2.2.2.2"])
    );
}

#[tokio::test]
async fn test_no_data_is_cached_as_unknown_then_retried() {
    let h = harness().await;
    h.repo.upsert_pending(&ips(&["5.5.5.5"])).await.unwrap();
    h.repo.insert_access_log(&pending_log("blog", "5.5.5.5")).await.unwrap();

    // Terminal even without data: retired with an unknown cache entry
    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    assert_eq!(h.repo.count_pending().await.unwrap(), 0);
    let cache = h.repo.get_geo_cache(&ips(&["5.5.5.5"])).await.unwrap();
    assert_eq!(cache["5.5.5.5"].location, GeoResolution::Unresolved);
    let logs = h.repo.list_access_logs("blog", 10).await.unwrap();
    assert_eq!(logs[0].domestic_location, "未知");

    // Re-enqueued later, the unknown entry is purged and looked up again
    h.provider.answer("5.5.5.5", "浙江·杭州", "中国");
    h.repo.upsert_pending(&ips(&["5.5.5.5"])).await.unwrap();
    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    assert_eq!(h.provider.calls(), 2);

    let cache = h.repo.get_geo_cache(&ips(&["5.5.5.5"])).await.unwrap();
    assert_eq!(cache["5.5.5.5"].location, resolved("浙江·杭州", "中国", "scripted"));
}

#[tokio::test]
async fn test_cached_ips_skip_the_provider() {
    let h = harness().await;
    let mut entries = HashMap::new();
    entries.insert("6.6.6.6".to_string(), resolved("四川·成都", "中国", "ip-api"));
    h.repo.upsert_geo_cache(&entries).await.unwrap();
    h.repo.upsert_pending(&ips(&["6.6.6.6"])).await.unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    assert_eq!(h.provider.calls(), 0);
    assert_eq!(h.repo.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_resolve_runs_once() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let provider = ScriptedProvider {
        gate: Some((Arc::clone(&entered), Arc::clone(&release))),
        ..Default::default()
    };
    provider.answer("7.7.7.7", "上海", "中国");
    let h = harness_with(provider, ResolverSettings::default()).await;
    h.repo.upsert_pending(&ips(&["7.7.7.7"])).await.unwrap();

    let resolver = Arc::clone(&h.resolver);
    let first = tokio::spawn(async move { resolver.resolve_batch(0).await });

    entered.notified().await;
    assert!(h.resolver.is_running());
    assert_eq!(h.resolver.resolve_batch(0).await, 0);

    release.notify_one();
    assert_eq!(first.await.unwrap(), 1);
    assert_eq!(h.provider.calls(), 1);
    assert!(!h.resolver.is_running());
}

#[tokio::test]
async fn test_defers_while_ingestion_runs() {
    let h = harness().await;
    h.provider.answer("8.8.4.4", "北京", "中国");
    h.repo.upsert_pending(&ips(&["8.8.4.4"])).await.unwrap();

    assert!(h.ingest.try_start());
    assert_eq!(h.resolver.resolve_batch(0).await, 0);
    assert_eq!(h.provider.calls(), 0);
    h.ingest.finish();

    assert_eq!(h.resolver.resolve_batch(0).await, 1);
}

#[tokio::test]
async fn test_recovery_backfills_cached_and_requeues_the_rest() {
    let settings = ResolverSettings {
        website_ids: vec!["blog".to_string()],
        ..Default::default()
    };
    let h = harness_with(ScriptedProvider::default(), settings).await;

    let mut entries = HashMap::new();
    entries.insert("9.9.9.1".to_string(), resolved("江苏·南京", "中国", "ip-api"));
    h.repo.upsert_geo_cache(&entries).await.unwrap();
    h.repo.insert_access_log(&pending_log("blog", "9.9.9.1")).await.unwrap();
    h.repo.insert_access_log(&pending_log("blog", "9.9.9.2")).await.unwrap();
    h.repo.insert_access_log(&pending_log("other", "9.9.9.3")).await.unwrap();

    // Nothing pending: recovery runs and reports the cache backfill
    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    assert_eq!(h.provider.calls(), 0);

    let logs = h.repo.list_access_logs("blog", 10).await.unwrap();
    let recovered = logs.iter().find(|log| log.ip == "9.9.9.1").unwrap();
    assert_eq!(recovered.domestic_location, "江苏·南京");

    // Only the configured website is scanned
    assert_eq!(
        h.repo.fetch_pending_with_cooldown(10, i64::MAX).await.unwrap(),
        ips(&["9.9.9.2"])
    );

    h.provider.answer("9.9.9.2", "江苏·苏州", "中国");
    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    assert!(!h.resolver.has_pending().await);
}

#[tokio::test]
async fn test_recovery_respects_limit() {
    let settings = ResolverSettings {
        website_ids: vec!["blog".to_string()],
        recovery_limit: 2,
        ..Default::default()
    };
    let h = harness_with(ScriptedProvider::default(), settings).await;
    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
        h.repo.insert_access_log(&pending_log("blog", ip)).await.unwrap();
    }

    assert_eq!(h.resolver.resolve_batch(0).await, 0);
    assert_eq!(h.resolver.pending_count().await, 2);
}

#[tokio::test]
async fn test_cache_limit_evicts_unknown_first() {
    let settings = ResolverSettings {
        cache_limit: 2,
        ..Default::default()
    };
    let h = harness_with(ScriptedProvider::default(), settings).await;

    let mut entries = HashMap::new();
    entries.insert("11.0.0.1".to_string(), GeoResolution::Unresolved);
    entries.insert("11.0.0.2".to_string(), resolved("广东", "中国", "ip-api"));
    h.repo.upsert_geo_cache(&entries).await.unwrap();

    h.provider.answer("11.0.0.3", "福建·厦门", "中国");
    h.repo.upsert_pending(&ips(&["11.0.0.3"])).await.unwrap();
    assert_eq!(h.resolver.resolve_batch(0).await, 1);

    assert_eq!(h.repo.count_geo_cache().await.unwrap(), 2);
    let remaining = h
        .repo
        .get_geo_cache(&ips(&["11.0.0.1", "11.0.0.2", "11.0.0.3"]))
        .await
        .unwrap();
    assert!(!remaining.contains_key("11.0.0.1"));
    assert!(remaining.contains_key("11.0.0.3"));
}

#[tokio::test]
async fn test_prepare_locations_enqueues_misses() {
    let h = harness().await;
    let mut entries = HashMap::new();
    entries.insert("12.0.0.1".to_string(), resolved("湖北·武汉", "中国", "ip-api"));
    entries.insert("12.0.0.2".to_string(), GeoResolution::Unresolved);
    h.repo.upsert_geo_cache(&entries).await.unwrap();

    let prepared = h
        .resolver
        .prepare_locations(&ips(&["12.0.0.1", "12.0.0.2", "12.0.0.3", "12.0.0.3", " "]))
        .await;

    assert_eq!(prepared.len(), 3);
    assert_eq!(prepared["12.0.0.1"].domestic, "湖北·武汉");
    assert_eq!(prepared["12.0.0.2"].domestic, PENDING_LOCATION_LABEL);
    assert_eq!(prepared["12.0.0.3"].global, PENDING_LOCATION_LABEL);

    let mut pending = h.repo.fetch_pending_with_cooldown(10, i64::MAX).await.unwrap();
    pending.sort();
    assert_eq!(pending, ips(&["12.0.0.2", "12.0.0.3"]));
}

#[tokio::test]
async fn test_zero_limit_uses_batch_size() {
    let settings = ResolverSettings {
        batch_size: 2,
        ..Default::default()
    };
    let h = harness_with(ScriptedProvider::default(), settings).await;
    h.repo
        .upsert_pending(&ips(&["13.0.0.1", "13.0.0.2", "13.0.0.3"]))
        .await
        .unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 2);
    assert_eq!(h.resolver.resolve_batch(5).await, 1);
    assert_eq!(h.resolver.pending_count().await, 0);
}

#[tokio::test]
async fn test_cache_outage_still_retires_and_backfills() {
    let settings = ResolverSettings {
        cache_limit: 1,
        ..Default::default()
    };
    let storage = create_repo().await;
    let repo: Arc<dyn GeoRepository> = Arc::new(CacheOutage {
        inner: Arc::clone(&storage),
    });
    let h = harness_on(repo, ScriptedProvider::default(), settings);

    h.provider.answer("14.0.0.1", "广东·深圳·电信", "中国");
    h.repo.upsert_pending(&ips(&["14.0.0.1", "14.0.0.2"])).await.unwrap();
    h.repo.insert_access_log(&pending_log("blog", "14.0.0.1")).await.unwrap();
    h.repo.insert_access_log(&pending_log("blog", "14.0.0.2")).await.unwrap();

    // Cache reads, writes, purges and trims all fail; the batch goes through anyway
    assert_eq!(h.resolver.resolve_batch(0).await, 2);
    assert_eq!(h.repo.count_pending().await.unwrap(), 0);
    assert_eq!(storage.count_geo_cache().await.unwrap(), 0);

    let mut logs = h.repo.list_access_logs("blog", 10).await.unwrap();
    logs.sort_by(|a, b| a.ip.cmp(&b.ip));
    assert_eq!(logs[0].domestic_location, "广东·深圳");
    assert_eq!(logs[1].domestic_location, "未知");
    assert!(h.repo.list_geo_failures("14.0.0.1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_is_persisted_after_each_batch() {
    let settings = ResolverSettings {
        batch_size: 1,
        ..Default::default()
    };
    let h = harness_with(ScriptedProvider::default(), settings).await;
    assert_eq!(load_progress(h.repo.as_ref()).await.unwrap(), None);

    h.provider.answer("15.0.0.1", "江苏·南京", "中国");
    h.provider.answer("15.0.0.2", "江苏·苏州", "中国");
    h.repo.upsert_pending(&ips(&["15.0.0.1", "15.0.0.2"])).await.unwrap();

    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    let stored = load_progress(h.repo.as_ref()).await.unwrap().unwrap();
    assert_eq!(stored, h.resolver.progress());
    assert!(stored.running);
    assert_eq!(stored.processed, 1);
    assert_eq!(stored.pending_total, 2);

    assert_eq!(h.resolver.resolve_batch(0).await, 1);
    let stored = load_progress(h.repo.as_ref()).await.unwrap().unwrap();
    assert!(!stored.running);
    assert_eq!(stored.processed, 2);
    assert!(stored.finished_at.is_some());
}
