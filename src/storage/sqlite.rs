use crate::models::{
    AccessLogRecord, GeoApiFailure, GeoCacheEntry, GeoCacheRow, GeoResolution, NewAccessLog,
    StoredNotification, SystemNotification,
};
use crate::storage::{GeoRepository, StorageError, StorageResult};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on bound parameters per `IN (...)` statement
const IN_CHUNK_SIZE: usize = 500;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn subject_for(ips: &[String]) -> String {
    match ips {
        [] => "no ips".to_string(),
        [ip] => ip.clone(),
        [first, rest @ ..] => format!("{} and {} more", first, rest.len()),
    }
}

#[async_trait]
impl GeoRepository for SqliteStorage {
    async fn init(&self) -> StorageResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS ip_geo_pending (
                ip TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ip_geo_pending_created ON ip_geo_pending(created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS ip_geo_cache (
                ip TEXT PRIMARY KEY,
                domestic TEXT NOT NULL,
                global TEXT NOT NULL,
                source TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ip_geo_cache_updated ON ip_geo_cache(updated_at)",
            r#"
            CREATE TABLE IF NOT EXISTS ip_geo_api_failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL,
                provider TEXT NOT NULL,
                reason TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT '',
                occurred_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ip_geo_failures_ip
                ON ip_geo_api_failures(ip, occurred_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS access_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                website_id TEXT NOT NULL,
                ip TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                method TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL DEFAULT 0,
                domestic_location TEXT NOT NULL DEFAULT '',
                global_location TEXT NOT NULL DEFAULT ''
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_access_logs_website_ip ON access_logs(website_id, ip)",
            "CREATE INDEX IF NOT EXISTS idx_access_logs_ip ON access_logs(ip)",
            r#"
            CREATE TABLE IF NOT EXISTS system_notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                metadata TEXT NOT NULL DEFAULT '{}',
                occurrences INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS resolver_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(self.pool.as_ref())
                .await
                .map_err(|e| StorageError::query("create schema", "sqlite", e))?;
        }

        Ok(())
    }

    async fn count_pending(&self) -> StorageResult<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ip_geo_pending")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::query("count pending", "ip_geo_pending", e))?;

        Ok(count.max(0) as u64)
    }

    async fn upsert_pending(&self, ips: &[String]) -> StorageResult<()> {
        if ips.is_empty() {
            return Ok(());
        }

        let created_at = now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::query("enqueue pending", subject_for(ips), e))?;

        for ip in ips {
            sqlx::query(
                r#"
                INSERT INTO ip_geo_pending (ip, created_at)
                VALUES (?, ?)
                ON CONFLICT(ip) DO NOTHING
                "#,
            )
            .bind(ip)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::query("enqueue pending", ip.clone(), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::query("enqueue pending", subject_for(ips), e))?;

        Ok(())
    }

    async fn fetch_pending_with_cooldown(
        &self,
        limit: usize,
        cooldown_cutoff: i64,
    ) -> StorageResult<Vec<String>> {
        let ips = sqlx::query_scalar::<_, String>(
            r#"
            SELECT p.ip
            FROM ip_geo_pending p
            WHERE NOT EXISTS (
                SELECT 1 FROM ip_geo_api_failures f
                WHERE f.ip = p.ip AND f.occurred_at >= ?
            )
            ORDER BY p.created_at ASC, p.rowid ASC
            LIMIT ?
            "#,
        )
        .bind(cooldown_cutoff)
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("fetch pending", "ip_geo_pending", e))?;

        Ok(ips)
    }

    async fn delete_pending(&self, ips: &[String]) -> StorageResult<()> {
        for chunk in ips.chunks(IN_CHUNK_SIZE) {
            let mut builder =
                QueryBuilder::<Sqlite>::new("DELETE FROM ip_geo_pending WHERE ip IN (");
            let mut separated = builder.separated(", ");
            for ip in chunk {
                separated.push_bind(ip.as_str());
            }
            separated.push_unseparated(")");

            builder
                .build()
                .execute(self.pool.as_ref())
                .await
                .map_err(|e| StorageError::query("delete pending", subject_for(chunk), e))?;
        }

        Ok(())
    }

    async fn get_geo_cache(&self, ips: &[String]) -> StorageResult<HashMap<String, GeoCacheEntry>> {
        let mut entries = HashMap::with_capacity(ips.len());

        for chunk in ips.chunks(IN_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT ip, domestic, global, source, updated_at FROM ip_geo_cache WHERE ip IN (",
            );
            let mut separated = builder.separated(", ");
            for ip in chunk {
                separated.push_bind(ip.as_str());
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<GeoCacheRow>()
                .fetch_all(self.pool.as_ref())
                .await
                .map_err(|e| StorageError::query("read geo cache", subject_for(chunk), e))?;

            for row in rows {
                let entry = GeoCacheEntry::from(row);
                entries.insert(entry.ip.clone(), entry);
            }
        }

        Ok(entries)
    }

    async fn upsert_geo_cache(
        &self,
        entries: &HashMap<String, GeoResolution>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let updated_at = now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::query("write geo cache", "ip_geo_cache", e))?;

        for (ip, location) in entries {
            sqlx::query(
                r#"
                INSERT INTO ip_geo_cache (ip, domestic, global, source, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(ip) DO UPDATE SET
                    domestic = excluded.domestic,
                    global = excluded.global,
                    source = excluded.source,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(ip)
            .bind(location.domestic())
            .bind(location.global())
            .bind(location.source())
            .bind(updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::query("write geo cache", ip.clone(), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::query("write geo cache", "ip_geo_cache", e))?;

        Ok(())
    }

    async fn delete_geo_cache(&self, ips: &[String]) -> StorageResult<()> {
        for chunk in ips.chunks(IN_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM ip_geo_cache WHERE ip IN (");
            let mut separated = builder.separated(", ");
            for ip in chunk {
                separated.push_bind(ip.as_str());
            }
            separated.push_unseparated(")");

            builder
                .build()
                .execute(self.pool.as_ref())
                .await
                .map_err(|e| StorageError::query("delete geo cache", subject_for(chunk), e))?;
        }

        Ok(())
    }

    async fn trim_geo_cache(&self, max_size: u64) -> StorageResult<u64> {
        let total = self.count_geo_cache().await?;
        if total <= max_size {
            return Ok(0);
        }

        let excess = (total - max_size) as i64;
        let result = sqlx::query(
            r#"
            DELETE FROM ip_geo_cache
            WHERE ip IN (
                SELECT ip FROM ip_geo_cache
                ORDER BY CASE WHEN source = 'unknown' THEN 0 ELSE 1 END, updated_at ASC, ip ASC
                LIMIT ?
            )
            "#,
        )
        .bind(excess)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("trim geo cache", format!("max size {}", max_size), e))?;

        Ok(result.rows_affected())
    }

    async fn count_geo_cache(&self) -> StorageResult<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ip_geo_cache")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::query("count geo cache", "ip_geo_cache", e))?;

        Ok(count.max(0) as u64)
    }

    async fn insert_geo_failures(
        &self,
        failures: &HashMap<String, String>,
        provider: &str,
        detail: &str,
        occurred_at: i64,
    ) -> StorageResult<()> {
        if failures.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::query("record geo failures", provider, e))?;

        for (ip, reason) in failures {
            sqlx::query(
                r#"
                INSERT INTO ip_geo_api_failures (ip, provider, reason, detail, occurred_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(ip)
            .bind(provider)
            .bind(reason)
            .bind(detail)
            .bind(occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::query("record geo failure", ip.clone(), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::query("record geo failures", provider, e))?;

        Ok(())
    }

    async fn list_geo_failures(&self, ip: &str) -> StorageResult<Vec<GeoApiFailure>> {
        let failures = sqlx::query_as::<_, GeoApiFailure>(
            r#"
            SELECT ip, provider, reason, detail, occurred_at
            FROM ip_geo_api_failures
            WHERE ip = ?
            ORDER BY occurred_at DESC, id DESC
            "#,
        )
        .bind(ip)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("list geo failures", ip, e))?;

        Ok(failures)
    }

    async fn insert_access_log(&self, record: &NewAccessLog) -> StorageResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO access_logs
                (website_id, ip, timestamp, method, url, status, domestic_location, global_location)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.website_id)
        .bind(&record.ip)
        .bind(record.timestamp)
        .bind(&record.method)
        .bind(&record.url)
        .bind(record.status)
        .bind(&record.domestic_location)
        .bind(&record.global_location)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("insert access log", record.ip.clone(), e))?;

        Ok(result.last_insert_rowid())
    }

    async fn list_access_logs(
        &self,
        website_id: &str,
        limit: i64,
    ) -> StorageResult<Vec<AccessLogRecord>> {
        let records = sqlx::query_as::<_, AccessLogRecord>(
            r#"
            SELECT id, website_id, ip, timestamp, method, url, status,
                   domestic_location, global_location
            FROM access_logs
            WHERE website_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(website_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("list access logs", website_id, e))?;

        Ok(records)
    }

    async fn fetch_pending_ips_from_logs(
        &self,
        website_id: &str,
        placeholder: &str,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let ips = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT ip
            FROM access_logs
            WHERE website_id = ?
              AND ip != ''
              AND (domestic_location = ? OR global_location = ?)
            LIMIT ?
            "#,
        )
        .bind(website_id)
        .bind(placeholder)
        .bind(placeholder)
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("scan logs for pending ips", website_id, e))?;

        Ok(ips)
    }

    async fn update_log_locations(
        &self,
        locations: &HashMap<String, GeoResolution>,
        placeholder: &str,
    ) -> StorageResult<u64> {
        if locations.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::query("backfill log locations", "access_logs", e))?;

        let mut updated = 0;
        for (ip, location) in locations {
            let result = sqlx::query(
                r#"
                UPDATE access_logs
                SET domestic_location = ?, global_location = ?
                WHERE ip = ? AND (domestic_location = ? OR global_location = ?)
                "#,
            )
            .bind(location.domestic())
            .bind(location.global())
            .bind(ip)
            .bind(placeholder)
            .bind(placeholder)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::query("backfill log location", ip.clone(), e))?;

            updated += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::query("backfill log locations", "access_logs", e))?;

        Ok(updated)
    }

    async fn create_notification_with_count(
        &self,
        entry: &SystemNotification,
        count: u64,
    ) -> StorageResult<()> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        let timestamp = now();

        sqlx::query(
            r#"
            INSERT INTO system_notifications
                (level, category, title, message, fingerprint, metadata,
                 occurrences, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                level = excluded.level,
                title = excluded.title,
                message = excluded.message,
                metadata = excluded.metadata,
                occurrences = system_notifications.occurrences + excluded.occurrences,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entry.level.as_str())
        .bind(&entry.category)
        .bind(&entry.title)
        .bind(&entry.message)
        .bind(&entry.fingerprint)
        .bind(metadata)
        .bind(count.max(1) as i64)
        .bind(timestamp)
        .bind(timestamp)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("create notification", entry.fingerprint.clone(), e))?;

        Ok(())
    }

    async fn list_notifications(&self, limit: i64) -> StorageResult<Vec<StoredNotification>> {
        let notifications = sqlx::query_as::<_, StoredNotification>(
            r#"
            SELECT id, level, category, title, message, fingerprint, metadata,
                   occurrences, created_at, updated_at
            FROM system_notifications
            ORDER BY updated_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("list notifications", "system_notifications", e))?;

        Ok(notifications)
    }

    async fn save_state(&self, key: &str, value: &serde_json::Value) -> StorageResult<()> {
        let encoded = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO resolver_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(encoded)
        .bind(now())
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::query("save state", key, e))?;

        Ok(())
    }

    async fn load_state(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        let raw = sqlx::query_scalar::<_, String>("SELECT value FROM resolver_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::query("load state", key, e))?;

        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StorageError::from)
    }
}
