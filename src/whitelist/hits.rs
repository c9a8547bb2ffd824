//! Deduplicated whitelist hit reporting
//!
//! Hits are collapsed per fingerprint (website, rule, IP) for the duration of a
//! processing batch and flushed as one counted notification each.

use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use tracing::warn;

use crate::config::WebsiteConfig;
use crate::models::{AccessLogRecord, NotificationLevel, SystemNotification};
use crate::storage::GeoRepository;
use crate::whitelist::client_ip::normalize_client_ip;
use crate::whitelist::matcher::{WhitelistMatch, WhitelistMatcher};
use crate::whitelist::rules::RuleKind;

/// One aggregated hit: the first record seen plus a running count
#[derive(Debug, Clone)]
pub struct WhitelistHit {
    pub count: u64,
    pub website_id: String,
    pub matched: WhitelistMatch,
    pub record: AccessLogRecord,
}

/// Deduplication key for a whitelist hit, or `None` when a part is missing
pub fn whitelist_fingerprint(
    website_id: &str,
    rule_type: RuleKind,
    rule_value: &str,
    ip: &str,
) -> Option<String> {
    let website_id = website_id.trim();
    let ip = ip.trim();
    if website_id.is_empty() || ip.is_empty() {
        return None;
    }

    let rule_value = match rule_value.trim() {
        "" => "-",
        value => value,
    };
    Some(format!(
        "whitelist:{}:{}:{}:{}",
        website_id, rule_type, rule_value, ip
    ))
}

/// Concurrent hit aggregate for one processing batch
#[derive(Debug, Default)]
pub struct WhitelistHits {
    hits: DashMap<String, WhitelistHit>,
}

impl WhitelistHits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a hit; returns the fingerprint's count after recording, or 0 if the
    /// hit has no usable fingerprint.
    pub fn record(
        &self,
        website_id: &str,
        record: &AccessLogRecord,
        matched: &WhitelistMatch,
    ) -> u64 {
        let ip = normalize_client_ip(&record.ip).unwrap_or_default();
        let Some(fingerprint) =
            whitelist_fingerprint(website_id, matched.rule_type, &matched.rule_value, &ip)
        else {
            return 0;
        };

        let mut entry = self
            .hits
            .entry(fingerprint)
            .and_modify(|hit| hit.count += 1)
            .or_insert_with(|| WhitelistHit {
                count: 1,
                website_id: website_id.trim().to_string(),
                matched: matched.clone(),
                record: record.clone(),
            });
        entry.value_mut().count
    }

    /// Fold `other` into `self`: counts add up, the first-seen context is kept
    pub fn merge(&self, other: WhitelistHits) {
        for (fingerprint, hit) in other.hits {
            self.hits
                .entry(fingerprint)
                .and_modify(|existing| existing.count += hit.count)
                .or_insert(hit);
        }
    }

    pub fn count(&self, fingerprint: &str) -> u64 {
        self.hits
            .get(fingerprint)
            .map(|hit| hit.count)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Remove and return all aggregated hits keyed by fingerprint
    pub fn drain(&self) -> HashMap<String, WhitelistHit> {
        let keys: Vec<String> = self.hits.iter().map(|entry| entry.key().clone()).collect();

        keys.into_iter()
            .filter_map(|key| self.hits.remove(&key))
            .collect()
    }

    /// Emit one notification per fingerprint and clear the aggregate.
    /// Returns the number of notifications written.
    pub async fn flush(&self, repo: &dyn GeoRepository, websites: &[WebsiteConfig]) -> usize {
        let mut written = 0;
        for (fingerprint, hit) in self.drain() {
            let site_name = websites
                .iter()
                .find(|site| site.id == hit.website_id)
                .map(|site| site.name.as_str())
                .filter(|name| !name.is_empty());

            let entry = hit_notification(&fingerprint, &hit, site_name);
            match repo.create_notification_with_count(&entry, hit.count).await {
                Ok(()) => written += 1,
                Err(e) => warn!("Failed to write whitelist hit notification: {}", e),
            }
        }
        written
    }
}

fn hit_notification(
    fingerprint: &str,
    hit: &WhitelistHit,
    site_name: Option<&str>,
) -> SystemNotification {
    let mut metadata = json!({
        "website_id": hit.website_id,
        "ip": hit.record.ip,
        "url": hit.record.url,
        "method": hit.record.method,
        "status": hit.record.status,
        "timestamp": hit.record.timestamp,
        "rule_type": hit.matched.rule_type.as_str(),
        "rule_value": hit.matched.rule_value,
    });
    if let Some(time) = chrono::DateTime::from_timestamp(hit.record.timestamp, 0) {
        metadata["time"] = json!(time.to_rfc3339());
    }
    if let Some(name) = site_name {
        metadata["website_name"] = json!(name);
    }
    if let Some(domestic) = hit.matched.domestic.as_deref().filter(|d| !d.is_empty()) {
        metadata["domestic_location"] = json!(domestic);
    }
    if let Some(global) = hit.matched.global.as_deref().filter(|g| !g.is_empty()) {
        metadata["global_location"] = json!(global);
    }

    SystemNotification {
        level: NotificationLevel::Info,
        category: "whitelist".to_string(),
        title: "Whitelist hit".to_string(),
        message: hit_message(site_name, &hit.record.ip, &hit.matched),
        fingerprint: fingerprint.to_string(),
        metadata,
    }
}

fn hit_message(site_name: Option<&str>, ip: &str, matched: &WhitelistMatch) -> String {
    let label = matched.rule_type.label();
    let bare = matched.rule_type == RuleKind::NonMainland || matched.rule_value.is_empty();
    let mut message = if bare {
        format!("IP {} matched {} rule", ip, label)
    } else {
        format!("IP {} matched {} rule: {}", ip, label, matched.rule_value)
    };

    if let Some(name) = site_name {
        message = format!("Site {} · {}", name, message);
    }

    let domestic = matched.domestic.as_deref().unwrap_or("").trim();
    let global = matched.global.as_deref().unwrap_or("").trim();
    let location = match (domestic.is_empty(), global.is_empty()) {
        (true, true) => None,
        (true, false) => Some(global.to_string()),
        (false, true) => Some(domestic.to_string()),
        (false, false) => Some(format!("{} / {}", domestic, global)),
    };
    if let Some(location) = location {
        message = format!("{} · location {}", message, location);
    }

    message
}

/// Evaluate a batch of records of one website against the matcher
pub async fn scan_records(
    matcher: &WhitelistMatcher,
    website_id: &str,
    records: &[AccessLogRecord],
) -> WhitelistHits {
    let hits = WhitelistHits::new();
    if !matcher.enabled() {
        return hits;
    }

    for record in records {
        if let Some(matched) = matcher.match_ip(&record.ip).await {
            hits.record(website_id, record, &matched);
        }
    }
    hits
}
