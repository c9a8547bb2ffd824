use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::WhitelistConfig;
use crate::geo::normalize::{is_china_global, location_match_key};
use crate::models::{GeoResolution, UNKNOWN_LOCATION};
use crate::storage::CachedLocations;
use crate::whitelist::client_ip::{normalize_client_ip, parse_ip};
use crate::whitelist::rules::{RuleKind, WhitelistRule};

/// Domestic localities outside mainland jurisdiction
pub const NON_MAINLAND_KEYWORDS: &[&str] = &[
    "香港", "澳门", "台湾", "台北", "台中", "台南", "高雄", "新北", "桃园", "基隆", "嘉义",
    "新竹", "屏东",
];

/// Read-only access to already-resolved locations
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Cached location for `ip`; never triggers a lookup
    async fn cached_location(&self, ip: &str) -> Option<GeoResolution>;
}

#[async_trait]
impl LocationSource for CachedLocations {
    async fn cached_location(&self, ip: &str) -> Option<GeoResolution> {
        self.lookup(ip).await
    }
}

/// A satisfied whitelist rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhitelistMatch {
    pub rule_type: RuleKind,
    pub rule_value: String,
    pub domestic: Option<String>,
    pub global: Option<String>,
}

impl WhitelistMatch {
    fn address(rule: &WhitelistRule) -> Self {
        Self {
            rule_type: rule.kind(),
            rule_value: rule.value(),
            domestic: None,
            global: None,
        }
    }

    fn location(rule: &WhitelistRule, domestic: &str, global: &str) -> Self {
        Self {
            rule_type: rule.kind(),
            rule_value: rule.value(),
            domestic: Some(domestic.to_string()),
            global: Some(global.to_string()),
        }
    }
}

/// Immutable whitelist evaluator, safe to share across workers
pub struct WhitelistMatcher {
    enabled: bool,
    exact: HashSet<IpAddr>,
    networks: Vec<WhitelistRule>,
    ranges: Vec<WhitelistRule>,
    cities: Vec<WhitelistRule>,
    non_mainland: bool,
    locations: Option<Arc<dyn LocationSource>>,
}

impl WhitelistMatcher {
    /// Compile the configured rules. Malformed entries are skipped.
    pub fn new(config: &WhitelistConfig) -> Self {
        let mut exact = HashSet::new();
        let mut networks = Vec::new();
        let mut ranges = Vec::new();

        for raw in &config.ips {
            match WhitelistRule::parse_address(raw) {
                Some(WhitelistRule::ExactIp(ip)) => {
                    exact.insert(ip);
                }
                Some(rule @ WhitelistRule::Cidr { .. }) => networks.push(rule),
                Some(rule @ WhitelistRule::Range { .. }) => ranges.push(rule),
                Some(_) => {}
                None => {
                    if !raw.trim().is_empty() {
                        tracing::warn!("Ignoring malformed whitelist rule '{}'", raw);
                    }
                }
            }
        }

        let cities = config
            .cities
            .iter()
            .filter_map(|raw| WhitelistRule::city(raw))
            .collect();

        Self {
            enabled: config.enabled,
            exact,
            networks,
            ranges,
            cities,
            non_mainland: config.non_mainland,
            locations: None,
        }
    }

    /// Attach the cached-location source consulted by city and non-mainland rules
    pub fn with_locations(mut self, locations: Arc<dyn LocationSource>) -> Self {
        self.locations = Some(locations);
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether any city or non-mainland rule is configured
    pub fn has_location_rules(&self) -> bool {
        !self.cities.is_empty() || self.non_mainland
    }

    /// Evaluate a raw client IP. Address rules win over location rules.
    pub async fn match_ip(&self, raw_ip: &str) -> Option<WhitelistMatch> {
        if !self.enabled {
            return None;
        }
        let normalized = normalize_client_ip(raw_ip)?;

        if let Some(found) = self.match_address(&normalized) {
            return Some(found);
        }

        if !self.has_location_rules() {
            return None;
        }
        let locations = self.locations.as_ref()?;
        match locations.cached_location(&normalized).await? {
            GeoResolution::Resolved {
                domestic, global, ..
            } => self.match_location(&domestic, &global),
            GeoResolution::Unresolved => None,
        }
    }

    /// Exact, CIDR and range rules, in that order
    pub fn match_address(&self, normalized_ip: &str) -> Option<WhitelistMatch> {
        let ip = parse_ip(normalized_ip)?;

        if self.exact.contains(&ip) {
            return Some(WhitelistMatch::address(&WhitelistRule::ExactIp(ip)));
        }

        self.networks
            .iter()
            .chain(self.ranges.iter())
            .find(|rule| rule.contains(&ip))
            .map(WhitelistMatch::address)
    }

    /// City rules in configured order, then the non-mainland rule
    pub fn match_location(&self, domestic: &str, global: &str) -> Option<WhitelistMatch> {
        let location_key = location_match_key(domestic);
        if !location_key.is_empty() {
            let city = self.cities.iter().find(|rule| match rule {
                WhitelistRule::City { key, .. } => location_key.contains(key.as_str()),
                _ => false,
            });
            if let Some(rule) = city {
                return Some(WhitelistMatch::location(rule, domestic, global));
            }
        }

        if self.non_mainland && is_non_mainland(domestic, global) {
            return Some(WhitelistMatch::location(
                &WhitelistRule::NonMainland,
                domestic,
                global,
            ));
        }

        None
    }
}

/// Outside mainland China: any non-China country, or a Chinese locality in the
/// keyword table. Unknown values never qualify.
pub fn is_non_mainland(domestic: &str, global: &str) -> bool {
    let global = global.trim();
    if global.is_empty() || global == UNKNOWN_LOCATION {
        return false;
    }
    if !is_china_global(global) {
        return true;
    }

    let domestic = domestic.trim();
    if domestic.is_empty() || domestic == UNKNOWN_LOCATION {
        return false;
    }
    NON_MAINLAND_KEYWORDS
        .iter()
        .any(|keyword| domestic.contains(keyword))
}
