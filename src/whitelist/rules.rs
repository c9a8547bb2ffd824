use ipnet::IpNet;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::geo::normalize::location_match_key;
use crate::whitelist::client_ip::parse_ip;

/// Rule value reported for non-mainland matches
pub const NON_MAINLAND_VALUE: &str = "非大陆";

/// Family of a whitelist rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Ip,
    Cidr,
    Range,
    City,
    NonMainland,
}

impl RuleKind {
    /// Stable identifier, used in fingerprints and notification metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Ip => "ip",
            RuleKind::Cidr => "cidr",
            RuleKind::Range => "range",
            RuleKind::City => "city",
            RuleKind::NonMainland => "non_mainland",
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            RuleKind::Ip => "IP",
            RuleKind::Cidr | RuleKind::Range => "IP range",
            RuleKind::City => "city",
            RuleKind::NonMainland => "non-mainland access",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled whitelist rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistRule {
    ExactIp(IpAddr),
    Cidr { network: IpNet, label: String },
    Range { start: IpAddr, end: IpAddr, label: String },
    City { name: String, key: String },
    NonMainland,
}

impl WhitelistRule {
    /// Parse an address rule: a single IP, a CIDR block (`a/n`) or a range (`a-b`).
    ///
    /// Malformed rules, reversed ranges and ranges mixing IPv4 with IPv6 yield `None`.
    pub fn parse_address(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if trimmed.contains('/') {
            let network = trimmed.parse::<IpNet>().ok()?;
            return Some(WhitelistRule::Cidr {
                network,
                label: trimmed.to_string(),
            });
        }

        if let Some((start, end)) = trimmed.split_once('-') {
            let start = parse_ip(start)?;
            let end = parse_ip(end)?;
            if start.is_ipv4() != end.is_ipv4()
                || compare_ip(&start, &end)? == std::cmp::Ordering::Greater
            {
                return None;
            }
            return Some(WhitelistRule::Range {
                start,
                end,
                label: trimmed.to_string(),
            });
        }

        parse_ip(trimmed).map(WhitelistRule::ExactIp)
    }

    /// Parse a city rule; names that normalize to nothing yield `None`
    pub fn city(raw: &str) -> Option<Self> {
        let name = raw.trim();
        let key = location_match_key(name);
        if key.is_empty() {
            return None;
        }
        Some(WhitelistRule::City {
            name: name.to_string(),
            key,
        })
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            WhitelistRule::ExactIp(_) => RuleKind::Ip,
            WhitelistRule::Cidr { .. } => RuleKind::Cidr,
            WhitelistRule::Range { .. } => RuleKind::Range,
            WhitelistRule::City { .. } => RuleKind::City,
            WhitelistRule::NonMainland => RuleKind::NonMainland,
        }
    }

    /// Value reported when the rule matches
    pub fn value(&self) -> String {
        match self {
            WhitelistRule::ExactIp(ip) => ip.to_string(),
            WhitelistRule::Cidr { label, .. } | WhitelistRule::Range { label, .. } => label.clone(),
            WhitelistRule::City { name, .. } => name.clone(),
            WhitelistRule::NonMainland => NON_MAINLAND_VALUE.to_string(),
        }
    }

    /// Address containment for address-based rules; always false for location rules
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            WhitelistRule::ExactIp(addr) => addr == ip,
            WhitelistRule::Cidr { network, .. } => network.contains(ip),
            WhitelistRule::Range { start, end, .. } => {
                matches!(
                    (compare_ip(ip, start), compare_ip(ip, end)),
                    (Some(lower), Some(upper))
                        if lower != std::cmp::Ordering::Less && upper != std::cmp::Ordering::Greater
                )
            }
            WhitelistRule::City { .. } | WhitelistRule::NonMainland => false,
        }
    }
}

/// Byte-wise ordering of two addresses of the same family; `None` across families
fn compare_ip(a: &IpAddr, b: &IpAddr) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => Some(a.octets().cmp(&b.octets())),
        (IpAddr::V6(a), IpAddr::V6(b)) => Some(a.octets().cmp(&b.octets())),
        _ => None,
    }
}
