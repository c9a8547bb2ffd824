//! Client IP normalization for whitelist lookups
//!
//! Log records carry the client address in whatever shape the upstream wrote it:
//! a bare address, `host:port`, `[v6]:port`, or an X-Forwarded-For list.

use std::net::{IpAddr, SocketAddr};

/// Canonical form of a raw client address.
///
/// Takes the first entry of a comma-separated forwarded list, unwraps bracketed
/// IPv6 literals and strips a trailing port. Valid addresses come back in their
/// canonical textual form (IPv4-mapped IPv6 collapses to IPv4); anything else is
/// returned trimmed. Returns `None` for empty input.
pub fn normalize_client_ip(raw: &str) -> Option<String> {
    let mut candidate = raw.trim();

    if candidate.contains(',') {
        candidate = candidate
            .split(',')
            .map(str::trim)
            .find(|part| !part.is_empty())?;
    }

    if let Some(rest) = candidate.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            if !host.is_empty() {
                candidate = host;
            }
        }
    }

    if let Ok(addr) = candidate.parse::<SocketAddr>() {
        return Some(addr.ip().to_canonical().to_string());
    }
    if candidate.matches(':').count() == 1 && candidate.contains('.') {
        if let Some((host, _)) = candidate.split_once(':') {
            if !host.is_empty() {
                candidate = host;
            }
        }
    }

    if let Some(ip) = parse_ip(candidate) {
        return Some(ip.to_string());
    }

    (!candidate.is_empty()).then(|| candidate.to_string())
}

/// Parse an address, folding IPv4-mapped IPv6 into IPv4
pub fn parse_ip(value: &str) -> Option<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .ok()
        .map(|ip| ip.to_canonical())
}
