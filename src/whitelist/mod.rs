//! Access whitelist evaluation and hit reporting

pub mod client_ip;
pub mod hits;
pub mod matcher;
pub mod rules;

pub use client_ip::normalize_client_ip;
pub use hits::{scan_records, whitelist_fingerprint, WhitelistHit, WhitelistHits};
pub use matcher::{is_non_mainland, LocationSource, WhitelistMatch, WhitelistMatcher};
pub use rules::{RuleKind, WhitelistRule};
