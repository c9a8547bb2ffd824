use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored value for both halves of an unresolved location
pub const UNKNOWN_LOCATION: &str = "未知";

/// Provenance recorded for an unresolved location
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Placeholder written into log records while their IP is pending resolution
pub const PENDING_LOCATION_LABEL: &str = "待解析";

/// Location returned by a geolocation provider for a single IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Domestic (province/city) description, e.g. "广东·深圳"
    pub domestic: String,

    /// Global (country-level) description, e.g. "中国"
    pub global: String,

    /// Provider that produced the location
    pub source: String,
}

/// Outcome of resolving an IP, as held by the geo cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GeoResolution {
    Resolved {
        domestic: String,
        global: String,
        source: String,
    },
    Unresolved,
}

impl GeoResolution {
    /// Build a resolution from stored columns.
    ///
    /// Entries whose halves disagree (one side unknown, the other resolved) or whose
    /// source is the unknown marker are treated as unresolved.
    pub fn from_parts(domestic: &str, global: &str, source: &str) -> Self {
        let domestic = domestic.trim();
        let global = global.trim();
        let domestic_unknown = domestic.is_empty() || domestic == UNKNOWN_LOCATION;
        let global_unknown = global.is_empty() || global == UNKNOWN_LOCATION;

        if domestic_unknown || global_unknown || source == UNKNOWN_SOURCE {
            return GeoResolution::Unresolved;
        }

        GeoResolution::Resolved {
            domestic: domestic.to_string(),
            global: global.to_string(),
            source: source.to_string(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, GeoResolution::Resolved { .. })
    }

    pub fn domestic(&self) -> &str {
        match self {
            GeoResolution::Resolved { domestic, .. } => domestic,
            GeoResolution::Unresolved => UNKNOWN_LOCATION,
        }
    }

    pub fn global(&self) -> &str {
        match self {
            GeoResolution::Resolved { global, .. } => global,
            GeoResolution::Unresolved => UNKNOWN_LOCATION,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            GeoResolution::Resolved { source, .. } => source,
            GeoResolution::Unresolved => UNKNOWN_SOURCE,
        }
    }
}

impl From<GeoLocation> for GeoResolution {
    fn from(location: GeoLocation) -> Self {
        GeoResolution::from_parts(&location.domestic, &location.global, &location.source)
    }
}

/// A cached resolution for one IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeoCacheEntry {
    pub ip: String,
    pub location: GeoResolution,
    pub updated_at: i64,
}

/// Raw `ip_geo_cache` row
#[derive(Debug, Clone, FromRow)]
pub struct GeoCacheRow {
    pub ip: String,
    pub domestic: String,
    pub global: String,
    pub source: String,
    pub updated_at: i64,
}

impl From<GeoCacheRow> for GeoCacheEntry {
    fn from(row: GeoCacheRow) -> Self {
        let location = GeoResolution::from_parts(&row.domestic, &row.global, &row.source);
        Self {
            ip: row.ip,
            location,
            updated_at: row.updated_at,
        }
    }
}

/// A recorded remote lookup failure
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct GeoApiFailure {
    pub ip: String,
    pub provider: String,
    pub reason: String,
    pub detail: String,
    pub occurred_at: i64,
}
