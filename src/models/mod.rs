pub mod access_log;
pub mod geo;
pub mod notification;

pub use access_log::{AccessLogRecord, NewAccessLog};
pub use geo::{
    GeoApiFailure, GeoCacheEntry, GeoCacheRow, GeoLocation, GeoResolution,
    PENDING_LOCATION_LABEL, UNKNOWN_LOCATION, UNKNOWN_SOURCE,
};
pub use notification::{NotificationLevel, StoredNotification, SystemNotification};
