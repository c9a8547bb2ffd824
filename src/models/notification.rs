use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
        }
    }
}

/// Operator-facing notification, deduplicated by fingerprint
#[derive(Debug, Clone, Serialize)]
pub struct SystemNotification {
    pub level: NotificationLevel,
    pub category: String,
    pub title: String,
    pub message: String,
    pub fingerprint: String,
    pub metadata: serde_json::Value,
}

/// Notification row as persisted, with its accumulated occurrence count
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredNotification {
    pub id: i64,
    pub level: String,
    pub category: String,
    pub title: String,
    pub message: String,
    pub fingerprint: String,
    pub metadata: String,
    pub occurrences: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoredNotification {
    pub fn metadata_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata).unwrap_or(serde_json::Value::Null)
    }
}
