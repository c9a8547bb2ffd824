use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single access-log record as stored after ingestion
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccessLogRecord {
    pub id: i64,
    pub website_id: String,
    pub ip: String,
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub status: i64,
    pub domestic_location: String,
    pub global_location: String,
}

/// Request for inserting a new access-log record
#[derive(Debug, Clone, Deserialize)]
pub struct NewAccessLog {
    pub website_id: String,
    pub ip: String,
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub status: i64,
    pub domestic_location: String,
    pub global_location: String,
}
