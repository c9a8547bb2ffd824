//! ip-api.com batch provider

use crate::geo::provider::{BatchLookup, GeoProvider, ProviderError};
use crate::models::GeoLocation;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// The batch endpoint accepts at most 100 queries per request
const MAX_BATCH: usize = 100;

const FIELDS: &str = "status,message,country,regionName,city,query";

pub struct IpApiProvider {
    client: reqwest::Client,
    endpoint: String,
    lang: String,
}

#[derive(Debug, Serialize)]
struct BatchQuery<'a> {
    query: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiRecord {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    region_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

impl IpApiProvider {
    pub fn new(endpoint: &str, lang: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            lang: lang.to_string(),
        })
    }

    async fn lookup_chunk(&self, chunk: &[String]) -> Result<Vec<IpApiRecord>, ProviderError> {
        let url = format!("{}?fields={}&lang={}", self.endpoint, FIELDS, self.lang);
        let body: Vec<BatchQuery<'_>> = chunk.iter().map(|ip| BatchQuery { query: ip }).collect();

        let response = self.client.post(&url).json(&body).send().await?;
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(ProviderError::RateLimited),
            status if !status.is_success() => return Err(ProviderError::Status(status.as_u16())),
            _ => {}
        }

        Ok(response.json::<Vec<IpApiRecord>>().await?)
    }
}

/// Location for a successful record; `None` when the record carries no usable data
fn record_location(record: &IpApiRecord, source: &str) -> Option<GeoLocation> {
    if record.status != "success" {
        return None;
    }

    let global = record.country.as_deref().map(str::trim).unwrap_or_default();
    if global.is_empty() {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in [record.region_name.as_deref(), record.city.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
    {
        if !part.is_empty() && !parts.contains(&part) {
            parts.push(part);
        }
    }
    let domestic = if parts.is_empty() {
        global.to_string()
    } else {
        parts.join("·")
    };

    Some(GeoLocation {
        domestic,
        global: global.to_string(),
        source: source.to_string(),
    })
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    fn name(&self) -> &str {
        "ip-api"
    }

    async fn lookup_batch(&self, ips: &[String]) -> BatchLookup {
        let mut lookup = BatchLookup::default();

        for chunk in ips.chunks(MAX_BATCH) {
            let records = match self.lookup_chunk(chunk).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        "ip-api batch lookup failed after {} results: {}",
                        lookup.resolved.len(),
                        e
                    );
                    lookup.error = Some(e);
                    break;
                }
            };

            for (ip, record) in chunk.iter().zip(records.iter()) {
                let ip = record.query.clone().unwrap_or_else(|| ip.clone());
                match record_location(record, self.name()) {
                    Some(location) => {
                        lookup.resolved.insert(ip, location);
                    }
                    None => {
                        debug!(
                            "ip-api returned no data for {}: {}",
                            ip,
                            record.message.as_deref().unwrap_or("no message")
                        );
                    }
                }
            }
        }

        lookup
    }
}
