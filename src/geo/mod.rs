//! IP geolocation resolution
//!
//! Pending IPs are resolved in batches by [`GeoResolver`] against a [`GeoProvider`],
//! normalized, cached and backfilled into access logs.

pub mod ip_api;
pub mod maxmind;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod run_flag;

pub use ip_api::IpApiProvider;
pub use maxmind::MaxMindProvider;
pub use normalize::{is_china_global, location_match_key, normalize_location};
pub use pipeline::{
    load_progress, GeoResolver, LogLocation, ResolverSettings, PROGRESS_STATE_KEY,
};
pub use progress::{ProgressSnapshot, ResolveProgress};
pub use provider::{BatchLookup, GeoProvider, ProviderError, REQUEST_ERROR_REASON};
pub use run_flag::{RunFlag, RunGuard};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{ProviderConfig, ProviderKind};

/// Build the configured geolocation provider
pub fn provider_from_config(config: &ProviderConfig) -> anyhow::Result<Arc<dyn GeoProvider>> {
    match config.kind {
        ProviderKind::IpApi => {
            let provider = IpApiProvider::new(
                &config.endpoint,
                &config.lang,
                Duration::from_secs(config.timeout_secs.max(1)),
            )
            .context("Failed to build ip-api client")?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Maxmind => {
            let path = config
                .city_db_path
                .as_deref()
                .context("provider.city_db_path is required for the maxmind provider")?;
            Ok(Arc::new(MaxMindProvider::new(path)?))
        }
    }
}
