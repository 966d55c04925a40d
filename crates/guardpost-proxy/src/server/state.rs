//! Shared server state, built once at startup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use guardpost_cache::VerdictCache;
use guardpost_core::config::ProxyConfig;
use guardpost_scanners::GuardEngine;

use crate::concurrency::AdmissionController;
use crate::upstream::UpstreamClient;

/// Process-wide collaborators handed to every handler.
///
/// Cloning is cheap: everything is behind an `Arc` (the engine internally).
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub engine: GuardEngine,
    pub admission: Arc<AdmissionController>,
    pub cache: Option<Arc<VerdictCache>>,
    pub upstream: Arc<UpstreamClient>,
    pub started_at: DateTime<Utc>,
}

impl ProxyState {
    pub async fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let engine = GuardEngine::from_config(&config);
        let admission = Arc::new(AdmissionController::from_config(&config));
        let cache = VerdictCache::from_config(&config).await.map(Arc::new);
        let upstream = Arc::new(UpstreamClient::from_config(&config)?);

        Ok(Self {
            config: Arc::new(config),
            engine,
            admission,
            cache,
            upstream,
            started_at: Utc::now(),
        })
    }
}
