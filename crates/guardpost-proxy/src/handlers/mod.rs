//! Request handlers, grouped by API surface.

pub mod admin;
pub mod native;
pub mod openai;

use std::time::Duration;

use guardpost_cache::ScanKind;
use guardpost_core::verdict::ScanVerdict;

use crate::server::ProxyState;

/// How long a request waits on the single-flight lock before scanning
/// anyway.
const DEDUP_WAIT: Duration = Duration::from_secs(10);

pub(crate) fn new_request_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

/// Input scan with verdict caching and single-flight deduplication.
///
/// Cache failures silently degrade to a direct scan; the lock is always
/// released after the computed verdict is stored.
pub(crate) async fn scan_input_cached(state: &ProxyState, prompt: &str) -> ScanVerdict {
    let Some(cache) = &state.cache else {
        return state.engine.scan_input(prompt).await;
    };

    if let Some(cached) = cache.deduplicate(ScanKind::Input, prompt, DEDUP_WAIT).await {
        tracing::debug!("input scan cache hit");
        return cached;
    }
    let verdict = state.engine.scan_input(prompt).await;
    cache.put(ScanKind::Input, prompt, &verdict).await;
    cache.release(ScanKind::Input, prompt).await;
    verdict
}

/// Output scan with verdict caching (non-streaming responses only).
pub(crate) async fn scan_output_cached(
    state: &ProxyState,
    prompt: &str,
    text: &str,
) -> ScanVerdict {
    let Some(cache) = &state.cache else {
        return state.engine.scan_output(prompt, text).await;
    };

    if let Some(cached) = cache.get(ScanKind::Output, text).await {
        tracing::debug!("output scan cache hit");
        return cached;
    }
    let verdict = state.engine.scan_output(prompt, text).await;
    cache.put(ScanKind::Output, text, &verdict).await;
    verdict
}
