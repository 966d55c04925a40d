//! Diagnostic and administrative endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::ProxyState;

/// `GET /health`.
pub async fn health_handler(State(state): State<ProxyState>) -> Json<Value> {
    let cache_healthy = match &state.cache {
        Some(cache) => cache.healthy().await,
        None => true,
    };
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "guards": {
            "input_guard": enabled_str(state.engine.input_enabled()),
            "output_guard": enabled_str(state.engine.output_enabled()),
        },
        "cache": {
            "enabled": state.cache.is_some(),
            "healthy": cache_healthy,
        },
    }))
}

fn enabled_str(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

/// `GET /config` — non-sensitive configuration echo.
pub async fn config_handler(State(state): State<ProxyState>) -> Json<Value> {
    let mut view = state.config.public_view();
    view["input_scanners"] = json!(state.engine.input_scanner_names());
    view["output_scanners"] = json!(state.engine.output_scanner_names());
    Json(view)
}

/// `GET /stats` — admission, cache, and guard statistics.
pub async fn stats_handler(State(state): State<ProxyState>) -> Json<Value> {
    let cache_stats = match &state.cache {
        Some(cache) => cache.stats().await,
        None => json!({"enabled": false}),
    };
    Json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": (chrono::Utc::now() - state.started_at).num_seconds(),
        "guards": {
            "input_enabled": state.engine.input_enabled(),
            "output_enabled": state.engine.output_enabled(),
        },
        "concurrency": state.admission.snapshot(),
        "cache": cache_stats,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LimitUpdate {
    pub parallel_limit: Option<usize>,
    pub queue_limit: Option<usize>,
}

/// `POST /admin/limits/:model` — live queue reconfiguration.
///
/// Counters reset; in-flight requests finish on the old limits.
pub async fn update_limits_handler(
    State(state): State<ProxyState>,
    Path(model): Path<String>,
    Json(update): Json<LimitUpdate>,
) -> Response {
    match state
        .admission
        .update_limits(&model, update.parallel_limit, update.queue_limit)
    {
        Some(result) => (StatusCode::OK, Json(result)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "model_not_found",
                "model": model,
                "status": "not_found",
            })),
        )
            .into_response(),
    }
}

/// `POST /admin/stats/reset` — reset admission counters, optionally for one
/// model.
pub async fn reset_stats_handler(State(state): State<ProxyState>, body: Bytes) -> Json<Value> {
    let model = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(Value::as_str).map(String::from));
    state.admission.reset_stats(model.as_deref());
    Json(json!({
        "status": "reset",
        "model": model,
    }))
}
