//! Application router configuration.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, native, openai};
use crate::server::ProxyState;

/// Assemble the full route table with CORS, tracing, and trusted-host
/// enforcement.
pub fn build(state: ProxyState) -> Router {
    let cors = cors_layer(&state);

    Router::new()
        // Native inference endpoints (scanned)
        .route("/api/generate", post(native::generate_handler))
        .route("/api/chat", post(native::chat_handler))
        // Native management passthroughs
        .route("/api/tags", get(native::tags_handler))
        .route("/api/show", post(native::show_handler))
        .route(
            "/api/delete",
            post(native::delete_handler).delete(native::delete_handler),
        )
        .route("/api/copy", post(native::copy_handler))
        .route("/api/embed", post(native::embed_handler))
        .route("/api/pull", post(native::pull_handler))
        .route("/api/push", post(native::push_handler))
        .route("/api/create", post(native::create_handler))
        .route("/api/ps", get(native::ps_handler))
        .route("/api/version", get(native::version_handler))
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(openai::chat_completions_handler))
        .route("/v1/completions", post(openai::completions_handler))
        .route("/v1/embeddings", post(openai::embeddings_handler))
        .route("/v1/models", post(openai::models_handler))
        // Diagnostics and administration
        .route("/health", get(admin::health_handler))
        .route("/config", get(admin::config_handler))
        .route("/stats", get(admin::stats_handler))
        .route("/admin/limits/:model", post(admin::update_limits_handler))
        .route("/admin/stats/reset", post(admin::reset_stats_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            trusted_host_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(state: &ProxyState) -> CorsLayer {
    let config = &state.config;
    let wildcard_origin = config.cors_allow_origins.iter().any(|o| o == "*");

    let origins = if wildcard_origin {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .cors_allow_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
        )
    };
    let methods = if config.cors_allow_methods.iter().any(|m| m == "*") {
        AllowMethods::any()
    } else {
        AllowMethods::list(
            config
                .cors_allow_methods
                .iter()
                .filter_map(|method| method.parse::<Method>().ok()),
        )
    };
    let headers = if config.cors_allow_headers.iter().any(|h| h == "*") {
        AllowHeaders::any()
    } else {
        AllowHeaders::list(
            config
                .cors_allow_headers
                .iter()
                .filter_map(|name| name.parse::<header::HeaderName>().ok()),
        )
    };

    let mut layer = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .max_age(Duration::from_secs(state.config.cors_max_age));

    // Wildcard origins and credentials are mutually exclusive.
    if config.cors_allow_credentials && !wildcard_origin {
        layer = layer.allow_credentials(true);
    }
    layer
}

/// Reject requests whose Host header is not in the trusted set.
///
/// An empty list or `*` trusts everything.
async fn trusted_host_middleware(
    State(state): State<ProxyState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.is_empty() || trusted.iter().any(|h| h == "*") {
        return next.run(request).await;
    }

    let host_header = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let host_only = host_header.split(':').next().unwrap_or("");

    if trusted.iter().any(|h| h == host_header || h == host_only) {
        next.run(request).await
    } else {
        tracing::warn!(host = host_header, "rejecting untrusted host");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_host"})),
        )
            .into_response()
    }
}
