//! Handlers for the native backend API surface.
//!
//! `/api/generate` and `/api/chat` run the full scan → admit → forward →
//! scan pipeline; the remaining endpoints forward verbatim with no
//! scanning.

use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use guardpost_core::language::{detect_language, localized_message, MessageKey};
use guardpost_core::verdict::{format_markdown_error, ScanVerdict};
use serde_json::{json, Value};

use crate::concurrency::AdmissionError;
use crate::dialect::{combine_messages_text, extract_model, extract_prompt, extract_response_text};
use crate::error::{blocked_response, ApiError, BlockType};
use crate::handlers::{new_request_id, scan_input_cached, scan_output_cached};
use crate::server::ProxyState;
use crate::streaming::{guard_native_stream, StreamContext};
use crate::upstream::safe_json;

const NDJSON: &str = "application/x-ndjson";

/// Passthrough timeout for light model-management calls.
const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(10);
/// Passthrough timeout for embedding calls.
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);
/// Passthrough timeout for model transfer operations (pull/push/create).
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);

fn stream_context(state: &ProxyState, language: &str) -> StreamContext {
    StreamContext {
        engine: state.engine.clone(),
        output_guard: state.engine.output_enabled(),
        window: state.config.stream_scan_window,
        inline_guard: state.config.inline_guard_errors,
        language: language.to_string(),
    }
}

/// Inline-guard rendition of a violation for the generate dialect: a
/// successful response whose `response` field carries the explanation.
fn inline_generate_response(
    model: &str,
    markdown: &str,
    error_message: &str,
    is_stream: bool,
    guard: Value,
) -> Response {
    let payload = json!({
        "model": model,
        "response": markdown,
        "done": true,
        "error": {
            "message": error_message,
            "type": guard.get("type").cloned().unwrap_or(Value::Null),
            "language": guard.get("language").cloned().unwrap_or(Value::Null),
        },
        "guard": guard,
    });
    if is_stream {
        let line = Bytes::from(format!("{payload}\n"));
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, NDJSON)],
            Body::from(line),
        )
            .into_response()
    } else {
        (StatusCode::OK, Json(payload)).into_response()
    }
}

/// Inline-guard rendition for the chat dialect (`message.content`).
fn inline_chat_response(
    model: &str,
    markdown: &str,
    error_message: &str,
    is_stream: bool,
    guard: Value,
) -> Response {
    let payload = json!({
        "model": model,
        "message": {"role": "assistant", "content": markdown},
        "done": true,
        "error": {
            "message": error_message,
            "type": guard.get("type").cloned().unwrap_or(Value::Null),
            "language": guard.get("language").cloned().unwrap_or(Value::Null),
        },
        "guard": guard,
    });
    if is_stream {
        let line = Bytes::from(format!("{payload}\n"));
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, NDJSON)],
            Body::from(line),
        )
            .into_response()
    } else {
        (StatusCode::OK, Json(payload)).into_response()
    }
}

enum NativeDialect {
    Generate,
    Chat,
}

/// Render a blocked verdict per configuration: inline success body or 451.
fn render_block(
    state: &ProxyState,
    dialect: NativeDialect,
    block_type: BlockType,
    model: &str,
    language: &str,
    verdict: &ScanVerdict,
    is_stream: bool,
) -> Response {
    let failed = verdict.failed_scanners();
    let message = match block_type {
        BlockType::Input => localized_message(
            MessageKey::PromptBlocked,
            language,
            verdict.failure_reason().as_deref(),
        ),
        BlockType::Output => localized_message(MessageKey::ResponseBlocked, language, None),
    };

    if state.config.inline_guard_errors {
        let title = match block_type {
            BlockType::Input => "Input blocked",
            BlockType::Output => "Response blocked",
        };
        let markdown = format_markdown_error(title, &message, &failed);
        let mut guard = json!({
            "failed_scanners": failed,
            "type": block_type.as_str(),
            "language": language,
        });
        if matches!(block_type, BlockType::Output) {
            guard["scan"] = serde_json::to_value(verdict).unwrap_or_default();
        }
        return match dialect {
            NativeDialect::Generate => {
                inline_generate_response(model, &markdown, &message, is_stream, guard)
            }
            NativeDialect::Chat => {
                inline_chat_response(model, &markdown, &message, is_stream, guard)
            }
        };
    }

    let scan = matches!(block_type, BlockType::Output)
        .then(|| serde_json::to_value(verdict).unwrap_or_default());
    blocked_response(block_type, language, &message, &failed, scan.as_ref())
}

/// `POST /api/generate` — native completion with input/output scanning and
/// streaming support.
pub async fn generate_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse request JSON");
            return ApiError::invalid_json(err.to_string()).into_response();
        }
    };

    let model = extract_model(&payload);
    let prompt = extract_prompt(&payload);
    let language = detect_language(&prompt);
    let is_stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let request_id = new_request_id("gen");

    let processing = process_generate(
        state.clone(),
        payload,
        model.clone(),
        prompt,
        language.clone(),
        is_stream,
    );
    match state
        .admission
        .execute(&model, &request_id, Some(state.config.request_timeout()), processing)
        .await
    {
        Ok(response) => response,
        Err(AdmissionError::QueueFull { .. }) => {
            ApiError::QueueFull { model, language }.into_response()
        }
        Err(AdmissionError::Timeout { .. }) => {
            ApiError::Timeout { model, language }.into_response()
        }
    }
}

async fn process_generate(
    state: ProxyState,
    payload: Value,
    model: String,
    prompt: String,
    language: String,
    is_stream: bool,
) -> Response {
    if state.engine.input_enabled() && !prompt.is_empty() {
        let verdict = scan_input_cached(&state, &prompt).await;
        if !verdict.allowed {
            tracing::warn!(model = %model, "input blocked by guard");
            return render_block(
                &state,
                NativeDialect::Generate,
                BlockType::Input,
                &model,
                &language,
                &verdict,
                is_stream,
            );
        }
    }

    let path = state.config.ollama_path.clone();
    let timeout = state.config.request_timeout();

    if is_stream {
        let upstream = match state.upstream.post_stream(&path, &payload, timeout).await {
            Ok(response) => response,
            Err(err) => {
                return ApiError::Upstream {
                    language,
                    details: Some(err.to_string()),
                }
                .into_response();
            }
        };
        let status = upstream.status();
        if !status.is_success() {
            tracing::error!(status = %status, "upstream returned error status");
            let body = safe_json(upstream)
                .await
                .unwrap_or_else(|_| json!({"error": "upstream_error"}));
            return ApiError::UpstreamStatus {
                status: status.as_u16(),
                body,
            }
            .into_response();
        }
        let ctx = stream_context(&state, &language);
        let guarded = guard_native_stream(upstream.bytes_stream(), ctx);
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, NDJSON)],
            Body::from_stream(guarded),
        )
            .into_response();
    }

    let upstream = match state.upstream.post_json(&path, &payload, timeout).await {
        Ok(response) => response,
        Err(err) => {
            return ApiError::Upstream {
                language,
                details: Some(err.to_string()),
            }
            .into_response();
        }
    };
    let status = upstream.status();
    if !status.is_success() {
        let body = safe_json(upstream)
            .await
            .unwrap_or_else(|_| json!({"error": "upstream_error"}));
        return ApiError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }
        .into_response();
    }

    let data = match safe_json(upstream).await {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse upstream response");
            return ApiError::InvalidUpstreamResponse { language }.into_response();
        }
    };

    if state.engine.output_enabled() {
        let output_text = extract_response_text(&data);
        if !output_text.is_empty() {
            let verdict = scan_output_cached(&state, &prompt, &output_text).await;
            if !verdict.allowed {
                tracing::warn!(model = %model, "output blocked by guard");
                return render_block(
                    &state,
                    NativeDialect::Generate,
                    BlockType::Output,
                    &model,
                    &language,
                    &verdict,
                    false,
                );
            }
        }
    }

    (StatusCode::OK, Json(data)).into_response()
}

/// `POST /api/chat` — native chat with input/output scanning and streaming
/// support.
pub async fn chat_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return ApiError::invalid_json(err.to_string()).into_response(),
    };

    let model = extract_model(&payload);
    // The chat dialect scans the whole conversation.
    let prompt = payload
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| combine_messages_text(messages, None, false))
        .unwrap_or_default();
    let language = detect_language(&prompt);
    let is_stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let request_id = new_request_id("chat");

    let processing = process_chat(
        state.clone(),
        payload,
        model.clone(),
        prompt,
        language.clone(),
        is_stream,
    );
    match state
        .admission
        .execute(&model, &request_id, Some(state.config.request_timeout()), processing)
        .await
    {
        Ok(response) => response,
        Err(AdmissionError::QueueFull { .. }) => {
            ApiError::QueueFull { model, language }.into_response()
        }
        Err(AdmissionError::Timeout { .. }) => {
            ApiError::Timeout { model, language }.into_response()
        }
    }
}

async fn process_chat(
    state: ProxyState,
    payload: Value,
    model: String,
    prompt: String,
    language: String,
    is_stream: bool,
) -> Response {
    if state.engine.input_enabled() && !prompt.is_empty() {
        let verdict = scan_input_cached(&state, &prompt).await;
        if !verdict.allowed {
            tracing::warn!(model = %model, "chat input blocked by guard");
            return render_block(
                &state,
                NativeDialect::Chat,
                BlockType::Input,
                &model,
                &language,
                &verdict,
                is_stream,
            );
        }
    }

    let timeout = state.config.request_timeout();

    if is_stream {
        let upstream = match state.upstream.post_stream("/api/chat", &payload, timeout).await {
            Ok(response) => response,
            Err(err) => {
                return ApiError::Upstream {
                    language,
                    details: Some(err.to_string()),
                }
                .into_response();
            }
        };
        let status = upstream.status();
        if !status.is_success() {
            let body = safe_json(upstream)
                .await
                .unwrap_or_else(|_| json!({"error": "upstream_error"}));
            return ApiError::UpstreamStatus {
                status: status.as_u16(),
                body,
            }
            .into_response();
        }
        let ctx = stream_context(&state, &language);
        let guarded = guard_native_stream(upstream.bytes_stream(), ctx);
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, NDJSON)],
            Body::from_stream(guarded),
        )
            .into_response();
    }

    let upstream = match state.upstream.post_json("/api/chat", &payload, timeout).await {
        Ok(response) => response,
        Err(err) => {
            return ApiError::Upstream {
                language,
                details: Some(err.to_string()),
            }
            .into_response();
        }
    };
    let status = upstream.status();
    if !status.is_success() {
        let body = safe_json(upstream)
            .await
            .unwrap_or_else(|_| json!({"error": "upstream_error"}));
        return ApiError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }
        .into_response();
    }

    let data = match safe_json(upstream).await {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse chat upstream response");
            return ApiError::InvalidUpstreamResponse { language }.into_response();
        }
    };

    if state.engine.output_enabled() {
        let output_text = data
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if !output_text.is_empty() {
            let verdict = scan_output_cached(&state, &prompt, &output_text).await;
            if !verdict.allowed {
                tracing::warn!(model = %model, "chat output blocked by guard");
                return render_block(
                    &state,
                    NativeDialect::Chat,
                    BlockType::Output,
                    &model,
                    &language,
                    &verdict,
                    false,
                );
            }
        }
    }

    (StatusCode::OK, Json(data)).into_response()
}

// ---------------------------------------------------------------------------
// Verbatim passthrough endpoints (no scanning).

async fn forward_json(state: &ProxyState, path: &str, payload: Option<&Value>, timeout: Duration) -> Response {
    let result = match payload {
        Some(payload) => state.upstream.post_json(path, payload, timeout).await,
        None => state.upstream.get(path, timeout).await,
    };
    let upstream = match result {
        Ok(response) => response,
        Err(err) => {
            return ApiError::Upstream {
                language: "en".to_string(),
                details: Some(err.to_string()),
            }
            .into_response();
        }
    };
    let status = upstream.status();
    if !status.is_success() {
        let body = safe_json(upstream)
            .await
            .unwrap_or_else(|_| json!({"error": "upstream_error"}));
        return ApiError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }
        .into_response();
    }
    match safe_json(upstream).await {
        Ok(data) => (StatusCode::OK, Json(data)).into_response(),
        Err(err) => {
            tracing::error!(error = %err, path, "invalid upstream response");
            ApiError::InvalidUpstreamResponse {
                language: "en".to_string(),
            }
            .into_response()
        }
    }
}

/// Forward a management call whose success response may have no body.
async fn forward_ack(state: &ProxyState, path: &str, payload: &Value, timeout: Duration) -> Response {
    let upstream = match state.upstream.post_json(path, payload, timeout).await {
        Ok(response) => response,
        Err(err) => {
            return ApiError::Upstream {
                language: "en".to_string(),
                details: Some(err.to_string()),
            }
            .into_response();
        }
    };
    let status = upstream.status();
    if !status.is_success() {
        let body = safe_json(upstream)
            .await
            .unwrap_or_else(|_| json!({"error": "upstream_error"}));
        return ApiError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }
        .into_response();
    }
    (StatusCode::OK, Json(json!({}))).into_response()
}

/// Forward a long-running transfer endpoint, streaming bytes verbatim.
async fn forward_stream(state: &ProxyState, path: &str, payload: &Value) -> Response {
    let upstream = match state
        .upstream
        .post_stream(path, payload, TRANSFER_TIMEOUT)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            return ApiError::Upstream {
                language: "en".to_string(),
                details: Some(err.to_string()),
            }
            .into_response();
        }
    };
    let status = upstream.status();
    if !status.is_success() {
        let body = safe_json(upstream)
            .await
            .unwrap_or_else(|_| json!({"error": "upstream_error"}));
        return ApiError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }
        .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, NDJSON)],
        Body::from_stream(upstream.bytes_stream()),
    )
        .into_response()
}

fn parse_payload(body: &Bytes) -> Result<Value, Response> {
    serde_json::from_slice(body).map_err(|err| ApiError::invalid_json(err.to_string()).into_response())
}

/// `GET /api/tags` — list models.
pub async fn tags_handler(State(state): State<ProxyState>) -> Response {
    forward_json(&state, "/api/tags", None, MANAGEMENT_TIMEOUT).await
}

/// `POST /api/show` — model details.
pub async fn show_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => forward_json(&state, "/api/show", Some(&payload), MANAGEMENT_TIMEOUT).await,
        Err(response) => response,
    }
}

/// `POST|DELETE /api/delete` — delete a model.
pub async fn delete_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => forward_ack(&state, "/api/delete", &payload, MANAGEMENT_TIMEOUT).await,
        Err(response) => response,
    }
}

/// `POST /api/copy` — copy a model.
pub async fn copy_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => forward_ack(&state, "/api/copy", &payload, MANAGEMENT_TIMEOUT).await,
        Err(response) => response,
    }
}

/// `POST /api/embed` — embeddings.
pub async fn embed_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => forward_json(&state, "/api/embed", Some(&payload), EMBED_TIMEOUT).await,
        Err(response) => response,
    }
}

/// `POST /api/pull` — pull a model (streamed progress).
pub async fn pull_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => forward_stream(&state, "/api/pull", &payload).await,
        Err(response) => response,
    }
}

/// `POST /api/push` — push a model (streamed progress).
pub async fn push_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => forward_stream(&state, "/api/push", &payload).await,
        Err(response) => response,
    }
}

/// `POST /api/create` — create a model (streamed progress).
pub async fn create_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => forward_stream(&state, "/api/create", &payload).await,
        Err(response) => response,
    }
}

/// `GET /api/ps` — running models.
pub async fn ps_handler(State(state): State<ProxyState>) -> Response {
    forward_json(&state, "/api/ps", None, MANAGEMENT_TIMEOUT).await
}

/// `GET /api/version` — backend version.
pub async fn version_handler(State(state): State<ProxyState>) -> Response {
    forward_json(&state, "/api/version", None, MANAGEMENT_TIMEOUT).await
}
