//! Handlers for the OpenAI-compatible API surface.
//!
//! Requests are validated against the OpenAI schema, translated to the
//! native protocol, and responses translated back with synthesized ids.
//! The input scan covers the latest user turn (chat) or the full prompt
//! (completions).

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
use crate::dialect::{
    chat_completion_id, chat_completion_response, combine_messages_text, completion_id,
    native_chat_payload, native_generate_payload, prompt_from_completion_payload,
    text_completion_response, unix_now, usage_from_native, zero_usage,
};
use crate::error::{blocked_response, ApiError, BlockType};
use crate::handlers::new_request_id;
use crate::server::ProxyState;
use crate::streaming::{guard_openai_chat_stream, guard_openai_completion_stream, StreamContext};
use crate::upstream::safe_json;

const SSE: &str = "text/event-stream";
const EMBED_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

fn stream_context(state: &ProxyState, language: &str) -> StreamContext {
    StreamContext {
        engine: state.engine.clone(),
        output_guard: state.engine.output_enabled(),
        window: state.config.stream_scan_window,
        inline_guard: state.config.inline_guard_errors,
        language: language.to_string(),
    }
}

/// Inline-guard rendition of a violation in the chat-completions dialect.
fn inline_chat_guard_response(
    model: &str,
    markdown: &str,
    is_stream: bool,
    guard: Value,
) -> Response {
    let usage = guard
        .get("usage")
        .cloned()
        .unwrap_or_else(zero_usage);

    if is_stream {
        let id = chat_completion_id();
        let created = unix_now();
        let role = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}],
        });
        let content = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": {"content": markdown}, "finish_reason": "content_filter"}],
            "guard": guard,
        });
        let body = format!("data: {role}\n\ndata: {content}\n\ndata: [DONE]\n\n");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, SSE)],
            Body::from(body),
        )
            .into_response();
    }

    let response = chat_completion_response(
        model,
        markdown,
        Some("content_filter"),
        usage,
        Some(guard),
        None,
    );
    (StatusCode::OK, Json(response)).into_response()
}

/// Inline-guard rendition in the text-completions dialect.
fn inline_completion_guard_response(
    model: &str,
    markdown: &str,
    is_stream: bool,
    guard: Value,
) -> Response {
    let usage = guard
        .get("usage")
        .cloned()
        .unwrap_or_else(zero_usage);

    if is_stream {
        let chunk = json!({
            "id": completion_id(),
            "object": "text_completion",
            "created": unix_now(),
            "model": model,
            "choices": [{"index": 0, "text": markdown, "logprobs": null, "finish_reason": "content_filter"}],
            "guard": guard,
        });
        let body = format!("data: {chunk}\n\ndata: [DONE]\n\n");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, SSE)],
            Body::from(body),
        )
            .into_response();
    }

    let response = text_completion_response(
        model,
        markdown,
        Some("content_filter"),
        usage,
        Some(guard),
        None,
    );
    (StatusCode::OK, Json(response)).into_response()
}

enum OpenAiDialect {
    Chat,
    Completion,
}

fn render_block(
    state: &ProxyState,
    dialect: OpenAiDialect,
    block_type: BlockType,
    model: &str,
    language: &str,
    verdict: &ScanVerdict,
    is_stream: bool,
    usage: Option<Value>,
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
        let guard = json!({
            "failed_scanners": failed,
            "type": block_type.as_str(),
            "language": language,
            "usage": usage.unwrap_or_else(zero_usage),
        });
        return match dialect {
            OpenAiDialect::Chat => inline_chat_guard_response(model, &markdown, is_stream, guard),
            OpenAiDialect::Completion => {
                inline_completion_guard_response(model, &markdown, is_stream, guard)
            }
        };
    }

    let scan = matches!(block_type, BlockType::Output)
        .then(|| serde_json::to_value(verdict).unwrap_or_default());
    blocked_response(block_type, language, &message, &failed, scan.as_ref())
}

/// `POST /v1/chat/completions`.
pub async fn chat_completions_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "invalid chat completions JSON");
            return ApiError::invalid_json(err.to_string()).into_response();
        }
    };

    if !payload.is_object() {
        return ApiError::InvalidPayload {
            kind: "invalid_payload",
            message: "Expected JSON object.",
        }
        .into_response();
    }
    let messages = match payload.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => messages.clone(),
        _ => {
            return ApiError::InvalidPayload {
                kind: "invalid_messages",
                message: "messages must be a non-empty list.",
            }
            .into_response();
        }
    };
    let model = match payload.get("model").and_then(Value::as_str) {
        Some(model) if !model.trim().is_empty() => model.to_string(),
        _ => {
            return ApiError::InvalidPayload {
                kind: "invalid_model",
                message: "model is required.",
            }
            .into_response();
        }
    };

    let is_stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    // Only the latest user turn is scanned in this dialect.
    let prompt_text = combine_messages_text(&messages, Some(&["user"]), true);
    let language = detect_language(&prompt_text);
    let request_id = new_request_id("oai-chat");

    let processing = process_chat_completions(
        state.clone(),
        payload,
        model.clone(),
        prompt_text,
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

async fn process_chat_completions(
    state: ProxyState,
    payload: Value,
    model: String,
    prompt_text: String,
    language: String,
    is_stream: bool,
) -> Response {
    if state.engine.input_enabled() && !prompt_text.is_empty() {
        let verdict = state.engine.scan_input(&prompt_text).await;
        if !verdict.allowed {
            tracing::warn!(model = %model, "chat completions input blocked");
            return render_block(
                &state,
                OpenAiDialect::Chat,
                BlockType::Input,
                &model,
                &language,
                &verdict,
                is_stream,
                None,
            );
        }
    }

    let native = native_chat_payload(&payload, &model, is_stream);
    let timeout = state.config.openai_timeout();

    let send = if is_stream {
        state.upstream.post_stream("/api/chat", &native, timeout).await
    } else {
        state.upstream.post_json("/api/chat", &native, timeout).await
    };
    let upstream = match send {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "chat completions upstream error");
            return ApiError::Upstream {
                language,
                details: Some(err.to_string()),
            }
            .into_response();
        }
    };
    let status = upstream.status();
    if !status.is_success() {
        tracing::error!(status = %status, "chat completions upstream status");
        let body = safe_json(upstream)
            .await
            .unwrap_or_else(|err| json!({"error": err}));
        return ApiError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }
        .into_response();
    }

    if is_stream {
        let ctx = stream_context(&state, &language);
        let guarded = guard_openai_chat_stream(upstream.bytes_stream(), ctx, model);
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, SSE)],
            Body::from_stream(guarded),
        )
            .into_response();
    }

    let data = match safe_json(upstream).await {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse chat completions upstream response");
            return ApiError::InvalidUpstreamResponse { language }.into_response();
        }
    };

    let usage = usage_from_native(&data);
    let output_text = data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if state.engine.output_enabled() && !output_text.is_empty() {
        let verdict = state.engine.scan_output(&prompt_text, &output_text).await;
        if !verdict.allowed {
            tracing::warn!(model = %model, "chat completions output blocked");
            return render_block(
                &state,
                OpenAiDialect::Chat,
                BlockType::Output,
                &model,
                &language,
                &verdict,
                false,
                Some(usage),
            );
        }
    }

    let finish = if data.get("done").and_then(Value::as_bool).unwrap_or(true) {
        Some("stop")
    } else {
        None
    };
    let response = chat_completion_response(
        &model,
        &output_text,
        finish,
        usage,
        None,
        data.get("system_fingerprint"),
    );
    (StatusCode::OK, Json(response)).into_response()
}

/// `POST /v1/completions`.
pub async fn completions_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "invalid completions JSON");
            return ApiError::invalid_json(err.to_string()).into_response();
        }
    };

    if !payload.is_object() {
        return ApiError::InvalidPayload {
            kind: "invalid_payload",
            message: "Expected JSON object.",
        }
        .into_response();
    }
    let model = match payload.get("model").and_then(Value::as_str) {
        Some(model) if !model.trim().is_empty() => model.to_string(),
        _ => {
            return ApiError::InvalidPayload {
                kind: "invalid_model",
                message: "model is required.",
            }
            .into_response();
        }
    };
    let prompt_text = prompt_from_completion_payload(&payload);
    if prompt_text.is_empty() {
        return ApiError::InvalidPayload {
            kind: "invalid_prompt",
            message: "prompt must be provided.",
        }
        .into_response();
    }

    let language = detect_language(&prompt_text);
    let is_stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let request_id = new_request_id("oai-cmpl");

    let processing = process_completions(
        state.clone(),
        payload,
        model.clone(),
        prompt_text,
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

async fn process_completions(
    state: ProxyState,
    payload: Value,
    model: String,
    prompt_text: String,
    language: String,
    is_stream: bool,
) -> Response {
    if state.engine.input_enabled() {
        let verdict = state.engine.scan_input(&prompt_text).await;
        if !verdict.allowed {
            tracing::warn!(model = %model, "completions input blocked");
            return render_block(
                &state,
                OpenAiDialect::Completion,
                BlockType::Input,
                &model,
                &language,
                &verdict,
                is_stream,
                None,
            );
        }
    }

    let native = native_generate_payload(&payload, &model, &prompt_text, is_stream);
    let timeout = state.config.openai_timeout();

    let send = if is_stream {
        state
            .upstream
            .post_stream("/api/generate", &native, timeout)
            .await
    } else {
        state
            .upstream
            .post_json("/api/generate", &native, timeout)
            .await
    };
    let upstream = match send {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "completions upstream error");
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
            .unwrap_or_else(|err| json!({"error": err}));
        return ApiError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }
        .into_response();
    }

    if is_stream {
        let ctx = stream_context(&state, &language);
        let guarded = guard_openai_completion_stream(upstream.bytes_stream(), ctx, model);
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, SSE)],
            Body::from_stream(guarded),
        )
            .into_response();
    }

    let data = match safe_json(upstream).await {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse completions upstream response");
            return ApiError::InvalidUpstreamResponse { language }.into_response();
        }
    };

    let usage = usage_from_native(&data);
    let output_text = crate::dialect::extract_response_text(&data);

    if state.engine.output_enabled() && !output_text.is_empty() {
        let verdict = state.engine.scan_output(&prompt_text, &output_text).await;
        if !verdict.allowed {
            tracing::warn!(model = %model, "completions output blocked");
            return render_block(
                &state,
                OpenAiDialect::Completion,
                BlockType::Output,
                &model,
                &language,
                &verdict,
                false,
                Some(usage),
            );
        }
    }

    let finish = if data.get("done").and_then(Value::as_bool).unwrap_or(true) {
        Some("stop")
    } else {
        None
    };
    let response = text_completion_response(
        &model,
        &output_text,
        finish,
        usage,
        None,
        data.get("system_fingerprint"),
    );
    (StatusCode::OK, Json(response)).into_response()
}

/// `POST /v1/embeddings` — forwarded verbatim.
pub async fn embeddings_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return ApiError::invalid_json(err.to_string()).into_response(),
    };
    forward_openai_passthrough(&state, "/v1/embeddings", &payload).await
}

/// `POST /v1/models` — forwarded verbatim.
pub async fn models_handler(State(state): State<ProxyState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return ApiError::invalid_json(err.to_string()).into_response(),
    };
    forward_openai_passthrough(&state, "/v1/models", &payload).await
}

async fn forward_openai_passthrough(state: &ProxyState, path: &str, payload: &Value) -> Response {
    let upstream = match state.upstream.post_json(path, payload, EMBED_TIMEOUT).await {
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
