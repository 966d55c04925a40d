//! Streaming guard: window-buffered output scanning over live token streams.
//!
//! Three generators cover the wire dialects: native NDJSON (shared by
//! `/api/generate` and `/api/chat`) and the two OpenAI SSE framings. Each
//! generator owns the upstream byte stream, so every exit path — block,
//! drain, transport error, or caller cancellation — drops it exactly once,
//! which aborts generation on the backend.
//!
//! Memory is bounded per request: the unscanned suffix never exceeds the
//! configured window before being scanned and reset.

use std::convert::Infallible;
use std::fmt::Display;

use async_stream::stream;
use bytes::Bytes;
use futures::{pin_mut, Stream, StreamExt};
use guardpost_core::language::{localized_message, MessageKey};
use guardpost_core::verdict::{format_markdown_error, ScanVerdict};
use guardpost_scanners::GuardEngine;
use serde_json::{json, Value};

use crate::dialect::{chat_completion_id, completion_id, unix_now, usage_from_native};

/// Shared knobs for one guarded stream.
#[derive(Clone)]
pub struct StreamContext {
    pub engine: GuardEngine,
    pub output_guard: bool,
    /// Characters accumulated between scans.
    pub window: usize,
    pub inline_guard: bool,
    pub language: String,
}

/// Splits an arbitrary byte-chunk stream into trimmed lines.
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1])
                    .trim()
                    .to_string(),
            );
        }
        lines
    }

    fn remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

fn verdict_json(verdict: &ScanVerdict) -> Value {
    serde_json::to_value(verdict).unwrap_or_else(|_| json!({}))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Final NDJSON frame announcing a blocked stream in the native dialect.
fn native_block_frame(ctx: &StreamContext, model: Option<&str>, verdict: &ScanVerdict) -> Bytes {
    let failed = verdict.failed_scanners();
    let message = localized_message(MessageKey::ResponseBlocked, &ctx.language, None);
    let mut content = if ctx.inline_guard {
        format_markdown_error("Response blocked", &message, &failed)
    } else {
        message.clone()
    };
    if !content.ends_with('\n') {
        content.push('\n');
    }

    let frame = json!({
        "model": model,
        "created_at": now_rfc3339(),
        "message": {"role": "assistant", "content": content},
        "done": true,
        "done_reason": "guard_blocked",
        "guard": {
            "failed_scanners": failed,
            "type": "output_blocked",
            "language": ctx.language,
            "scan": verdict_json(verdict),
            "message": message,
        },
        "error": {
            "type": "content_policy_violation",
            "message": message,
            "language": ctx.language,
            "failed_scanners": verdict.failed_scanners(),
        },
    });
    Bytes::from(format!("{frame}\n"))
}

/// Final NDJSON frame for an internal error mid-stream.
fn native_error_frame(ctx: &StreamContext, model: Option<&str>) -> Bytes {
    let message = localized_message(MessageKey::ServerError, &ctx.language, None);
    let frame = json!({
        "model": model,
        "created_at": now_rfc3339(),
        "message": {"role": "assistant", "content": message},
        "done": true,
        "done_reason": "guard_blocked",
        "guard": {
            "failed_scanners": [],
            "type": "server_error",
            "language": ctx.language,
            "message": message,
        },
        "error": {
            "type": "server_error",
            "message": message,
            "language": ctx.language,
            "failed_scanners": [],
        },
    });
    Bytes::from(format!("{frame}\n"))
}

/// Guard a native NDJSON stream.
///
/// Frames are forwarded verbatim; incremental text is buffered and scanned
/// once the window threshold is crossed. Non-JSON lines pass through
/// unchanged. A failed scan emits the blocked final frame and ends the
/// stream before any further upstream token is read.
pub fn guard_native_stream<S, E>(
    upstream: S,
    ctx: StreamContext,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    stream! {
        pin_mut!(upstream);
        let mut lines = LineBuffer::new();
        let mut accumulated = String::new();
        let mut last_model: Option<String> = None;

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::error!(error = %err, "upstream transport error mid-stream");
                    yield Ok(native_error_frame(&ctx, last_model.as_deref()));
                    return;
                }
            };
            for line in lines.push(&chunk) {
                if line.is_empty() {
                    continue;
                }
                let data: Value = match serde_json::from_str(&line) {
                    Ok(data @ Value::Object(_)) => data,
                    _ => {
                        tracing::debug!("forwarding unparseable stream line unchanged");
                        yield Ok(Bytes::from(format!("{line}\n")));
                        continue;
                    }
                };

                if let Some(model) = data.get("model").and_then(Value::as_str) {
                    last_model = Some(model.to_string());
                }

                if let Some(text) = data.get("response").and_then(Value::as_str) {
                    accumulated.push_str(text);
                } else if let Some(content) = data
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                {
                    accumulated.push_str(content);
                }

                if ctx.output_guard && accumulated.len() > ctx.window {
                    let verdict = ctx.engine.scan_output("", &accumulated).await;
                    if !verdict.allowed {
                        tracing::warn!(
                            failed = ?verdict.failed_scanners(),
                            "streaming output blocked"
                        );
                        yield Ok(native_block_frame(&ctx, last_model.as_deref(), &verdict));
                        tracing::info!("upstream closed after blocking streaming output");
                        return;
                    }
                    // Cleared text is never re-scanned.
                    accumulated.clear();
                }

                yield Ok(Bytes::from(format!("{line}\n")));
            }
        }

        if let Some(line) = lines.remainder() {
            yield Ok(Bytes::from(format!("{line}\n")));
        }

        if ctx.output_guard && !accumulated.is_empty() {
            let verdict = ctx.engine.scan_output("", &accumulated).await;
            if !verdict.allowed {
                tracing::warn!("final streaming window blocked");
                yield Ok(native_block_frame(&ctx, last_model.as_deref(), &verdict));
            }
        }
    }
}

fn sse(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

fn chat_chunk(id: &str, created: i64, model: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [
            {"index": 0, "delta": delta, "finish_reason": finish}
        ],
    })
}

fn completion_chunk(id: &str, created: i64, model: &str, text: &str, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "text_completion",
        "created": created,
        "model": model,
        "choices": [
            {"index": 0, "text": text, "logprobs": null, "finish_reason": finish}
        ],
    })
}

/// Guard an OpenAI chat-completions SSE stream fed by native chat frames.
///
/// Emits the role delta once before any content, content deltas per frame,
/// and terminates with either `finish_reason: "stop"` or a
/// `content_filter` frame followed by the `[DONE]` sentinel.
pub fn guard_openai_chat_stream<S, E>(
    upstream: S,
    ctx: StreamContext,
    model: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    stream! {
        let id = chat_completion_id();
        let created = unix_now();
        pin_mut!(upstream);
        let mut lines = LineBuffer::new();
        let mut total = String::new();
        let mut scan_buffer = String::new();
        let mut sent_role = false;

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::error!(error = %err, "upstream error during chat stream");
                    let message = localized_message(MessageKey::ServerError, &ctx.language, None);
                    let frame = chat_chunk(&id, created, &model, json!({"content": message}), Some("error"));
                    yield Ok(sse(&frame));
                    yield Ok(Bytes::from_static(SSE_DONE));
                    return;
                }
            };
            for line in lines.push(&chunk) {
                if line.is_empty() {
                    continue;
                }
                let data: Value = match serde_json::from_str(&line) {
                    Ok(data) => data,
                    Err(_) => {
                        tracing::debug!("skipping non-JSON chat stream line");
                        continue;
                    }
                };

                if let Some(upstream_error) = data.get("error") {
                    let mut frame = chat_chunk(&id, created, &model, json!({}), Some("error"));
                    frame["error"] = upstream_error.clone();
                    yield Ok(sse(&frame));
                    yield Ok(Bytes::from_static(SSE_DONE));
                    tracing::info!("upstream closed after mid-stream error frame");
                    return;
                }

                let delta_text = data
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                if !delta_text.is_empty() {
                    if !sent_role {
                        let role = chat_chunk(&id, created, &model, json!({"role": "assistant"}), None);
                        yield Ok(sse(&role));
                        sent_role = true;
                    }

                    total.push_str(&delta_text);
                    scan_buffer.push_str(&delta_text);

                    if ctx.output_guard && scan_buffer.len() >= ctx.window {
                        let verdict = ctx.engine.scan_output("", &scan_buffer).await;
                        if !verdict.allowed {
                            tracing::warn!("chat stream output blocked");
                            let frame = blocked_chat_chunk(&ctx, &id, created, &model, &verdict, None);
                            yield Ok(sse(&frame));
                            yield Ok(Bytes::from_static(SSE_DONE));
                            tracing::info!("upstream closed after blocking chat output");
                            return;
                        }
                        scan_buffer.clear();
                    }

                    let frame = chat_chunk(&id, created, &model, json!({"content": delta_text}), None);
                    yield Ok(sse(&frame));
                }

                if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    let usage = usage_from_native(&data);

                    let remaining = if !scan_buffer.is_empty() {
                        scan_buffer.clone()
                    } else if total.len() <= ctx.window {
                        total.clone()
                    } else {
                        String::new()
                    };
                    if ctx.output_guard && !remaining.is_empty() {
                        let verdict = ctx.engine.scan_output("", &remaining).await;
                        if !verdict.allowed {
                            tracing::warn!("final chat window blocked");
                            let frame = blocked_chat_chunk(&ctx, &id, created, &model, &verdict, Some(usage));
                            yield Ok(sse(&frame));
                            yield Ok(Bytes::from_static(SSE_DONE));
                            return;
                        }
                    }

                    let mut frame = chat_chunk(&id, created, &model, json!({}), Some("stop"));
                    frame["usage"] = usage;
                    yield Ok(sse(&frame));
                    yield Ok(Bytes::from_static(SSE_DONE));
                    return;
                }
            }
        }
    }
}

fn blocked_chat_chunk(
    ctx: &StreamContext,
    id: &str,
    created: i64,
    model: &str,
    verdict: &ScanVerdict,
    usage: Option<Value>,
) -> Value {
    let failed = verdict.failed_scanners();
    let message = localized_message(MessageKey::ResponseBlocked, &ctx.language, None);
    let mut frame = if ctx.inline_guard {
        let markdown = format_markdown_error("Content policy violation", &message, &failed);
        let mut frame = chat_chunk(id, created, model, json!({"content": markdown}), Some("content_filter"));
        frame["guard"] = verdict_json(verdict);
        frame
    } else {
        let mut frame = chat_chunk(id, created, model, json!({}), Some("content_filter"));
        frame["error"] = json!({
            "message": message,
            "type": "content_policy_violation",
            "code": "output_blocked",
            "failed_scanners": failed,
        });
        frame
    };
    if let Some(usage) = usage {
        frame["usage"] = usage;
    }
    frame
}

/// Guard an OpenAI text-completions SSE stream fed by native generate
/// frames.
pub fn guard_openai_completion_stream<S, E>(
    upstream: S,
    ctx: StreamContext,
    model: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    stream! {
        let id = completion_id();
        let created = unix_now();
        pin_mut!(upstream);
        let mut lines = LineBuffer::new();
        let mut total = String::new();
        let mut scan_buffer = String::new();

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::error!(error = %err, "upstream error during completion stream");
                    let message = localized_message(MessageKey::ServerError, &ctx.language, None);
                    let frame = completion_chunk(&id, created, &model, &message, Some("error"));
                    yield Ok(sse(&frame));
                    yield Ok(Bytes::from_static(SSE_DONE));
                    return;
                }
            };
            for line in lines.push(&chunk) {
                if line.is_empty() {
                    continue;
                }
                let data: Value = match serde_json::from_str(&line) {
                    Ok(data) => data,
                    Err(_) => {
                        tracing::debug!("skipping non-JSON completion stream line");
                        continue;
                    }
                };

                if let Some(upstream_error) = data.get("error") {
                    let mut frame = completion_chunk(&id, created, &model, "", Some("error"));
                    frame["error"] = upstream_error.clone();
                    yield Ok(sse(&frame));
                    yield Ok(Bytes::from_static(SSE_DONE));
                    return;
                }

                let delta_text = data
                    .get("response")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                if !delta_text.is_empty() {
                    total.push_str(&delta_text);
                    scan_buffer.push_str(&delta_text);

                    if ctx.output_guard && scan_buffer.len() >= ctx.window {
                        let verdict = ctx.engine.scan_output("", &scan_buffer).await;
                        if !verdict.allowed {
                            tracing::warn!("completion stream output blocked");
                            let frame = blocked_completion_chunk(&ctx, &id, created, &model, &verdict, None);
                            yield Ok(sse(&frame));
                            yield Ok(Bytes::from_static(SSE_DONE));
                            return;
                        }
                        scan_buffer.clear();
                    }

                    let frame = completion_chunk(&id, created, &model, &delta_text, None);
                    yield Ok(sse(&frame));
                }

                if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    let usage = usage_from_native(&data);

                    let remaining = if !scan_buffer.is_empty() {
                        scan_buffer.clone()
                    } else if total.len() <= ctx.window {
                        total.clone()
                    } else {
                        String::new()
                    };
                    if ctx.output_guard && !remaining.is_empty() {
                        let verdict = ctx.engine.scan_output("", &remaining).await;
                        if !verdict.allowed {
                            let frame = blocked_completion_chunk(&ctx, &id, created, &model, &verdict, Some(usage));
                            yield Ok(sse(&frame));
                            yield Ok(Bytes::from_static(SSE_DONE));
                            return;
                        }
                    }

                    let mut frame = completion_chunk(&id, created, &model, "", Some("stop"));
                    frame["usage"] = usage;
                    yield Ok(sse(&frame));
                    yield Ok(Bytes::from_static(SSE_DONE));
                    return;
                }
            }
        }
    }
}

fn blocked_completion_chunk(
    ctx: &StreamContext,
    id: &str,
    created: i64,
    model: &str,
    verdict: &ScanVerdict,
    usage: Option<Value>,
) -> Value {
    let failed = verdict.failed_scanners();
    let message = localized_message(MessageKey::ResponseBlocked, &ctx.language, None);
    let text = if ctx.inline_guard {
        format_markdown_error("Content policy violation", &message, &failed)
    } else {
        message
    };
    let mut frame = completion_chunk(id, created, model, &text, Some("content_filter"));
    frame["guard"] = verdict_json(verdict);
    if let Some(usage) = usage {
        frame["usage"] = usage;
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardpost_scanners::scanners::BanSubstrings;
    use guardpost_scanners::Scanner;
    use std::sync::Arc;

    fn blocking_engine() -> GuardEngine {
        let scanner: Arc<dyn Scanner> = Arc::new(BanSubstrings::new(vec!["zzz".to_string()]));
        GuardEngine::with_scanners(Vec::new(), vec![scanner], true, false)
    }

    fn ctx(window: usize) -> StreamContext {
        StreamContext {
            engine: blocking_engine(),
            output_guard: true,
            window,
            inline_guard: false,
            language: "en".to_string(),
        }
    }

    fn chunks(lines: &[&str]) -> Vec<Result<Bytes, Infallible>> {
        lines
            .iter()
            .map(|l| Ok(Bytes::from(format!("{l}\n"))))
            .collect()
    }

    async fn collect(stream: impl Stream<Item = Result<Bytes, Infallible>>) -> String {
        let frames: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;
        frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    #[tokio::test]
    async fn native_clean_stream_is_forwarded_verbatim() {
        let upstream = futures::stream::iter(chunks(&[
            r#"{"model":"m","response":"hello ","done":false}"#,
            r#"{"response":"world","done":true}"#,
        ]));
        let out = collect(guard_native_stream(upstream, ctx(50))).await;
        assert!(out.contains(r#""response":"hello ""#));
        assert!(out.contains(r#""response":"world""#));
        assert!(!out.contains("guard_blocked"));
    }

    #[tokio::test]
    async fn native_blocked_stream_stops_forwarding() {
        let bad = "x".repeat(30) + "zzz" + &"y".repeat(30);
        let frames = [
            format!(r#"{{"model":"m","response":"{bad}","done":false}}"#),
            r#"{"response":"never seen","done":true}"#.to_string(),
        ];
        let upstream = futures::stream::iter(
            frames
                .iter()
                .map(|l| Ok::<_, Infallible>(Bytes::from(format!("{l}\n"))))
                .collect::<Vec<_>>(),
        );
        let out = collect(guard_native_stream(upstream, ctx(50))).await;
        assert!(out.contains(r#""done_reason":"guard_blocked""#));
        assert!(out.contains("ban_substrings"));
        assert!(!out.contains("never seen"));
    }

    #[tokio::test]
    async fn native_final_window_is_scanned_at_eof() {
        // Short text stays under the window until EOF.
        let upstream = futures::stream::iter(chunks(&[r#"{"model":"m","response":"zzz"}"#]));
        let out = collect(guard_native_stream(upstream, ctx(50))).await;
        assert!(out.contains("guard_blocked"));
    }

    #[tokio::test]
    async fn native_forwards_unparseable_lines() {
        let upstream = futures::stream::iter(chunks(&["not json at all"]));
        let out = collect(guard_native_stream(upstream, ctx(50))).await;
        assert!(out.contains("not json at all"));
    }

    #[tokio::test]
    async fn native_transport_error_emits_server_error_frame() {
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from("{\"model\":\"m\",\"response\":\"hi\"}\n")),
            Err("connection reset"),
        ]);
        let out = collect(guard_native_stream(upstream, ctx(50))).await;
        assert!(out.contains("server_error"));
    }

    #[tokio::test]
    async fn openai_chat_emits_role_then_content_then_stop() {
        let upstream = futures::stream::iter(chunks(&[
            r#"{"message":{"content":"Hello"},"done":false}"#,
            r#"{"message":{"content":""},"done":true,"prompt_eval_count":2,"eval_count":1}"#,
        ]));
        let out = collect(guard_openai_chat_stream(upstream, ctx(50), "m".to_string())).await;

        let role_at = out.find(r#""role":"assistant""#).unwrap();
        let content_at = out.find(r#""content":"Hello""#).unwrap();
        let stop_at = out.find(r#""finish_reason":"stop""#).unwrap();
        let done_at = out.find("data: [DONE]").unwrap();
        assert!(role_at < content_at && content_at < stop_at && stop_at < done_at);
        assert!(out.contains(r#""total_tokens":3"#));
    }

    #[tokio::test]
    async fn openai_chat_blocked_window_emits_content_filter() {
        let bad = "a".repeat(30) + "zzz" + &"b".repeat(30);
        let frames = [
            format!(r#"{{"message":{{"content":"{bad}"}},"done":false}}"#),
            r#"{"message":{"content":"tail"},"done":true}"#.to_string(),
        ];
        let upstream = futures::stream::iter(
            frames
                .iter()
                .map(|l| Ok::<_, Infallible>(Bytes::from(format!("{l}\n"))))
                .collect::<Vec<_>>(),
        );
        let out = collect(guard_openai_chat_stream(upstream, ctx(50), "m".to_string())).await;

        assert!(out.contains(r#""finish_reason":"content_filter""#));
        assert!(out.contains("content_policy_violation"));
        assert!(out.trim_end().ends_with("data: [DONE]"));
        assert!(!out.contains("tail"));
    }

    #[tokio::test]
    async fn openai_chat_forwards_upstream_error_object() {
        let upstream = futures::stream::iter(chunks(&[r#"{"error":"model not found"}"#]));
        let out = collect(guard_openai_chat_stream(upstream, ctx(50), "m".to_string())).await;
        assert!(out.contains(r#""finish_reason":"error""#));
        assert!(out.contains("model not found"));
        assert!(out.contains("data: [DONE]"));
    }

    #[tokio::test]
    async fn openai_completion_stream_uses_text_field() {
        let upstream = futures::stream::iter(chunks(&[
            r#"{"response":"four","done":false}"#,
            r#"{"response":"","done":true,"prompt_eval_count":1,"eval_count":2}"#,
        ]));
        let out = collect(guard_openai_completion_stream(upstream, ctx(50), "m".to_string())).await;
        assert!(out.contains(r#""text":"four""#));
        assert!(out.contains(r#""object":"text_completion""#));
        assert!(out.contains(r#""finish_reason":"stop""#));
        assert!(out.contains("data: [DONE]"));
    }

    #[tokio::test]
    async fn openai_completion_final_scan_blocks_short_output() {
        let upstream = futures::stream::iter(chunks(&[
            r#"{"response":"zzz","done":true}"#,
        ]));
        let out = collect(guard_openai_completion_stream(upstream, ctx(50), "m".to_string())).await;
        assert!(out.contains(r#""finish_reason":"content_filter""#));
    }

    #[tokio::test]
    async fn guard_disabled_forwards_blocked_content() {
        let mut context = ctx(10);
        context.output_guard = false;
        let upstream = futures::stream::iter(chunks(&[
            r#"{"model":"m","response":"zzz zzz zzz zzz","done":true}"#,
        ]));
        let out = collect(guard_native_stream(upstream, context)).await;
        assert!(out.contains("zzz zzz"));
        assert!(!out.contains("guard_blocked"));
    }
}
