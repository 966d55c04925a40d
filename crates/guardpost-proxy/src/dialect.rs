//! Translation between the OpenAI dialect and the native backend protocol.
//!
//! Translation is stateless: requests map option-for-option onto the native
//! `options` object, and native responses are re-shaped into OpenAI
//! completion objects with synthesized ids and usage derived from the
//! backend's eval counts.

use serde_json::{json, Map, Value};

/// Decoding options copied verbatim from an OpenAI payload into the native
/// `options` object.
const OPTION_KEYS: &[&str] = &[
    "temperature",
    "top_p",
    "top_k",
    "repeat_penalty",
    "num_ctx",
    "seed",
    "stop",
    "presence_penalty",
    "frequency_penalty",
];

/// Extract the model name from any request payload (`"default"` fallback).
pub fn extract_model(payload: &Value) -> String {
    payload
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// Extract the scannable text from a native request payload.
pub fn extract_prompt(payload: &Value) -> String {
    for key in ["prompt", "input"] {
        if let Some(text) = payload.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    String::new()
}

/// Extract the generated text from a native non-streaming response.
pub fn extract_response_text(data: &Value) -> String {
    for key in ["response", "text", "output"] {
        if let Some(text) = data.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    if let Some(content) = data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return content.to_string();
    }
    // Last resort: join any top-level string values.
    if let Some(object) = data.as_object() {
        let joined: Vec<&str> = object.values().filter_map(Value::as_str).collect();
        if !joined.is_empty() {
            return joined.join(" ");
        }
    }
    String::new()
}

/// Combine chat message contents for guard scanning.
///
/// `roles` filters by role (case-insensitive); `latest_only` returns just
/// the most recent matching message.
pub fn combine_messages_text(messages: &[Value], roles: Option<&[&str]>, latest_only: bool) -> String {
    let matches = |message: &Value| -> bool {
        match roles {
            None => true,
            Some(wanted) => message
                .get("role")
                .and_then(Value::as_str)
                .map(|role| wanted.iter().any(|w| w.eq_ignore_ascii_case(role)))
                .unwrap_or(false),
        }
    };
    let content_of = |message: &Value| -> Option<String> {
        message
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.to_string())
    };

    if latest_only {
        return messages
            .iter()
            .rev()
            .filter(|m| matches(m))
            .find_map(content_of)
            .unwrap_or_default();
    }

    messages
        .iter()
        .filter(|m| matches(m))
        .filter_map(content_of)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the prompt from an OpenAI completion payload; arrays of strings
/// are joined with newlines.
pub fn prompt_from_completion_payload(payload: &Value) -> String {
    match payload.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Map OpenAI decoding options onto the native `options` object.
///
/// `max_tokens` becomes `options.num_predict`; an existing `options` object
/// in the payload seeds the result so explicit native options survive.
pub fn options_from_openai(payload: &Value) -> Option<Value> {
    let mut options = payload
        .get("options")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    for key in OPTION_KEYS {
        if let Some(value) = payload.get(*key) {
            if !value.is_null() {
                options.insert((*key).to_string(), value.clone());
            }
        }
    }

    if let Some(max_tokens) = payload.get("max_tokens").and_then(Value::as_i64) {
        if max_tokens > 0 {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
    }

    if options.is_empty() {
        None
    } else {
        Some(Value::Object(options))
    }
}

/// Build the native chat payload for an OpenAI chat request.
pub fn native_chat_payload(payload: &Value, model: &str, stream: bool) -> Value {
    let mut native = json!({
        "model": model,
        "messages": payload.get("messages").cloned().unwrap_or(Value::Null),
        "stream": stream,
    });
    if let Some(options) = options_from_openai(payload) {
        native["options"] = options;
    }
    for key in ["tools", "functions"] {
        if let Some(value) = payload.get(key) {
            if value.is_array() {
                native[key] = value.clone();
            }
        }
    }
    native
}

/// Build the native generate payload for an OpenAI completion request.
pub fn native_generate_payload(payload: &Value, model: &str, prompt: &str, stream: bool) -> Value {
    let mut native = json!({
        "model": model,
        "prompt": prompt,
        "stream": stream,
    });
    if let Some(options) = options_from_openai(payload) {
        native["options"] = options;
    }
    if let Some(images) = payload.get("images") {
        if images.is_array() {
            native["images"] = images.clone();
        }
    }
    native
}

/// OpenAI usage object from native eval counts.
pub fn usage_from_native(data: &Value) -> Value {
    let prompt_tokens = data
        .get("prompt_eval_count")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion_tokens = data.get("eval_count").and_then(Value::as_i64).unwrap_or(0);
    json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens + completion_tokens,
    })
}

pub fn zero_usage() -> Value {
    json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0})
}

/// Synthesized id for a chat completion response.
pub fn chat_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Synthesized id for a text completion response.
pub fn completion_id() -> String {
    format!("cmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Current Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Build an OpenAI chat completion response body.
///
/// `finish_reason = None` serializes as JSON null (generation not done).
pub fn chat_completion_response(
    model: &str,
    content: &str,
    finish_reason: Option<&str>,
    usage: Value,
    guard: Option<Value>,
    system_fingerprint: Option<&Value>,
) -> Value {
    let mut response = json!({
        "id": chat_completion_id(),
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [
            {
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": finish_reason,
            }
        ],
        "usage": usage,
    });
    if let Some(guard) = guard {
        response["guard"] = guard;
    }
    if let Some(fingerprint) = system_fingerprint {
        response["system_fingerprint"] = fingerprint.clone();
    }
    response
}

/// Build an OpenAI text completion response body.
pub fn text_completion_response(
    model: &str,
    text: &str,
    finish_reason: Option<&str>,
    usage: Value,
    guard: Option<Value>,
    system_fingerprint: Option<&Value>,
) -> Value {
    let mut response = json!({
        "id": completion_id(),
        "object": "text_completion",
        "created": unix_now(),
        "model": model,
        "choices": [
            {
                "index": 0,
                "text": text,
                "logprobs": null,
                "finish_reason": finish_reason,
            }
        ],
        "usage": usage,
    });
    if let Some(guard) = guard {
        response["guard"] = guard;
    }
    if let Some(fingerprint) = system_fingerprint {
        response["system_fingerprint"] = fingerprint.clone();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_openai_options_to_native() {
        let payload = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.7,
            "max_tokens": 32,
            "top_p": 0.9,
            "stop": ["\n"],
        });
        let native = native_chat_payload(&payload, "m", false);
        assert_eq!(native["model"], "m");
        assert_eq!(native["stream"], false);
        assert_eq!(native["options"]["temperature"], 0.7);
        assert_eq!(native["options"]["num_predict"], 32);
        assert_eq!(native["options"]["top_p"], 0.9);
        assert_eq!(native["options"]["stop"][0], "\n");
        assert!(native["options"].get("max_tokens").is_none());
    }

    #[test]
    fn option_values_survive_round_trip() {
        let payload = json!({
            "temperature": 0.25,
            "seed": 42,
            "presence_penalty": 1.5,
            "frequency_penalty": 0.1,
            "repeat_penalty": 1.1,
            "num_ctx": 4096,
            "top_k": 50,
        });
        let options = options_from_openai(&payload).unwrap();
        for key in [
            "temperature",
            "seed",
            "presence_penalty",
            "frequency_penalty",
            "repeat_penalty",
            "num_ctx",
            "top_k",
        ] {
            assert_eq!(options[key], payload[key], "option {key} must be preserved");
        }
    }

    #[test]
    fn no_options_yields_none() {
        assert!(options_from_openai(&json!({"model": "m"})).is_none());
    }

    #[test]
    fn zero_max_tokens_is_ignored() {
        assert!(options_from_openai(&json!({"max_tokens": 0})).is_none());
    }

    #[test]
    fn completion_prompt_array_joins_on_newline() {
        let payload = json!({"prompt": ["line one", "line two"]});
        assert_eq!(prompt_from_completion_payload(&payload), "line one\nline two");

        let payload = json!({"prompt": "single"});
        assert_eq!(prompt_from_completion_payload(&payload), "single");
    }

    #[test]
    fn combine_latest_user_turn() {
        let messages = vec![
            json!({"role": "system", "content": "be nice"}),
            json!({"role": "user", "content": "first"}),
            json!({"role": "assistant", "content": "reply"}),
            json!({"role": "user", "content": "second"}),
        ];
        assert_eq!(
            combine_messages_text(&messages, Some(&["user"]), true),
            "second"
        );
        assert_eq!(
            combine_messages_text(&messages, None, false),
            "be nice\nfirst\nreply\nsecond"
        );
    }

    #[test]
    fn usage_sums_eval_counts() {
        let data = json!({"prompt_eval_count": 2, "eval_count": 1});
        let usage = usage_from_native(&data);
        assert_eq!(usage["prompt_tokens"], 2);
        assert_eq!(usage["completion_tokens"], 1);
        assert_eq!(usage["total_tokens"], 3);
    }

    #[test]
    fn missing_eval_counts_default_to_zero() {
        let usage = usage_from_native(&json!({}));
        assert_eq!(usage["total_tokens"], 0);
    }

    #[test]
    fn synthesized_ids_have_expected_prefixes() {
        assert!(chat_completion_id().starts_with("chatcmpl-"));
        assert!(completion_id().starts_with("cmpl-"));
        assert_ne!(chat_completion_id(), chat_completion_id());
    }

    #[test]
    fn chat_response_shape() {
        let data = json!({"prompt_eval_count": 2, "eval_count": 1});
        let response =
            chat_completion_response("m", "hello", Some("stop"), usage_from_native(&data), None, None);
        assert_eq!(response["object"], "chat.completion");
        assert_eq!(response["choices"][0]["message"]["content"], "hello");
        assert_eq!(response["choices"][0]["message"]["role"], "assistant");
        assert_eq!(response["choices"][0]["finish_reason"], "stop");
        assert_eq!(response["usage"]["total_tokens"], 3);
    }

    #[test]
    fn extract_model_defaults() {
        assert_eq!(extract_model(&json!({})), "default");
        assert_eq!(extract_model(&json!({"model": "llama3:8b"})), "llama3:8b");
    }

    #[test]
    fn response_text_extraction_prefers_response_field() {
        assert_eq!(extract_response_text(&json!({"response": "hi"})), "hi");
        assert_eq!(
            extract_response_text(&json!({"message": {"content": "chat"}})),
            "chat"
        );
    }
}
