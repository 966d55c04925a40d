//! Client-facing error taxonomy and HTTP rendering.

use axum::http::{header::HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use guardpost_core::language::{localized_message, MessageKey};
use guardpost_core::verdict::FailedScanner;
use serde_json::{json, Value};

pub const HEADER_ERROR_TYPE: &str = "x-error-type";
pub const HEADER_BLOCK_TYPE: &str = "x-block-type";
pub const HEADER_LANGUAGE: &str = "x-language";
pub const HEADER_FAILED_SCANNERS: &str = "x-failed-scanners";

/// Whether a violation was found in the prompt or in the model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Input,
    Output,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::Input => "input_blocked",
            BlockType::Output => "output_blocked",
        }
    }
}

/// Request failures that terminate handling with an error status.
///
/// The server stays healthy; every variant maps to a well-defined status
/// code and JSON body with a message localized for the detected language.
#[derive(Debug)]
pub enum ApiError {
    InvalidJson { detail: String },
    InvalidPayload { kind: &'static str, message: &'static str },
    QueueFull { model: String, language: String },
    Timeout { model: String, language: String },
    Upstream { language: String, details: Option<String> },
    InvalidUpstreamResponse { language: String },
    /// Non-200 from the backend, passed through with its body.
    UpstreamStatus { status: u16, body: Value },
}

impl ApiError {
    pub fn invalid_json(detail: impl Into<String>) -> Self {
        ApiError::InvalidJson {
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidJson { detail } => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_json", "message": detail})),
            )
                .into_response(),
            ApiError::InvalidPayload { kind, message } => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": kind, "message": message})),
            )
                .into_response(),
            ApiError::QueueFull { model, language } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "queue_full",
                    "message": localized_message(MessageKey::ServerBusy, &language, None),
                    "model": model,
                })),
            )
                .into_response(),
            ApiError::Timeout { model, language } => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({
                    "error": "timeout",
                    "message": localized_message(MessageKey::RequestTimeout, &language, None),
                    "model": model,
                })),
            )
                .into_response(),
            ApiError::Upstream { language, details } => {
                let mut body = json!({
                    "error": "upstream_error",
                    "message": localized_message(MessageKey::UpstreamError, &language, None),
                });
                if let Some(details) = details {
                    body["details"] = Value::String(details);
                }
                (StatusCode::BAD_GATEWAY, Json(body)).into_response()
            }
            ApiError::InvalidUpstreamResponse { language } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "invalid_upstream_response",
                    "message": localized_message(MessageKey::ServerError, &language, None),
                })),
            )
                .into_response(),
            ApiError::UpstreamStatus { status, body } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                (status, Json(body)).into_response()
            }
        }
    }
}

/// Render a policy violation as HTTP 451 with the structured block headers.
pub fn blocked_response(
    block_type: BlockType,
    language: &str,
    message: &str,
    failed: &[FailedScanner],
    scan: Option<&Value>,
) -> Response {
    let mut details = json!({
        "failed_scanners": failed,
        "block_type": block_type.as_str(),
    });
    if let Some(scan) = scan {
        details["scan"] = scan.clone();
    }
    let body = json!({
        "error": "content_policy_violation",
        "message": message,
        "language": language,
        "details": details,
    });

    let mut response = (StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(HEADER_ERROR_TYPE),
        HeaderValue::from_static("content_policy_violation"),
    );
    headers.insert(
        HeaderName::from_static(HEADER_BLOCK_TYPE),
        HeaderValue::from_static(block_type.as_str()),
    );
    if let Ok(value) = HeaderValue::from_str(language) {
        headers.insert(HeaderName::from_static(HEADER_LANGUAGE), value);
    }
    let failed_json = serde_json::to_string(failed).unwrap_or_else(|_| "[]".to_string());
    if let Ok(value) = HeaderValue::from_str(&failed_json) {
        headers.insert(HeaderName::from_static(HEADER_FAILED_SCANNERS), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> Vec<FailedScanner> {
        vec![FailedScanner {
            scanner: "secrets".to_string(),
            reason: "risk score 100.0%".to_string(),
            risk_score: 100.0,
        }]
    }

    #[test]
    fn blocked_response_carries_headers() {
        let response = blocked_response(BlockType::Input, "en", "blocked", &failed(), None);
        assert_eq!(response.status(), StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS);
        let headers = response.headers();
        assert_eq!(headers.get(HEADER_BLOCK_TYPE).unwrap(), "input_blocked");
        assert_eq!(
            headers.get(HEADER_ERROR_TYPE).unwrap(),
            "content_policy_violation"
        );
        assert_eq!(headers.get(HEADER_LANGUAGE).unwrap(), "en");
        let scanners = headers.get(HEADER_FAILED_SCANNERS).unwrap().to_str().unwrap();
        assert!(scanners.contains("secrets"));
    }

    #[test]
    fn queue_full_maps_to_429() {
        let response = ApiError::QueueFull {
            model: "m".to_string(),
            language: "en".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn timeout_maps_to_504() {
        let response = ApiError::Timeout {
            model: "m".to_string(),
            language: "en".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn upstream_maps_to_502() {
        let response = ApiError::Upstream {
            language: "en".to_string(),
            details: Some("connection refused".to_string()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
