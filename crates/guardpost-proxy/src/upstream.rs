//! Shared HTTP client for the inference backend.
//!
//! One pooled, keep-alive client lives for the process. HTTP/2 is used when
//! the backend negotiates it. Transport errors are retried within a bounded
//! budget; HTTP status codes are never retried.

use std::time::Duration;

use guardpost_core::config::ProxyConfig;
use serde_json::Value;

/// Upstream transport failure (after retries).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Pooled client plus the upstream base URL.
pub struct UpstreamClient {
    client: reqwest::Client,
    base: String,
    retries: usize,
}

impl UpstreamClient {
    /// Build the process-wide client. Pool and timeout knobs come from the
    /// environment; per-call timeouts are passed by the orchestrators.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, UpstreamError> {
        let max_idle = env_usize("GUARDPOST_HTTP_MAX_IDLE", 100);
        let keepalive_expiry = env_u64("GUARDPOST_HTTP_KEEPALIVE_EXPIRY", 45);
        let connect_timeout = env_u64("GUARDPOST_HTTP_CONNECT_TIMEOUT", 60);
        let retries = env_usize("GUARDPOST_HTTP_RETRIES", 2);

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(max_idle)
            .pool_idle_timeout(Duration::from_secs(keepalive_expiry))
            .connect_timeout(Duration::from_secs(connect_timeout))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .http2_keep_alive_timeout(Duration::from_secs(10))
            .http2_adaptive_window(true)
            .build()?;

        tracing::info!(
            base = %config.ollama_base(),
            pool = max_idle,
            keepalive_s = keepalive_expiry,
            retries,
            "upstream client initialized"
        );

        Ok(Self {
            client,
            base: config.ollama_base().to_string(),
            retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// GET a backend endpoint.
    pub async fn get(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.url(path);
        self.send_with_retry(|| self.client.get(&url).timeout(timeout))
            .await
    }

    /// POST a JSON payload; the response body is buffered by the caller.
    pub async fn post_json(
        &self,
        path: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.url(path);
        self.send_with_retry(|| self.client.post(&url).json(payload).timeout(timeout))
            .await
    }

    /// POST a JSON payload for a streaming response.
    ///
    /// The returned [`reqwest::Response`] owns the connection: dropping it
    /// on any path aborts the upstream read, which stops generation on the
    /// backend. Callers hand it to the streaming guard, which is the single
    /// owner.
    pub async fn post_stream(
        &self,
        path: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, UpstreamError> {
        // Retrying is safe here: send() resolves at response headers, before
        // any body bytes are consumed.
        self.post_json(path, payload, timeout).await
    }

    async fn send_with_retry<B>(&self, build: B) -> Result<reqwest::Response, UpstreamError>
    where
        B: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        let mut backoff = Duration::from_millis(100);
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %err,
                        attempt,
                        retries = self.retries,
                        "upstream transport error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
                Err(err) => {
                    tracing::error!(error = %err, "upstream request failed");
                    return Err(UpstreamError::Transport(err));
                }
            }
        }
    }
}

/// Parse a response body as JSON, reporting the error as a string.
pub async fn safe_json(response: reqwest::Response) -> Result<Value, String> {
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        let client = UpstreamClient::from_config(&ProxyConfig::default()).unwrap();
        assert_eq!(client.url("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let mut config = ProxyConfig::default();
        config.ollama_url = "http://backend:11434/".to_string();
        let client = UpstreamClient::from_config(&config).unwrap();
        assert_eq!(client.url("/api/chat"), "http://backend:11434/api/chat");
    }
}
