//! Proxy configuration.
//!
//! Settings are resolved with the following priority:
//! 1. Environment variables (config key uppercased, e.g. `ollama_url` -> `OLLAMA_URL`)
//! 2. Values from a YAML configuration file
//! 3. Built-in defaults
//!
//! A missing config file falls back to defaults; an unreadable or malformed
//! file is a startup error.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration load failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Parallelism setting: a fixed count or `auto` (sized from host memory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelSetting {
    Fixed(usize),
    Keyword(String),
}

impl ParallelSetting {
    /// Returns the fixed limit, or `None` when auto-detection is requested.
    pub fn fixed(&self) -> Option<usize> {
        match self {
            ParallelSetting::Fixed(n) => Some(*n),
            ParallelSetting::Keyword(s) => s.trim().parse::<usize>().ok(),
        }
    }
}

impl Default for ParallelSetting {
    fn default() -> Self {
        ParallelSetting::Keyword("auto".to_string())
    }
}

/// Cache backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Distributed when a Redis URL is configured and reachable, else memory.
    Auto,
    Memory,
    Distributed,
}

impl Default for CacheBackendKind {
    fn default() -> Self {
        CacheBackendKind::Auto
    }
}

/// Per-scanner configuration entry under `input_scanners` / `output_scanners`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Enable or disable this scanner. `None` means "use the built-in default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Risk threshold in `[0.0, 1.0]` for classifier scanners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,

    /// Deny-listed substrings for the ban-substrings scanner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substrings: Option<Vec<String>>,

    /// Languages the code scanner should flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream Ollama base URL.
    pub ollama_url: String,

    /// Upstream path used by the generate endpoint.
    pub ollama_path: String,

    pub proxy_host: String,
    pub proxy_port: u16,

    /// Overall per-request timeout in seconds (native endpoints).
    pub request_timeout: u64,

    /// Overall per-request timeout in seconds (OpenAI endpoints).
    pub openai_timeout: u64,

    pub enable_input_guard: bool,
    pub enable_output_guard: bool,

    /// When true, a scanner error counts as a failed scan (fail-closed).
    pub block_on_guard_error: bool,

    /// When true, policy violations are returned as successful responses
    /// whose body carries the explanation instead of HTTP 451.
    pub inline_guard_errors: bool,

    /// Stop the pipeline at the first failing scanner.
    pub scan_fail_fast: bool,

    /// Character window between consecutive output-stream scans.
    pub stream_scan_window: usize,

    /// Max parallel requests per model (`auto` sizes from host memory).
    pub ollama_num_parallel: ParallelSetting,

    /// Max queued requests per model before rejection.
    pub ollama_max_queue: usize,

    pub cache_enabled: bool,
    pub cache_backend: CacheBackendKind,
    pub cache_max_size: usize,
    /// Verdict TTL in seconds.
    pub cache_ttl: u64,

    /// Redis connection URL for the distributed cache backend
    /// (`redis://[:password@]host:port/db`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    pub trusted_hosts: Vec<String>,
    pub cors_allow_origins: Vec<String>,
    pub cors_allow_methods: Vec<String>,
    pub cors_allow_headers: Vec<String>,
    pub cors_allow_credentials: bool,
    pub cors_max_age: u64,

    pub input_scanners: BTreeMap<String, ScannerSettings>,
    pub output_scanners: BTreeMap<String, ScannerSettings>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            ollama_path: "/api/generate".to_string(),
            proxy_host: "0.0.0.0".to_string(),
            proxy_port: 8080,
            request_timeout: 300,
            openai_timeout: 300,
            enable_input_guard: true,
            enable_output_guard: true,
            block_on_guard_error: false,
            inline_guard_errors: false,
            scan_fail_fast: true,
            stream_scan_window: 50,
            ollama_num_parallel: ParallelSetting::default(),
            ollama_max_queue: 512,
            cache_enabled: true,
            cache_backend: CacheBackendKind::Auto,
            cache_max_size: 1000,
            cache_ttl: 3600,
            redis_url: None,
            trusted_hosts: Vec::new(),
            cors_allow_origins: vec!["*".to_string()],
            cors_allow_methods: vec!["*".to_string()],
            cors_allow_headers: vec!["*".to_string()],
            cors_allow_credentials: false,
            cors_max_age: 600,
            input_scanners: BTreeMap::new(),
            output_scanners: BTreeMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from an optional YAML file, then apply environment
    /// overrides. A `None` or missing path yields defaults (+ env).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.display().to_string(),
                    source,
                })?;
                let parsed: ProxyConfig =
                    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                        path: p.display().to_string(),
                        source,
                    })?;
                tracing::info!(path = %p.display(), "loaded configuration file");
                parsed
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                ProxyConfig::default()
            }
            None => ProxyConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Overlay environment variables onto the loaded values.
    ///
    /// Each recognized key reads the variable named by uppercasing the key.
    pub fn apply_env_overrides(&mut self) {
        env_string("OLLAMA_URL", &mut self.ollama_url);
        env_string("OLLAMA_PATH", &mut self.ollama_path);
        env_string("PROXY_HOST", &mut self.proxy_host);
        env_parse("PROXY_PORT", &mut self.proxy_port);
        env_parse("REQUEST_TIMEOUT", &mut self.request_timeout);
        env_parse("OPENAI_TIMEOUT", &mut self.openai_timeout);
        env_bool("ENABLE_INPUT_GUARD", &mut self.enable_input_guard);
        env_bool("ENABLE_OUTPUT_GUARD", &mut self.enable_output_guard);
        env_bool("BLOCK_ON_GUARD_ERROR", &mut self.block_on_guard_error);
        env_bool("INLINE_GUARD_ERRORS", &mut self.inline_guard_errors);
        env_bool("SCAN_FAIL_FAST", &mut self.scan_fail_fast);
        env_parse("STREAM_SCAN_WINDOW", &mut self.stream_scan_window);
        env_parse("OLLAMA_MAX_QUEUE", &mut self.ollama_max_queue);
        env_bool("CACHE_ENABLED", &mut self.cache_enabled);
        env_parse("CACHE_MAX_SIZE", &mut self.cache_max_size);
        env_parse("CACHE_TTL", &mut self.cache_ttl);

        if let Ok(value) = std::env::var("OLLAMA_NUM_PARALLEL") {
            self.ollama_num_parallel = match value.trim().parse::<usize>() {
                Ok(n) => ParallelSetting::Fixed(n),
                Err(_) => ParallelSetting::Keyword(value),
            };
        }
        if let Ok(value) = std::env::var("CACHE_BACKEND") {
            match value.to_ascii_lowercase().as_str() {
                "auto" => self.cache_backend = CacheBackendKind::Auto,
                "memory" => self.cache_backend = CacheBackendKind::Memory,
                "distributed" | "redis" => self.cache_backend = CacheBackendKind::Distributed,
                other => tracing::warn!(value = other, "unrecognized CACHE_BACKEND, keeping configured value"),
            }
        }
        if let Ok(value) = std::env::var("REDIS_URL") {
            if !value.trim().is_empty() {
                self.redis_url = Some(value);
            }
        }
        env_list("TRUSTED_HOSTS", &mut self.trusted_hosts);
        env_list("CORS_ALLOW_ORIGINS", &mut self.cors_allow_origins);
        env_list("CORS_ALLOW_METHODS", &mut self.cors_allow_methods);
        env_list("CORS_ALLOW_HEADERS", &mut self.cors_allow_headers);
        env_bool("CORS_ALLOW_CREDENTIALS", &mut self.cors_allow_credentials);
        env_parse("CORS_MAX_AGE", &mut self.cors_max_age);
    }

    /// Per-request timeout for the native endpoints.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Per-request timeout for the OpenAI endpoints.
    pub fn openai_timeout(&self) -> Duration {
        Duration::from_secs(self.openai_timeout)
    }

    /// Upstream base URL with any trailing slash removed.
    pub fn ollama_base(&self) -> &str {
        self.ollama_url.trim_end_matches('/')
    }

    /// Non-sensitive subset surfaced by the `/config` endpoint.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "ollama_url": self.ollama_url,
            "ollama_path": self.ollama_path,
            "proxy_host": self.proxy_host,
            "proxy_port": self.proxy_port,
            "enable_input_guard": self.enable_input_guard,
            "enable_output_guard": self.enable_output_guard,
            "block_on_guard_error": self.block_on_guard_error,
            "inline_guard_errors": self.inline_guard_errors,
            "scan_fail_fast": self.scan_fail_fast,
            "stream_scan_window": self.stream_scan_window,
            "cache_enabled": self.cache_enabled,
        })
    }
}

/// Interpret an environment string as a boolean flag.
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(name) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(value) = std::env::var(name) {
        match parse_bool_flag(&value) {
            Some(flag) => *slot = flag,
            None => tracing::warn!(var = name, value = %value, "could not parse boolean env override"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var = name, value = %value, "could not parse env override"),
        }
    }
}

fn env_list(name: &str, slot: &mut Vec<String>) {
    if let Ok(value) = std::env::var(name) {
        let items: Vec<String> = value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !items.is_empty() {
            *slot = items;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = ProxyConfig::default();
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.proxy_port, 8080);
        assert!(config.enable_input_guard);
        assert!(config.enable_output_guard);
        assert!(!config.block_on_guard_error);
        assert!(config.scan_fail_fast);
        assert_eq!(config.stream_scan_window, 50);
        assert_eq!(config.ollama_max_queue, 512);
        assert_eq!(config.ollama_num_parallel.fixed(), None);
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "ollama_url: http://10.0.0.5:11434\n\
             proxy_port: 9090\n\
             ollama_num_parallel: 2\n\
             enable_output_guard: false\n\
             input_scanners:\n\
             \x20 toxicity:\n\
             \x20   enabled: true\n\
             \x20   threshold: 0.7\n\
             \x20 ban_substrings:\n\
             \x20   substrings: [foo, bar]"
        )
        .unwrap();

        let config = ProxyConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.ollama_url, "http://10.0.0.5:11434");
        assert_eq!(config.proxy_port, 9090);
        assert_eq!(config.ollama_num_parallel.fixed(), Some(2));
        assert!(!config.enable_output_guard);
        let tox = config.input_scanners.get("toxicity").unwrap();
        assert_eq!(tox.threshold, Some(0.7));
        let ban = config.input_scanners.get("ban_substrings").unwrap();
        assert_eq!(
            ban.substrings.as_deref(),
            Some(&["foo".to_string(), "bar".to_string()][..])
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ProxyConfig::load(Some(Path::new("/nonexistent/guardpost.yaml"))).unwrap();
        assert_eq!(config.proxy_port, 8080);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "proxy_port: [not, a, port]").unwrap();
        assert!(ProxyConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn parallel_keyword_parses_numeric_strings() {
        let setting = ParallelSetting::Keyword("8".to_string());
        assert_eq!(setting.fixed(), Some(8));
        let auto = ParallelSetting::Keyword("auto".to_string());
        assert_eq!(auto.fixed(), None);
    }

    #[test]
    fn bool_flag_parsing() {
        assert_eq!(parse_bool_flag("yes"), Some(true));
        assert_eq!(parse_bool_flag("ON"), Some(true));
        assert_eq!(parse_bool_flag("0"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }
}
