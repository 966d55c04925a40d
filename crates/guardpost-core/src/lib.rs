//! Core types for guardpost.
//!
//! This crate defines the shared abstractions used across the proxy:
//! configuration loading, language detection with localized messages,
//! and the scan-verdict data model produced by the policy engine.

pub mod config;
pub mod language;
pub mod verdict;

pub use config::{CacheBackendKind, ConfigError, ParallelSetting, ProxyConfig, ScannerSettings};
pub use language::{detect_language, localized_message, normalize_lang_code, MessageKey};
pub use verdict::{format_markdown_error, FailedScanner, ScanVerdict, ScannerFinding};
