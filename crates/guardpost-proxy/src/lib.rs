//! The guardpost HTTP proxy.
//!
//! Serves the native Ollama API and the OpenAI-compatible API on one port,
//! scanning prompts and responses through the policy engine, gating requests
//! through the per-model admission controller, and guarding streaming output
//! window by window.

pub mod concurrency;
pub mod dialect;
pub mod error;
pub mod handlers;
pub mod server;
pub mod streaming;
pub mod upstream;

pub use concurrency::{AdmissionController, AdmissionError};
pub use server::{run, ProxyState};
pub use upstream::{UpstreamClient, UpstreamError};
