//! Policy scanning engine for guardpost.
//!
//! A [`Scanner`] scores one string on one risk dimension and may rewrite it
//! (redaction, anonymization). The [`GuardEngine`] composes scanners into
//! ordered input and output pipelines with fail-fast evaluation and
//! fail-open/fail-closed error handling.
//!
//! Scanner execution is synchronous and CPU-bound; the engine dispatches
//! pipeline runs onto the blocking thread pool so the request scheduler is
//! never stalled.

pub mod pipeline;
pub mod scanner;
pub mod scanners;
pub mod vault;

pub use pipeline::GuardEngine;
pub use scanner::{ScanOutcome, Scanner, ScannerError, ScannerKind};
pub use vault::Vault;
