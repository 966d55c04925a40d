//! Scan verdicts.
//!
//! A [`ScanVerdict`] is the aggregate result of running one text through a
//! scanner pipeline. Verdicts are serialized as JSON into the result cache
//! and embedded in `guard` payloads on blocked responses, so the shape here
//! is a wire contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result of one scanner within a pipeline run.
///
/// `risk_score` is a percentage in `[0.0, 100.0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerFinding {
    pub passed: bool,
    pub risk_score: f32,
    /// Whether this scanner rewrote the text it was given.
    pub sanitized: bool,
}

/// Aggregate verdict for one pipeline run.
///
/// With fail-fast enabled the `scanners` map may hold fewer entries than the
/// pipeline has scanners; omitted scanners were not evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanVerdict {
    /// True only if every evaluated scanner passed.
    pub allowed: bool,

    /// The text after all sanitizing rewrites (may equal the input).
    pub sanitized: String,

    /// Per-scanner findings, keyed by scanner name.
    pub scanners: BTreeMap<String, ScannerFinding>,

    /// Number of scanners in the pipeline that produced this verdict.
    pub scanner_count: usize,

    /// Error string attached when a scanner failed to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanVerdict {
    /// A verdict that lets `text` through untouched (empty pipeline, guard
    /// disabled, or fail-open on error).
    pub fn pass_through(text: impl Into<String>) -> Self {
        Self {
            allowed: true,
            sanitized: text.into(),
            scanners: BTreeMap::new(),
            scanner_count: 0,
            error: None,
        }
    }

    /// A verdict that blocks `text` without per-scanner detail (fail-closed
    /// on error).
    pub fn blocked_on_error(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            allowed: false,
            sanitized: text.into(),
            scanners: BTreeMap::new(),
            scanner_count: 0,
            error: Some(error.into()),
        }
    }

    /// The scanners that failed this verdict, with human-readable reasons.
    pub fn failed_scanners(&self) -> Vec<FailedScanner> {
        let mut failed: Vec<FailedScanner> = self
            .scanners
            .iter()
            .filter(|(_, finding)| !finding.passed)
            .map(|(name, finding)| FailedScanner {
                scanner: name.clone(),
                reason: format!("risk score {:.1}%", finding.risk_score),
                risk_score: finding.risk_score,
            })
            .collect();
        if failed.is_empty() {
            if let Some(err) = &self.error {
                failed.push(FailedScanner {
                    scanner: "pipeline".to_string(),
                    reason: err.clone(),
                    risk_score: 0.0,
                });
            }
        }
        failed
    }

    /// Comma-joined `scanner: reason` summary for message templates.
    pub fn failure_reason(&self) -> Option<String> {
        let failed = self.failed_scanners();
        if failed.is_empty() {
            return None;
        }
        Some(
            failed
                .iter()
                .map(|f| format!("{}: {}", f.scanner, f.reason))
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

/// One failing scanner, as surfaced in `X-Failed-Scanners` and `guard`
/// payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedScanner {
    pub scanner: String,
    pub reason: String,
    pub risk_score: f32,
}

/// Render a blocked-request explanation as markdown for inline-guard bodies.
pub fn format_markdown_error(title: &str, message: &str, failed: &[FailedScanner]) -> String {
    let mut body = format!("### {title}\n\n{message}\n");
    if !failed.is_empty() {
        body.push_str("\n**Failed scanners:**\n");
        for f in failed {
            body.push_str(&format!("- `{}` ({})\n", f.scanner, f.reason));
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict_with(entries: &[(&str, bool, f32)]) -> ScanVerdict {
        let mut scanners = BTreeMap::new();
        for (name, passed, risk) in entries {
            scanners.insert(
                name.to_string(),
                ScannerFinding {
                    passed: *passed,
                    risk_score: *risk,
                    sanitized: false,
                },
            );
        }
        ScanVerdict {
            allowed: entries.iter().all(|(_, passed, _)| *passed),
            sanitized: "text".to_string(),
            scanner_count: entries.len(),
            scanners,
            error: None,
        }
    }

    #[test]
    fn failed_scanners_lists_only_failures() {
        let verdict = verdict_with(&[("toxicity", false, 92.5), ("secrets", true, 0.0)]);
        let failed = verdict.failed_scanners();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].scanner, "toxicity");
        assert!(failed[0].reason.contains("92.5"));
    }

    #[test]
    fn error_surfaces_as_pipeline_failure() {
        let verdict = ScanVerdict::blocked_on_error("text", "model load failed");
        let failed = verdict.failed_scanners();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].scanner, "pipeline");
        assert_eq!(failed[0].reason, "model load failed");
    }

    #[test]
    fn verdict_json_round_trip() {
        let verdict = verdict_with(&[("ban_substrings", false, 100.0)]);
        let json = serde_json::to_string(&verdict).unwrap();
        let back: ScanVerdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back.allowed, verdict.allowed);
        assert_eq!(back.scanners.len(), 1);
        assert!(!back.scanners["ban_substrings"].passed);
    }

    #[test]
    fn markdown_rendering_includes_scanner_list() {
        let verdict = verdict_with(&[("no_refusal", false, 77.0)]);
        let md = format_markdown_error("Response blocked", "blocked.", &verdict.failed_scanners());
        assert!(md.starts_with("### Response blocked"));
        assert!(md.contains("`no_refusal`"));
    }
}
