//! Scanner trait and result types.

/// Which pipelines a scanner may participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerKind {
    /// Scans prompts before they reach the model.
    Input,
    /// Scans model output before it reaches the client.
    Output,
    /// Valid in either pipeline.
    Both,
}

/// Result of scanning one string with one scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    /// The text after any rewrite; feeds the next scanner in the pipeline.
    pub sanitized: String,
    pub passed: bool,
    /// Normalized risk in `[0.0, 1.0]`.
    pub risk_score: f32,
}

impl ScanOutcome {
    pub fn pass(sanitized: impl Into<String>) -> Self {
        Self {
            sanitized: sanitized.into(),
            passed: true,
            risk_score: 0.0,
        }
    }

    pub fn pass_scored(sanitized: impl Into<String>, risk_score: f32) -> Self {
        Self {
            sanitized: sanitized.into(),
            passed: true,
            risk_score: risk_score.clamp(0.0, 1.0),
        }
    }

    pub fn fail(sanitized: impl Into<String>, risk_score: f32) -> Self {
        Self {
            sanitized: sanitized.into(),
            passed: false,
            risk_score: risk_score.clamp(0.0, 1.0),
        }
    }
}

/// Scanner execution failure.
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("invalid scanner configuration: {0}")]
    InvalidConfig(String),

    #[error("scanner evaluation failed: {0}")]
    Evaluation(String),
}

/// One risk dimension over a string.
///
/// Implementations must be deterministic: the same input yields the same
/// outcome for the lifetime of the pipeline. They run on the blocking worker
/// pool, so they may be CPU-heavy but must not block on I/O.
pub trait Scanner: Send + Sync {
    /// Unique name within a pipeline; also the key in verdict maps and the
    /// config table.
    fn name(&self) -> &str;

    fn kind(&self) -> ScannerKind;

    /// Score `text`, optionally returning a rewritten version.
    fn scan(&self, text: &str) -> Result<ScanOutcome, ScannerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_clamps_risk_scores() {
        assert_eq!(ScanOutcome::fail("x", 3.5).risk_score, 1.0);
        assert_eq!(ScanOutcome::pass_scored("x", -0.2).risk_score, 0.0);
    }
}
