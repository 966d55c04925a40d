//! Model-refusal detector for output scanning.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::scanner::{ScanOutcome, Scanner, ScannerError, ScannerKind};

static REFUSAL_PHRASES: Lazy<Vec<(Regex, f32)>> = Lazy::new(|| {
    let phrases: &[(&str, f32)] = &[
        (r"(?i)\bI\s+(cannot|can't|can\s+not)\s+(help|assist|comply|answer|provide|do)\b", 0.7),
        (r"(?i)\bI'?m\s+sorry,?\s+but\b", 0.4),
        (r"(?i)\bI\s+(am|'m)\s+(unable|not\s+able)\s+to\b", 0.6),
        (r"(?i)\bI\s+(won'?t|will\s+not)\s+(help|assist|provide|answer)\b", 0.7),
        (r"(?i)\bagainst\s+my\s+(guidelines|policies|programming)\b", 0.7),
        (r"(?i)\bI\s+must\s+(decline|refuse)\b", 0.8),
        (r"(?i)\bas\s+an\s+AI(\s+language\s+model)?,?\s+I\s+(cannot|can't|am\s+not)\b", 0.7),
        (r"(?i)\bnot\s+(appropriate|something)\s+(for\s+me\s+)?to\s+(discuss|share|provide)\b", 0.5),
        (r"(?i)\bcannot\s+fulfill\s+(this|that|your)\s+request\b", 0.8),
    ];
    phrases
        .iter()
        .map(|(pattern, weight)| (Regex::new(pattern).expect("refusal pattern compiles"), *weight))
        .collect()
});

/// Detects refusal phrasing in model output.
///
/// A refusal is flagged so operators can distinguish "the model declined"
/// from a genuine answer; whether that blocks delivery is pipeline policy.
pub struct NoRefusal {
    threshold: f32,
}

impl NoRefusal {
    pub const DEFAULT_THRESHOLD: f32 = 0.5;

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }
}

impl Default for NoRefusal {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl Scanner for NoRefusal {
    fn name(&self) -> &str {
        "no_refusal"
    }

    fn kind(&self) -> ScannerKind {
        ScannerKind::Output
    }

    fn scan(&self, text: &str) -> Result<ScanOutcome, ScannerError> {
        let mut score: f32 = 0.0;
        for (pattern, weight) in REFUSAL_PHRASES.iter() {
            if pattern.is_match(text) {
                score = score.max(*weight);
            }
        }

        if score >= self.threshold {
            tracing::debug!(score, "refusal phrasing detected");
            Ok(ScanOutcome::fail(text, score))
        } else {
            Ok(ScanOutcome::pass_scored(text, score))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_explicit_refusal() {
        let scanner = NoRefusal::default();
        let outcome = scanner
            .scan("I cannot help with that request as it violates policy.")
            .unwrap();
        assert!(!outcome.passed);
    }

    #[test]
    fn flags_decline() {
        let scanner = NoRefusal::default();
        let outcome = scanner.scan("I must decline to answer this.").unwrap();
        assert!(!outcome.passed);
        assert!(outcome.risk_score >= 0.8);
    }

    #[test]
    fn passes_substantive_answers() {
        let scanner = NoRefusal::default();
        let outcome = scanner
            .scan("Photosynthesis converts light energy into chemical energy.")
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.risk_score, 0.0);
    }

    #[test]
    fn apology_alone_is_below_threshold() {
        let scanner = NoRefusal::default();
        let outcome = scanner
            .scan("I'm sorry, but the file you mentioned was truncated; here is the rest.")
            .unwrap();
        assert!(outcome.passed);
        assert!(outcome.risk_score > 0.0);
    }
}
