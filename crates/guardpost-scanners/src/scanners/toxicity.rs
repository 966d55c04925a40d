//! Toxic-language classifier.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::scanner::{ScanOutcome, Scanner, ScannerError, ScannerKind};

/// Weighted lexicon; weights accumulate and saturate at 1.0.
static TOXIC_TERMS: Lazy<Vec<(Regex, f32)>> = Lazy::new(|| {
    let terms: &[(&str, f32)] = &[
        (r"(?i)\bkill\s+yourself\b", 1.0),
        (r"(?i)\bgo\s+die\b", 0.9),
        (r"(?i)\bi\s+hate\s+you\b", 0.6),
        (r"(?i)\byou\s+(are|'re)\s+(an?\s+)?(idiot|moron|imbecile)\b", 0.7),
        (r"(?i)\b(idiot|moron|imbecile)\b", 0.4),
        (r"(?i)\bstupid\b", 0.3),
        (r"(?i)\bworthless\b", 0.4),
        (r"(?i)\bpathetic\b", 0.35),
        (r"(?i)\bshut\s+up\b", 0.35),
        (r"(?i)\bnobody\s+(likes|wants)\s+you\b", 0.6),
        (r"(?i)\bpiece\s+of\s+(trash|garbage)\b", 0.6),
        (r"(?i)\bdisgusting\s+(person|human)\b", 0.5),
        (r"(?i)\bloser\b", 0.3),
        (r"(?i)\bscum\b", 0.5),
    ];
    terms
        .iter()
        .map(|(pattern, weight)| (Regex::new(pattern).expect("toxicity pattern compiles"), *weight))
        .collect()
});

/// Scores hostile or abusive language against a configurable threshold.
pub struct Toxicity {
    threshold: f32,
}

impl Toxicity {
    pub const DEFAULT_THRESHOLD: f32 = 0.5;

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }
}

impl Default for Toxicity {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl Scanner for Toxicity {
    fn name(&self) -> &str {
        "toxicity"
    }

    fn kind(&self) -> ScannerKind {
        ScannerKind::Both
    }

    fn scan(&self, text: &str) -> Result<ScanOutcome, ScannerError> {
        let mut score: f32 = 0.0;
        for (pattern, weight) in TOXIC_TERMS.iter() {
            if pattern.is_match(text) {
                score += weight;
            }
        }
        let score = score.min(1.0);

        if score >= self.threshold && score > 0.0 {
            tracing::debug!(score, "toxic language detected");
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
    fn flags_abusive_text() {
        let scanner = Toxicity::default();
        let outcome = scanner.scan("you are an idiot and nobody likes you").unwrap();
        assert!(!outcome.passed);
        assert!(outcome.risk_score >= 0.5);
    }

    #[test]
    fn mild_language_scores_below_default_threshold() {
        let scanner = Toxicity::default();
        let outcome = scanner.scan("that was a stupid mistake").unwrap();
        assert!(outcome.passed);
        assert!(outcome.risk_score < 0.5);
    }

    #[test]
    fn passes_neutral_text() {
        let scanner = Toxicity::default();
        let outcome = scanner.scan("the weather is lovely today").unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.risk_score, 0.0);
    }

    #[test]
    fn strict_threshold_blocks_mild_language() {
        let scanner = Toxicity::new(0.2);
        let outcome = scanner.scan("that was a stupid mistake").unwrap();
        assert!(!outcome.passed);
    }
}
