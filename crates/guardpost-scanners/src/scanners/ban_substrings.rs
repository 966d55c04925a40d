//! Deny-list of literal substrings.

use crate::scanner::{ScanOutcome, Scanner, ScannerError, ScannerKind};

/// Fails any text containing one of the configured substrings
/// (case-insensitive).
pub struct BanSubstrings {
    substrings: Vec<String>,
}

impl BanSubstrings {
    /// Substrings blocked when no deny list is configured.
    pub const DEFAULT_SUBSTRINGS: &'static [&'static str] = &["malicious", "dangerous"];

    pub fn new(substrings: Vec<String>) -> Self {
        Self {
            substrings: substrings
                .into_iter()
                .map(|s| s.to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

impl Default for BanSubstrings {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl Scanner for BanSubstrings {
    fn name(&self) -> &str {
        "ban_substrings"
    }

    fn kind(&self) -> ScannerKind {
        ScannerKind::Both
    }

    fn scan(&self, text: &str) -> Result<ScanOutcome, ScannerError> {
        let haystack = text.to_lowercase();
        let matched: Vec<&str> = self
            .substrings
            .iter()
            .filter(|needle| haystack.contains(needle.as_str()))
            .map(|s| s.as_str())
            .collect();

        if matched.is_empty() {
            Ok(ScanOutcome::pass(text))
        } else {
            tracing::debug!(substrings = ?matched, "banned substring match");
            Ok(ScanOutcome::fail(text, 1.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitively() {
        let scanner = BanSubstrings::new(vec!["Forbidden".to_string()]);
        let outcome = scanner.scan("this is FORBIDDEN content").unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.risk_score, 1.0);
    }

    #[test]
    fn passes_clean_text() {
        let scanner = BanSubstrings::default();
        let outcome = scanner.scan("a perfectly ordinary sentence").unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.risk_score, 0.0);
    }

    #[test]
    fn empty_deny_list_passes_everything() {
        let scanner = BanSubstrings::new(vec![]);
        assert!(scanner.scan("malicious").unwrap().passed);
    }
}
