//! PII anonymization with vault-backed round-trips.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::scanner::{ScanOutcome, Scanner, ScannerError, ScannerKind};
use crate::vault::Vault;

struct PiiPattern {
    label: &'static str,
    pattern: Regex,
}

static PII_PATTERNS: Lazy<Vec<PiiPattern>> = Lazy::new(|| {
    let patterns: &[(&str, &str)] = &[
        (
            "EMAIL",
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        ),
        (
            "PHONE",
            r"\b\+?\d{1,3}[-. ]?\(?\d{2,4}\)?[-. ]?\d{3,4}[-. ]?\d{3,4}\b",
        ),
        ("SSN", r"\b\d{3}-\d{2}-\d{4}\b"),
        ("IP", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
        (
            "CREDIT_CARD",
            r"\b\d{4}[- ]\d{4}[- ]\d{4}[- ]\d{4}\b",
        ),
    ];
    patterns
        .iter()
        .map(|(label, pattern)| PiiPattern {
            label,
            pattern: Regex::new(pattern).expect("pii pattern compiles"),
        })
        .collect()
});

/// Rewrites detected PII to opaque placeholders recorded in a [`Vault`].
///
/// The scan passes as long as the rewrite succeeds; downstream consumers can
/// restore the originals through the vault.
pub struct Anonymize {
    vault: Vault,
}

impl Anonymize {
    pub fn new(vault: Vault) -> Self {
        Self { vault }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }
}

impl Scanner for Anonymize {
    fn name(&self) -> &str {
        "anonymize"
    }

    fn kind(&self) -> ScannerKind {
        ScannerKind::Input
    }

    fn scan(&self, text: &str) -> Result<ScanOutcome, ScannerError> {
        let mut sanitized = text.to_string();
        let mut replaced = 0usize;

        for pii in PII_PATTERNS.iter() {
            // Replace left to right, numbering placeholders per entity so
            // distinct values stay distinguishable after the rewrite.
            loop {
                let found = match pii.pattern.find(&sanitized) {
                    Some(m) => (m.start(), m.end(), m.as_str().to_string()),
                    None => break,
                };
                replaced += 1;
                let placeholder = format!("[REDACTED_{}_{}]", pii.label, replaced);
                self.vault.store(placeholder.clone(), found.2);
                sanitized.replace_range(found.0..found.1, &placeholder);
            }
        }

        if replaced > 0 {
            tracing::debug!(entities = replaced, "anonymized PII entities");
        }
        Ok(ScanOutcome::pass(sanitized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymizes_email_and_restores_via_vault() {
        let vault = Vault::new();
        let scanner = Anonymize::new(vault.clone());
        let outcome = scanner.scan("reach me at alice@example.com today").unwrap();

        assert!(outcome.passed);
        assert!(!outcome.sanitized.contains("alice@example.com"));
        assert!(outcome.sanitized.contains("[REDACTED_EMAIL_1]"));
        assert_eq!(
            vault.restore(&outcome.sanitized),
            "reach me at alice@example.com today"
        );
    }

    #[test]
    fn distinct_entities_get_distinct_placeholders() {
        let scanner = Anonymize::new(Vault::new());
        let outcome = scanner
            .scan("mail a@x.com and b@y.org please")
            .unwrap();
        assert!(outcome.sanitized.contains("[REDACTED_EMAIL_1]"));
        assert!(outcome.sanitized.contains("[REDACTED_EMAIL_2]"));
    }

    #[test]
    fn anonymizes_ssn_and_ip() {
        let scanner = Anonymize::new(Vault::new());
        let outcome = scanner
            .scan("ssn 123-45-6789 from host 10.0.0.1")
            .unwrap();
        assert!(outcome.sanitized.contains("[REDACTED_SSN_"));
        assert!(outcome.sanitized.contains("[REDACTED_IP_"));
    }

    #[test]
    fn clean_text_is_untouched() {
        let scanner = Anonymize::new(Vault::new());
        let outcome = scanner.scan("no personal data here").unwrap();
        assert_eq!(outcome.sanitized, "no personal data here");
        assert!(scanner.vault().is_empty());
    }
}
