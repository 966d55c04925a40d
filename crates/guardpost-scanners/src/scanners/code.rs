//! Source-code detector for configured languages.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::scanner::{ScanOutcome, Scanner, ScannerError, ScannerKind};

struct LanguageProfile {
    name: &'static str,
    indicators: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("code indicator compiles"))
        .collect()
}

static LANGUAGE_PROFILES: Lazy<Vec<LanguageProfile>> = Lazy::new(|| {
    vec![
        LanguageProfile {
            name: "Python",
            indicators: compile(&[
                r"(?m)^\s*def\s+\w+\s*\(",
                r"(?m)^\s*import\s+\w+",
                r"(?m)^\s*from\s+\w+\s+import\s+",
                r"(?m)^\s*class\s+\w+.*:",
                r"\bprint\s*\(",
                r"\bif\s+__name__\s*==",
            ]),
        },
        LanguageProfile {
            name: "C#",
            indicators: compile(&[
                r"\busing\s+System\b",
                r"(?m)^\s*namespace\s+\w+",
                r"\bConsole\.Write(Line)?\s*\(",
                r"\bpublic\s+(static\s+)?(void|class|int|string)\b",
            ]),
        },
        LanguageProfile {
            name: "C++",
            indicators: compile(&[
                r"#include\s*<(iostream|vector|string|map)>",
                r"\bstd::\w+",
                r"\bcout\s*<<",
                r"\btemplate\s*<",
            ]),
        },
        LanguageProfile {
            name: "C",
            indicators: compile(&[
                r"#include\s*<(stdio|stdlib|string)\.h>",
                r"\bint\s+main\s*\(",
                r"\bprintf\s*\(",
                r"\bmalloc\s*\(",
            ]),
        },
    ]
});

/// Flags text that looks like source code in one of the configured
/// languages. Whether a hit blocks is the pipeline's decision; the scanner
/// itself fails on confident detections only.
pub struct CodeScanner {
    languages: Vec<String>,
    kind: ScannerKind,
}

impl CodeScanner {
    /// Languages flagged when none are configured.
    pub const DEFAULT_LANGUAGES: &'static [&'static str] = &["Python", "C#", "C++", "C"];

    pub fn new(languages: Vec<String>, kind: ScannerKind) -> Self {
        Self { languages, kind }
    }

    pub fn with_defaults(kind: ScannerKind) -> Self {
        Self::new(
            Self::DEFAULT_LANGUAGES.iter().map(|s| s.to_string()).collect(),
            kind,
        )
    }
}

impl Scanner for CodeScanner {
    fn name(&self) -> &str {
        "code"
    }

    fn kind(&self) -> ScannerKind {
        self.kind
    }

    fn scan(&self, text: &str) -> Result<ScanOutcome, ScannerError> {
        let mut best_score: f32 = 0.0;
        let mut detected: Option<&str> = None;

        for profile in LANGUAGE_PROFILES.iter() {
            if !self.languages.iter().any(|l| l.eq_ignore_ascii_case(profile.name)) {
                continue;
            }
            let hits = profile
                .indicators
                .iter()
                .filter(|indicator| indicator.is_match(text))
                .count();
            // One indicator is circumstantial; two or more is a detection.
            let score = match hits {
                0 => 0.0,
                1 => 0.4,
                _ => 0.9,
            };
            if score > best_score {
                best_score = score;
                detected = Some(profile.name);
            }
        }

        if best_score >= 0.5 {
            tracing::debug!(language = detected, score = best_score, "source code detected");
            Ok(ScanOutcome::fail(text, best_score))
        } else {
            Ok(ScanOutcome::pass_scored(text, best_score))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_python() {
        let scanner = CodeScanner::with_defaults(ScannerKind::Input);
        let outcome = scanner
            .scan("import os\n\ndef main():\n    print('hi')\n")
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.risk_score >= 0.5);
    }

    #[test]
    fn detects_c() {
        let scanner = CodeScanner::with_defaults(ScannerKind::Output);
        let outcome = scanner
            .scan("#include <stdio.h>\nint main() { printf(\"x\"); }")
            .unwrap();
        assert!(!outcome.passed);
    }

    #[test]
    fn single_indicator_is_not_a_detection() {
        let scanner = CodeScanner::with_defaults(ScannerKind::Input);
        let outcome = scanner.scan("you can print(x) to debug").unwrap();
        assert!(outcome.passed);
        assert!(outcome.risk_score > 0.0);
    }

    #[test]
    fn ignores_unconfigured_languages() {
        let scanner = CodeScanner::new(vec!["C#".to_string()], ScannerKind::Input);
        let outcome = scanner
            .scan("import os\n\ndef main():\n    print('hi')\n")
            .unwrap();
        assert!(outcome.passed);
    }
}
