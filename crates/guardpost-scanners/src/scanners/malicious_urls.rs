//! Classifier over URLs found in model output.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::scanner::{ScanOutcome, Scanner, ScannerError, ScannerKind};

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("url pattern compiles"));

const SUSPICIOUS_TLDS: &[&str] = &[
    ".tk", ".ml", ".ga", ".cf", ".gq", ".zip", ".mov", ".country", ".stream",
];

const SHORTENER_HOSTS: &[&str] = &[
    "bit.ly", "tinyurl.com", "goo.gl", "t.co", "is.gd", "ow.ly", "cutt.ly",
];

static IP_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://(?:\d{1,3}\.){3}\d{1,3}").expect("ip host compiles"));

/// Scores URLs on phishing/malware heuristics; the riskiest URL decides.
pub struct MaliciousUrls {
    threshold: f32,
}

impl MaliciousUrls {
    pub const DEFAULT_THRESHOLD: f32 = 0.5;

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    fn score_url(url: &str) -> f32 {
        let lower = url.to_lowercase();
        let mut score: f32 = 0.0;

        if IP_HOST.is_match(&lower) {
            score += 0.5;
        }
        if lower.contains('@') {
            // Credentials or obfuscated authority in the URL.
            score += 0.5;
        }
        if lower.contains("xn--") {
            score += 0.4;
        }
        let host = lower
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .split(['/', '?', '#'])
            .next()
            .unwrap_or("");
        if SUSPICIOUS_TLDS.iter().any(|tld| host.ends_with(tld)) {
            score += 0.4;
        }
        if SHORTENER_HOSTS.iter().any(|s| host == *s || host.ends_with(&format!(".{s}"))) {
            score += 0.3;
        }
        if host.matches('.').count() > 3 {
            score += 0.2;
        }
        if lower.contains("phish") || lower.contains("malware") || lower.contains("trojan") {
            score += 0.6;
        }

        score.min(1.0)
    }
}

impl Default for MaliciousUrls {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl Scanner for MaliciousUrls {
    fn name(&self) -> &str {
        "malicious_urls"
    }

    fn kind(&self) -> ScannerKind {
        ScannerKind::Output
    }

    fn scan(&self, text: &str) -> Result<ScanOutcome, ScannerError> {
        let mut worst: f32 = 0.0;
        for url in URL_PATTERN.find_iter(text) {
            let score = Self::score_url(url.as_str());
            if score > worst {
                worst = score;
            }
        }

        if worst >= self.threshold && worst > 0.0 {
            tracing::debug!(score = worst, "suspicious URL detected");
            Ok(ScanOutcome::fail(text, worst))
        } else {
            Ok(ScanOutcome::pass_scored(text, worst))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_ip_host_with_credentials() {
        let scanner = MaliciousUrls::default();
        let outcome = scanner
            .scan("download from http://admin:pw@192.168.1.50/setup.exe now")
            .unwrap();
        assert!(!outcome.passed);
    }

    #[test]
    fn flags_suspicious_tld() {
        let scanner = MaliciousUrls::default();
        let outcome = scanner
            .scan("visit https://free-prizes.tk/claim?phish=1")
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.risk_score >= 0.5);
    }

    #[test]
    fn passes_reputable_urls() {
        let scanner = MaliciousUrls::default();
        let outcome = scanner
            .scan("see the docs at https://docs.rs/tokio for details")
            .unwrap();
        assert!(outcome.passed);
    }

    #[test]
    fn text_without_urls_scores_zero() {
        let scanner = MaliciousUrls::default();
        let outcome = scanner.scan("no links in this text").unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.risk_score, 0.0);
    }
}
