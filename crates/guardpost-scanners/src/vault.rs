//! Placeholder vault for anonymization round-trips.
//!
//! The anonymize scanner replaces detected PII with opaque placeholders and
//! records the mapping here so the original values can be restored later
//! (e.g. when relaying a model response back to a trusted caller).

use std::sync::Arc;

use parking_lot::Mutex;

/// Thread-safe placeholder-to-original mapping.
///
/// Cloning shares the underlying store. The lock is held only across single
/// vector operations.
#[derive(Debug, Clone, Default)]
pub struct Vault {
    entries: Arc<Mutex<Vec<(String, String)>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `placeholder` stands in for `original`.
    pub fn store(&self, placeholder: impl Into<String>, original: impl Into<String>) {
        self.entries
            .lock()
            .push((placeholder.into(), original.into()));
    }

    /// Replace every known placeholder in `text` with its original value.
    pub fn restore(&self, text: &str) -> String {
        let entries = self.entries.lock();
        let mut restored = text.to_string();
        for (placeholder, original) in entries.iter() {
            if restored.contains(placeholder.as_str()) {
                restored = restored.replace(placeholder.as_str(), original);
            }
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop all recorded mappings.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_placeholders() {
        let vault = Vault::new();
        vault.store("[REDACTED_EMAIL_1]", "alice@example.com");
        vault.store("[REDACTED_PHONE_1]", "+1-555-0100");

        let text = "contact [REDACTED_EMAIL_1] or [REDACTED_PHONE_1]";
        assert_eq!(
            vault.restore(text),
            "contact alice@example.com or +1-555-0100"
        );
    }

    #[test]
    fn clones_share_entries() {
        let vault = Vault::new();
        let clone = vault.clone();
        clone.store("[X]", "y");
        assert_eq!(vault.len(), 1);
    }
}
