// Secret Masking
// Redacts registered secret values from every emitted string

use std::sync::RwLock;

pub const DEFAULT_MASK: &str = "***";

/// Registry of secret values shared by everything that emits text during a run.
///
/// Values can be registered at any time (`::add-mask::`); masking applies to
/// all text emitted afterwards.
#[derive(Debug)]
pub struct SecretMasker {
    token: String,
    /// Longest first, so a secret containing another is masked whole
    values: RwLock<Vec<String>>,
}

impl SecretMasker {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            values: RwLock::new(Vec::new()),
        }
    }

    /// Create a masker preloaded with secret values
    pub fn with_secrets<'a>(
        token: impl Into<String>,
        secrets: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let masker = Self::new(token);
        for secret in secrets {
            masker.register(secret);
        }
        masker
    }

    /// Register a secret value. Multi-line values also register each line.
    pub fn register(&self, value: &str) {
        let mut candidates = vec![value.to_string()];
        if value.contains('\n') {
            candidates.extend(value.lines().map(|l| l.trim_end_matches('\r').to_string()));
        }

        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        for candidate in candidates {
            if candidate.trim().is_empty() || values.contains(&candidate) {
                continue;
            }
            values.push(candidate);
        }
        values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Replace every registered value in `text` with the mask token
    pub fn mask(&self, text: &str) -> String {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        let mut masked = text.to_string();
        for value in values.iter() {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), &self.token);
            }
        }
        masked
    }

    /// True when `text` contains any registered value
    pub fn contains_secret(&self, text: &str) -> bool {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.iter().any(|v| text.contains(v.as_str()))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SecretMasker {
    fn default() -> Self {
        Self::new(DEFAULT_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_substrings() {
        let masker = SecretMasker::with_secrets("***", ["hunter2"]);
        assert_eq!(masker.mask("password=hunter2;"), "password=***;");
        assert_eq!(masker.mask("hunter2hunter2"), "******");
        assert_eq!(masker.mask("nothing here"), "nothing here");
    }

    #[test]
    fn test_longest_secret_wins() {
        let masker = SecretMasker::with_secrets("***", ["abc", "abcdef"]);
        assert_eq!(masker.mask("xabcdefx"), "x***x");
    }

    #[test]
    fn test_blank_values_ignored() {
        let masker = SecretMasker::default();
        masker.register("");
        masker.register("   ");
        assert!(masker.is_empty());
        assert_eq!(masker.mask("a b"), "a b");
    }

    #[test]
    fn test_multiline_secret_lines_masked() {
        let masker = SecretMasker::default();
        masker.register("-----BEGIN KEY-----\nc2VjcmV0\n-----END KEY-----");
        assert_eq!(masker.mask("line: c2VjcmV0"), "line: ***");
        assert!(masker.contains_secret("-----END KEY-----"));
    }

    #[test]
    fn test_register_after_creation() {
        let masker = SecretMasker::new("[masked]");
        assert_eq!(masker.mask("token-123"), "token-123");
        masker.register("token-123");
        assert_eq!(masker.mask("token-123"), "[masked]");
    }
}
