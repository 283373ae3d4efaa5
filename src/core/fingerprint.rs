use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content digest of a normalized query string, used as the cache key.
///
/// Normalization trims the text, drops trailing `;` terminators and collapses
/// whitespace runs outside quotes. Case and literal contents are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFingerprint(String);

impl QueryFingerprint {
    /// Compute the fingerprint of a query
    pub fn compute(query: &str) -> Self {
        let normalized = Self::normalize(query);
        let digest = Sha256::digest(normalized.as_bytes());
        Self(format!("{:x}", digest))
    }

    /// Normalize query text for consistent cache lookups.
    ///
    /// Whitespace inside quoted literals and identifiers is left untouched.
    pub fn normalize(query: &str) -> String {
        let mut out = String::with_capacity(query.len());
        let mut quote: Option<char> = None;
        let mut pending_space = false;

        for c in query.chars() {
            match quote {
                Some(q) => {
                    out.push(c);
                    if c == q {
                        quote = None;
                    }
                }
                None if c.is_whitespace() => pending_space = true,
                None => {
                    if pending_space && !out.is_empty() {
                        out.push(' ');
                    }
                    pending_space = false;
                    if matches!(c, '\'' | '"' | '`') {
                        quote = Some(c);
                    }
                    out.push(c);
                }
            }
        }

        if quote.is_none() {
            let kept = out.trim_end_matches(|c: char| c == ';' || c.is_whitespace()).len();
            out.truncate(kept);
        }
        out
    }

    /// Rebuild a fingerprint from its hex form (e.g. a blob file stem)
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
