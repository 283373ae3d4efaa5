//! Static safety screening of query text.
//!
//! Keyword and pattern based, no grammar: a forbidden word inside a string
//! literal is still rejected.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::Dialect;

/// Keywords a retrieval statement may start with
const RETRIEVAL_KEYWORDS: &[&str] = &["SELECT", "WITH"];

/// Mutating or administrative statements rejected in every dialect
const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "MERGE", "REPLACE",
    "GRANT", "REVOKE", "EXEC", "EXECUTE", "CALL",
];

const SQLITE_KEYWORDS: &[&str] = &["ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX"];

const BIGQUERY_KEYWORDS: &[&str] = &["EXPORT", "DECLARE", "SET", "BEGIN"];

static LEADING_TRIVIA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(?:\s+|--[^\n]*(?:\n|$)|/\*.*?\*/)*").unwrap());

static LEADING_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z_]+)").unwrap());

static SQLITE_FORBIDDEN: Lazy<Regex> =
    Lazy::new(|| keyword_regex(&[MUTATING_KEYWORDS, SQLITE_KEYWORDS].concat()));

static BIGQUERY_FORBIDDEN: Lazy<Regex> =
    Lazy::new(|| keyword_regex(&[MUTATING_KEYWORDS, BIGQUERY_KEYWORDS].concat()));

static TERMINATOR_THEN_MUTATION: Lazy<Regex> = Lazy::new(|| {
    let all = [MUTATING_KEYWORDS, SQLITE_KEYWORDS, BIGQUERY_KEYWORDS].concat();
    Regex::new(&format!(r"(?i);\s*({})\b", all.join("|"))).unwrap()
});

static UNION_SELECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bUNION\s+(?:ALL\s+|DISTINCT\s+)?\(?\s*SELECT\b").unwrap());

static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--").unwrap());

static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\*").unwrap());

fn keyword_regex(keywords: &[&str]) -> Regex {
    Regex::new(&format!(r"(?i)\b({})\b", keywords.join("|"))).unwrap()
}

/// Outcome of one validation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub violations: Vec<String>,
}

impl ValidationVerdict {
    fn from_violations(violations: Vec<String>) -> Self {
        Self {
            is_valid: violations.is_empty(),
            violations,
        }
    }
}

/// Rejects destructive, administrative and injection-shaped query text
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    dialect: Dialect,
    max_nesting_depth: usize,
}

impl SafetyValidator {
    pub fn new(dialect: Dialect, max_nesting_depth: usize) -> Self {
        Self {
            dialect,
            max_nesting_depth,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Run every check and collect one violation per failed check
    pub fn validate(&self, query: &str) -> ValidationVerdict {
        let mut violations = Vec::new();

        let body = strip_leading_trivia(query);
        if body.trim().is_empty() {
            violations.push("empty query".to_string());
            return ValidationVerdict::from_violations(violations);
        }

        self.check_statement_shape(body, &mut violations);
        self.check_forbidden_keywords(query, &mut violations);
        self.check_injection_patterns(body, &mut violations);
        self.check_nesting(body, &mut violations);

        if !violations.is_empty() {
            tracing::debug!("Query rejected: {}", violations.join("; "));
        }
        ValidationVerdict::from_violations(violations)
    }

    fn check_statement_shape(&self, body: &str, violations: &mut Vec<String>) {
        let leading = LEADING_WORD
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_uppercase());

        match leading {
            Some(word) if RETRIEVAL_KEYWORDS.contains(&word.as_str()) => {}
            Some(word) if self.forbidden().is_match(&word) => violations.push(format!(
                "statement begins with mutating or administrative keyword {}",
                word
            )),
            Some(word) => violations.push(format!(
                "statement must begin with SELECT or WITH, found {}",
                word
            )),
            None => violations.push("statement must begin with SELECT or WITH".to_string()),
        }

        let trimmed = body.trim_end().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        if trimmed.contains(';') {
            violations.push("multiple statements are not allowed".to_string());
        }
    }

    fn check_forbidden_keywords(&self, query: &str, violations: &mut Vec<String>) {
        let mut found: Vec<String> = Vec::new();
        for m in self.forbidden().find_iter(query) {
            let word = m.as_str().to_ascii_uppercase();
            if !found.contains(&word) {
                found.push(word);
            }
        }

        if !found.is_empty() {
            violations.push(format!("forbidden keyword(s): {}", found.join(", ")));
        }
    }

    fn check_injection_patterns(&self, body: &str, violations: &mut Vec<String>) {
        if let Some(c) = TERMINATOR_THEN_MUTATION.captures(body) {
            violations.push(format!(
                "injection pattern: statement terminator followed by {}",
                c[1].to_ascii_uppercase()
            ));
        }

        if UNION_SELECT.is_match(body) {
            violations.push("injection pattern: UNION SELECT appends a second result set".to_string());
        }

        let hash_comment = self.dialect == Dialect::BigQuery && body.contains('#');
        if LINE_COMMENT.is_match(body) || hash_comment {
            violations.push("injection pattern: comment marker after statement body".to_string());
        }

        if BLOCK_COMMENT.is_match(body) {
            violations.push("injection pattern: block comment inside statement".to_string());
        }
    }

    fn check_nesting(&self, body: &str, violations: &mut Vec<String>) {
        let mut depth: i64 = 0;
        let mut max_depth: i64 = 0;
        let mut unbalanced = false;
        let mut in_string = false;

        for c in body.chars() {
            match c {
                '\'' => in_string = !in_string,
                '(' if !in_string => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                ')' if !in_string => {
                    depth -= 1;
                    if depth < 0 {
                        unbalanced = true;
                        depth = 0;
                    }
                }
                _ => {}
            }
        }

        if unbalanced || depth != 0 {
            violations.push("unbalanced parentheses".to_string());
        }
        if max_depth as usize > self.max_nesting_depth {
            violations.push(format!(
                "parenthesis nesting depth {} exceeds maximum of {}",
                max_depth, self.max_nesting_depth
            ));
        }
    }

    fn forbidden(&self) -> &'static Regex {
        match self.dialect {
            Dialect::Sqlite => &SQLITE_FORBIDDEN,
            Dialect::BigQuery => &BIGQUERY_FORBIDDEN,
        }
    }
}

fn strip_leading_trivia(query: &str) -> &str {
    match LEADING_TRIVIA.find(query) {
        Some(m) => &query[m.end()..],
        None => query,
    }
}
