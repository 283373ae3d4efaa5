use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Typed scalar stored in a result cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// One result record: column name -> value
pub type Row = BTreeMap<String, Value>;

/// Shared failure taxonomy placed in [`QueryResult::error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Query text rejected by the safety validator; never executed
    Validation,
    /// Malformed query or syntax error reported by the backend
    BadRequest,
    AccessDenied,
    NotFound,
    /// Wall-clock limit or caller deadline exceeded
    Timeout,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Error attached to a failed [`QueryResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Execution metadata carried alongside the rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Fingerprint of the executed query text
    pub fingerprint: String,

    /// When the backend call completed
    pub executed_at: DateTime<Utc>,

    /// Backend identity (e.g. "sqlite", "warehouse")
    pub backend: String,

    /// True when rows were truncated by the row or byte ceiling
    #[serde(default)]
    pub limited: bool,

    /// Validator violations, populated when the query was rejected
    #[serde(default)]
    pub violations: Vec<String>,

    /// Free-form annotations added by upper layers
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ResultMetadata {
    pub fn new(fingerprint: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            executed_at: Utc::now(),
            backend: backend.into(),
            limited: false,
            violations: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,

    /// Column names in backend order
    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default)]
    pub rows: Vec<Row>,

    pub row_count: usize,

    pub execution_time: Duration,

    #[serde(default)]
    pub error: Option<QueryError>,

    #[serde(default)]
    pub bytes_processed: Option<u64>,

    #[serde(default)]
    pub bytes_billed: Option<u64>,

    #[serde(default)]
    pub cache_hit: bool,

    pub metadata: ResultMetadata,
}

impl QueryResult {
    /// Successful result
    pub fn success(
        columns: Vec<String>,
        rows: Vec<Row>,
        execution_time: Duration,
        metadata: ResultMetadata,
    ) -> Self {
        Self {
            success: true,
            columns,
            row_count: rows.len(),
            rows,
            execution_time,
            error: None,
            bytes_processed: None,
            bytes_billed: None,
            cache_hit: false,
            metadata,
        }
    }

    /// Failed result carrying an error of the shared taxonomy
    pub fn failure(error: QueryError, execution_time: Duration, metadata: ResultMetadata) -> Self {
        Self {
            success: false,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time,
            error: Some(error),
            bytes_processed: None,
            bytes_billed: None,
            cache_hit: false,
            metadata,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_limited(&self) -> bool {
        self.metadata.limited
    }

    /// Get display string for logging
    pub fn display(&self) -> String {
        match &self.error {
            None => format!(
                "{} rows in {:.2}ms [{}]{}{}",
                self.row_count,
                self.execution_time.as_secs_f64() * 1000.0,
                self.metadata.backend,
                if self.cache_hit { " (cached)" } else { "" },
                if self.metadata.limited { " (limited)" } else { "" },
            ),
            Some(err) => format!("failed [{}]: {}", self.metadata.backend, err),
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
