pub mod sqlite;
pub mod warehouse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{Dialect, Row};
use crate::error::BackendError;

pub use sqlite::SqliteBackend;
pub use warehouse::{WarehouseBackend, WarehouseSettings};

/// One execution request handed to a backend
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub sql: String,
    /// Backend may stop reading after this many rows
    pub fetch_limit: Option<usize>,
    /// Effective wall-clock limit for this call
    pub timeout: Duration,
    /// Refuse to run queries that would bill more than this (warehouse only)
    pub max_bytes_billed: Option<u64>,
}

impl BackendRequest {
    pub fn new(sql: impl Into<String>, timeout: Duration) -> Self {
        Self {
            sql: sql.into(),
            fetch_limit: None,
            timeout,
            max_bytes_billed: None,
        }
    }
}

/// Raw rows plus cost accounting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub bytes_processed: Option<u64>,
    pub bytes_billed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Table description forwarded from the backend's own catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub sample_rows: Vec<Row>,
}

/// Number of sample rows included in a [`TableSchema`]
pub const SAMPLE_ROWS: usize = 5;

/// Trait for data stores a query can run against
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Run one retrieval statement
    async fn execute(&self, request: &BackendRequest) -> Result<BackendOutput, BackendError>;

    /// Columns and sample rows of one table
    async fn describe_table(&self, table: &str) -> Result<TableSchema, BackendError>;

    /// Tables visible to this backend
    async fn list_tables(&self) -> Result<Vec<String>, BackendError>;

    /// Backend identity recorded in result metadata
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Check the backend is reachable
    async fn health_check(&self) -> Result<(), BackendError>;
}
