//! # Pricing Query Engine
//!
//! Query execution layer between a natural-language query generator and a
//! pricing data store:
//! - Content-addressed result cache persisted to disk, with TTL expiry
//! - Keyword-based safety validation of query text
//! - Deterministic rule-based fallback generator
//! - Instrumented execution against SQLite or a BigQuery-style warehouse
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pricing_query_engine::{EngineConfig, QueryEngine, QueryRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load("engine.yaml").await?;
//!     let engine = QueryEngine::from_config(&config).await?;
//!
//!     let response = engine
//!         .ask(QueryRequest::new("What is the current price for identifier '123456'?"))
//!         .await;
//!
//!     println!("{} via {:?}", response.result.display(), response.source);
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backends;
pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod executor;
pub mod generator;
pub mod metrics;
pub mod validation;

// Re-export primary types
pub use backends::{QueryBackend, SqliteBackend, TableSchema, WarehouseBackend};
pub use cache::{DiskCache, ResultCache};
pub use config::EngineConfig;
pub use core::{ErrorKind, QueryFingerprint, QueryResult, Value};
pub use engine::{CandidateQuery, QueryEngine, QueryRequest, QueryResponse, QuerySource};
pub use error::{BackendError, QueryEngineError, Result};
pub use executor::{ExecuteOptions, QueryExecutor};
pub use generator::{EntityHints, FallbackGenerator, GeneratedQuery};
pub use metrics::{MetricsLog, MetricsSnapshot};
pub use validation::{SafetyValidator, ValidationVerdict};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
