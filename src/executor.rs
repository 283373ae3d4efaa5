use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backends::{BackendOutput, BackendRequest, QueryBackend, TableSchema};
use crate::cache::ResultCache;
use crate::core::{ErrorKind, QueryError, QueryFingerprint, QueryResult, ResultMetadata, Row};
use crate::error::BackendError;
use crate::metrics::{MetricRecord, MetricsLog};
use crate::validation::SafetyValidator;

/// Ceilings applied to every execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub max_rows: usize,
    /// Cumulative serialized row size before truncation
    pub max_result_bytes: Option<usize>,
    pub timeout: Duration,
    pub max_bytes_billed: Option<u64>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            max_result_bytes: Some(10 * 1024 * 1024),
            timeout: Duration::from_secs(30),
            max_bytes_billed: None,
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Skip the cache lookup (the result is still written through)
    pub bypass_cache: bool,
    /// Lower the configured row ceiling for this call
    pub max_rows: Option<usize>,
    /// Lower the configured timeout for this call
    pub timeout: Option<Duration>,
    /// Absolute point after which the caller no longer wants an answer
    pub deadline: Option<Instant>,
}

/// Runs validated query text against one backend, with caching and metrics
pub struct QueryExecutor {
    backend: Arc<dyn QueryBackend>,
    cache: Option<Arc<dyn ResultCache>>,
    validator: SafetyValidator,
    metrics: Arc<MetricsLog>,
    limits: ExecutionLimits,
}

impl QueryExecutor {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        cache: Option<Arc<dyn ResultCache>>,
        validator: SafetyValidator,
        metrics: Arc<MetricsLog>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            backend,
            cache,
            validator,
            metrics,
            limits,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueryBackend> {
        &self.backend
    }

    pub fn cache(&self) -> Option<&Arc<dyn ResultCache>> {
        self.cache.as_ref()
    }

    pub fn validator(&self) -> &SafetyValidator {
        &self.validator
    }

    pub fn metrics(&self) -> &Arc<MetricsLog> {
        &self.metrics
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Execute `query`; every failure is reported inside the result
    pub async fn execute(&self, query: &str, options: &ExecuteOptions) -> QueryResult {
        let start = Instant::now();
        let fingerprint = QueryFingerprint::compute(query);

        if !options.bypass_cache {
            if let Some(cached) = self.lookup(&fingerprint).await {
                self.record(&cached, start.elapsed(), true);
                return cached;
            }
        }

        let mut metadata = ResultMetadata::new(fingerprint.as_str(), self.backend.name());

        let verdict = self.validator.validate(query);
        if !verdict.is_valid {
            tracing::warn!(
                "⚠️ Query {} rejected: {}",
                fingerprint.short(),
                verdict.violations.join("; ")
            );
            let error = QueryError::new(
                ErrorKind::Validation,
                format!("query rejected by safety validator: {}", verdict.violations.join("; ")),
            );
            metadata.violations = verdict.violations;
            let result = QueryResult::failure(error, start.elapsed(), metadata);
            self.record(&result, start.elapsed(), false);
            return result;
        }

        let result = match self.effective_timeout(options) {
            Some(timeout) => self.dispatch(query, &fingerprint, options, timeout, start, metadata).await,
            None => QueryResult::failure(
                QueryError::new(ErrorKind::Timeout, "caller deadline passed before execution"),
                start.elapsed(),
                metadata,
            ),
        };

        if result.success {
            self.store(&fingerprint, &result).await;
        }
        self.record(&result, result.execution_time, false);
        tracing::debug!("Query {} -> {}", fingerprint.short(), result.display());
        result
    }

    /// Columns and sample rows from the backend's own catalog
    pub async fn describe_schema(&self, table: &str) -> Result<TableSchema, BackendError> {
        self.backend.describe_table(table).await
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, BackendError> {
        self.backend.list_tables().await
    }

    async fn dispatch(
        &self,
        query: &str,
        fingerprint: &QueryFingerprint,
        options: &ExecuteOptions,
        timeout: Duration,
        start: Instant,
        mut metadata: ResultMetadata,
    ) -> QueryResult {
        let max_rows = options
            .max_rows
            .map_or(self.limits.max_rows, |n| n.min(self.limits.max_rows));

        let request = BackendRequest {
            sql: query.to_string(),
            fetch_limit: Some(max_rows.saturating_add(1)),
            timeout,
            max_bytes_billed: self.limits.max_bytes_billed,
        };

        let outcome = tokio::time::timeout(timeout, self.backend.execute(&request)).await;
        metadata.executed_at = Utc::now();

        match outcome {
            Err(_) => {
                tracing::warn!(
                    "⏱️ Query {} timed out after {:?}",
                    fingerprint.short(),
                    timeout
                );
                QueryResult::failure(
                    QueryError::new(
                        ErrorKind::Timeout,
                        format!("query exceeded {} ms", timeout.as_millis()),
                    ),
                    start.elapsed(),
                    metadata,
                )
            }
            Ok(Err(err)) => QueryResult::failure(err.into(), start.elapsed(), metadata),
            Ok(Ok(output)) => {
                let BackendOutput {
                    columns,
                    rows,
                    bytes_processed,
                    bytes_billed,
                } = output;
                let (rows, limited) = apply_limits(rows, max_rows, self.limits.max_result_bytes);
                metadata.limited = limited;

                let mut result = QueryResult::success(columns, rows, start.elapsed(), metadata);
                result.bytes_processed = bytes_processed;
                result.bytes_billed = bytes_billed;
                result
            }
        }
    }

    /// `None` once the caller's deadline has passed
    fn effective_timeout(&self, options: &ExecuteOptions) -> Option<Duration> {
        let configured = options
            .timeout
            .map_or(self.limits.timeout, |t| t.min(self.limits.timeout));
        match options.deadline {
            Some(deadline) => {
                let remaining = deadline.checked_duration_since(Instant::now())?;
                if remaining.is_zero() {
                    None
                } else {
                    Some(configured.min(remaining))
                }
            }
            None => Some(configured),
        }
    }

    async fn lookup(&self, fingerprint: &QueryFingerprint) -> Option<QueryResult> {
        let cache = self.cache.as_ref()?;
        match cache.get(fingerprint).await {
            Ok(Some(entry)) => {
                tracing::debug!("Cache hit for {}", fingerprint.short());
                let mut result = entry.result;
                result.cache_hit = true;
                Some(result)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ Cache read failed for {}: {}", fingerprint.short(), e);
                None
            }
        }
    }

    async fn store(&self, fingerprint: &QueryFingerprint, result: &QueryResult) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(fingerprint, result).await {
                tracing::warn!("⚠️ Cache write failed for {}: {}", fingerprint.short(), e);
            }
        }
    }

    fn record(&self, result: &QueryResult, execution_time: Duration, cache_hit: bool) {
        self.metrics.record(MetricRecord {
            fingerprint: result.metadata.fingerprint.clone(),
            recorded_at: Utc::now(),
            execution_time,
            success: result.success,
            cache_hit,
            row_count: result.row_count,
            bytes_processed: if cache_hit { None } else { result.bytes_processed },
            error_kind: result.error_kind(),
        });
    }
}

/// Truncate to the row ceiling, then to the byte ceiling
fn apply_limits(mut rows: Vec<Row>, max_rows: usize, max_bytes: Option<usize>) -> (Vec<Row>, bool) {
    let mut limited = false;
    if rows.len() > max_rows {
        rows.truncate(max_rows);
        limited = true;
    }

    if let Some(max_bytes) = max_bytes {
        let mut total = 0usize;
        let keep = rows.iter().position(|row| {
            total += serde_json::to_vec(row).map(|b| b.len()).unwrap_or(0);
            total > max_bytes
        });
        if let Some(keep) = keep {
            rows.truncate(keep);
            limited = true;
        }
    }

    (rows, limited)
}
