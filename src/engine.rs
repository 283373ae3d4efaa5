use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backends::{QueryBackend, SqliteBackend, TableSchema, WarehouseBackend};
use crate::cache::{CacheStats, DiskCache, ResultCache};
use crate::config::{BackendConfig, EngineConfig};
use crate::core::QueryResult;
use crate::error::{BackendError, QueryEngineError, Result};
use crate::executor::{ExecuteOptions, QueryExecutor};
use crate::generator::{EntityHints, FallbackGenerator, GeneratedQuery, TableCatalog};
use crate::metrics::{MetricsLog, MetricsSnapshot};
use crate::validation::SafetyValidator;

/// Query text produced upstream, with the producer's confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub sql: String,
    pub confidence: f64,
}

/// Where the executed query text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    Primary,
    Fallback,
}

/// One question, with an optional pre-generated candidate
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    pub candidate: Option<CandidateQuery>,
    pub hints: Option<EntityHints>,
    pub options: ExecuteOptions,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_candidate(mut self, sql: impl Into<String>, confidence: f64) -> Self {
        self.candidate = Some(CandidateQuery {
            sql: sql.into(),
            confidence,
        });
        self
    }

    pub fn with_hints(mut self, hints: EntityHints) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub result: QueryResult,
    /// Query text that was executed
    pub query_text: String,
    pub source: QuerySource,
    /// Set when the fallback generator produced the query
    pub generated: Option<GeneratedQuery>,
    /// Why the candidate was not used
    pub fallback_reason: Option<String>,
    /// Validator violations of a rejected candidate
    pub rejected_violations: Vec<String>,
}

/// Main query pipeline orchestrator
pub struct QueryEngine {
    executor: QueryExecutor,
    generator: FallbackGenerator,
    min_candidate_confidence: f64,
}

impl QueryEngine {
    pub fn new(executor: QueryExecutor, generator: FallbackGenerator, min_candidate_confidence: f64) -> Self {
        Self {
            executor,
            generator,
            min_candidate_confidence,
        }
    }

    /// Build backend, cache and generator from configuration.
    ///
    /// Fails when the backend is unreachable. A cache directory that cannot
    /// be opened only disables caching.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let (backend, qualifier): (Arc<dyn QueryBackend>, Option<String>) = match &config.backend {
            BackendConfig::Sqlite { path } => (Arc::new(SqliteBackend::new(path.clone())), None),
            BackendConfig::Warehouse(settings) => (
                Arc::new(WarehouseBackend::new(settings.clone())?),
                Some(settings.qualifier()),
            ),
        };

        backend
            .health_check()
            .await
            .map_err(|e| QueryEngineError::BackendUnavailable {
                backend: backend.name().to_string(),
                message: e.to_string(),
            })?;
        tracing::info!("✅ Backend '{}' reachable", backend.name());

        let cache: Option<Arc<dyn ResultCache>> = if config.cache.enabled {
            match DiskCache::open(&config.cache.directory, config.cache.ttl(), config.cache.capacity).await {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    tracing::warn!("⚠️ Result cache unavailable, running without it: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let dialect = backend.dialect();
        let executor = QueryExecutor::new(
            backend,
            cache,
            SafetyValidator::new(dialect, config.validation.max_nesting_depth),
            Arc::new(MetricsLog::new(config.metrics.window)),
            config.limits.to_limits(),
        );
        let generator = FallbackGenerator::new(
            TableCatalog::new(dialect, config.generator.tables.clone(), qualifier),
            config.generator.vocabulary.clone(),
        );

        tracing::info!(
            "✅ Query engine ready (dialect={}, cache={})",
            dialect,
            if executor.cache().is_some() { "on" } else { "off" }
        );
        Ok(Self::new(executor, generator, config.min_candidate_confidence))
    }

    /// Answer one question
    pub async fn ask(&self, request: QueryRequest) -> QueryResponse {
        let QueryRequest {
            question,
            candidate,
            hints,
            options,
        } = request;

        let mut fallback_reason = None;
        let mut rejected_violations = Vec::new();

        match candidate {
            Some(candidate) if candidate.confidence < self.min_candidate_confidence => {
                fallback_reason = Some(format!(
                    "candidate confidence {:.2} below threshold {:.2}",
                    candidate.confidence, self.min_candidate_confidence
                ));
            }
            Some(candidate) => {
                let verdict = self.executor.validator().validate(&candidate.sql);
                if verdict.is_valid {
                    let mut result = self.executor.execute(&candidate.sql, &options).await;
                    result
                        .metadata
                        .annotations
                        .insert("source".to_string(), "primary".to_string());
                    return QueryResponse {
                        result,
                        query_text: candidate.sql,
                        source: QuerySource::Primary,
                        generated: None,
                        fallback_reason: None,
                        rejected_violations,
                    };
                }
                tracing::warn!(
                    "⚠️ Candidate rejected, using fallback: {}",
                    verdict.violations.join("; ")
                );
                fallback_reason = Some("candidate rejected by safety validator".to_string());
                rejected_violations = verdict.violations;
            }
            None => {}
        }

        let generated = self.generator.generate(&question, hints.as_ref());
        let mut result = self.executor.execute(&generated.query_text, &options).await;

        let annotations = &mut result.metadata.annotations;
        annotations.insert("source".to_string(), "fallback".to_string());
        annotations.insert(
            "pattern".to_string(),
            generated.pattern_matched.clone().unwrap_or_else(|| "generic".to_string()),
        );
        annotations.insert("confidence".to_string(), format!("{:.2}", generated.confidence));
        if let Some(reason) = &fallback_reason {
            annotations.insert("fallback_reason".to_string(), reason.clone());
        }

        QueryResponse {
            result,
            query_text: generated.query_text.clone(),
            source: QuerySource::Fallback,
            generated: Some(generated),
            fallback_reason,
            rejected_violations,
        }
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn generator(&self) -> &FallbackGenerator {
        &self.generator
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.executor.metrics().snapshot()
    }

    pub async fn describe_schema(&self, table: &str) -> std::result::Result<TableSchema, BackendError> {
        self.executor.describe_schema(table).await
    }

    pub async fn list_tables(&self) -> std::result::Result<Vec<String>, BackendError> {
        self.executor.list_tables().await
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> Option<CacheStats> {
        let cache = self.executor.cache()?;
        match cache.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!("⚠️ Cache stats unavailable: {}", e);
                None
            }
        }
    }

    /// Drop expired cache entries, returning how many were removed
    pub async fn maintain_cache(&self) -> usize {
        let Some(cache) = self.executor.cache() else {
            return 0;
        };
        match cache.invalidate_expired().await {
            Ok(removed) => {
                tracing::debug!("Cache maintenance removed {} entries", removed);
                removed
            }
            Err(e) => {
                tracing::warn!("⚠️ Cache maintenance failed: {}", e);
                0
            }
        }
    }

    /// Persist the cache index
    pub async fn shutdown(&self) {
        if let Some(cache) = self.executor.cache() {
            if let Err(e) = cache.flush().await {
                tracing::warn!("⚠️ Cache flush on shutdown failed: {}", e);
            }
        }
        tracing::info!("👋 Query engine stopped");
    }
}
