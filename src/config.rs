use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backends::WarehouseSettings;
use crate::error::{QueryEngineError, Result};
use crate::executor::ExecutionLimits;
use crate::generator::{TableNames, Vocabulary};

/// Engine configuration, usually loaded from YAML
///
/// ```yaml
/// backend:
///   type: sqlite
///   path: data/pricing.db
/// cache:
///   directory: .query_cache
///   ttl_secs: 3600
/// limits:
///   max_rows: 500
/// min_candidate_confidence: 0.6
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub validation: ValidationConfig,
    pub metrics: MetricsConfig,
    pub generator: GeneratorConfig,
    /// Candidates below this confidence go to the fallback generator
    pub min_candidate_confidence: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            cache: CacheConfig::default(),
            limits: LimitsConfig::default(),
            validation: ValidationConfig::default(),
            metrics: MetricsConfig::default(),
            generator: GeneratorConfig::default(),
            min_candidate_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Sqlite { path: PathBuf },
    Warehouse(WarehouseSettings),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Sqlite {
            path: PathBuf::from("pricing.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".query_cache"),
            ttl_secs: 3600,
            capacity: 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_rows: usize,
    pub max_result_bytes: Option<usize>,
    pub timeout_secs: u64,
    pub max_bytes_billed: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ExecutionLimits::default();
        Self {
            max_rows: limits.max_rows,
            max_result_bytes: limits.max_result_bytes,
            timeout_secs: limits.timeout.as_secs(),
            max_bytes_billed: limits.max_bytes_billed,
        }
    }
}

impl LimitsConfig {
    pub fn to_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_rows: self.max_rows,
            max_result_bytes: self.max_result_bytes,
            timeout: Duration::from_secs(self.timeout_secs),
            max_bytes_billed: self.max_bytes_billed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_nesting_depth: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { max_nesting_depth: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Records kept for `recent()` and the p95 figure
    pub window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: crate::metrics::DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub tables: TableNames,
    pub vocabulary: Vocabulary,
}

impl EngineConfig {
    /// Load and validate a YAML config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_yaml_str(&content)?;
        tracing::info!("✅ Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_candidate_confidence) {
            return Err(QueryEngineError::Config(format!(
                "min_candidate_confidence must be within [0, 1], got {}",
                self.min_candidate_confidence
            )));
        }
        if self.cache.enabled && (self.cache.capacity == 0 || self.cache.ttl_secs == 0) {
            return Err("cache capacity and ttl_secs must be positive".into());
        }
        if self.limits.max_rows == 0 {
            return Err("limits.max_rows must be positive".into());
        }
        if self.limits.timeout_secs == 0 {
            return Err("limits.timeout_secs must be positive".into());
        }
        if self.validation.max_nesting_depth == 0 {
            return Err("validation.max_nesting_depth must be positive".into());
        }
        if self.metrics.window == 0 {
            return Err("metrics.window must be positive".into());
        }

        match &self.backend {
            BackendConfig::Sqlite { path } if path.as_os_str().is_empty() => {
                Err("sqlite backend needs a path".into())
            }
            BackendConfig::Warehouse(settings)
                if settings.project.is_empty() || settings.dataset.is_empty() =>
            {
                Err("warehouse backend needs both project and dataset".into())
            }
            _ => Ok(()),
        }
    }
}
