pub mod entities;
pub mod fallback;
pub mod rules;

pub use entities::{Comparator, ExtractedEntities, SortOrder, Threshold, Vocabulary};
pub use fallback::FallbackGenerator;
pub use rules::{NumberRole, TableKey};

use crate::core::Dialect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Query text produced by the fallback generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub query_text: String,
    /// Pattern-match strength in [0, 1], not a correctness estimate
    pub confidence: f64,
    pub explanation: String,
    pub tables_referenced: BTreeSet<String>,
    /// Rule name, `bucket:<name>`, or None for the generic listing
    pub pattern_matched: Option<String>,
    /// Placeholders that fell back to their default value
    pub defaults_applied: Vec<String>,
}

/// Pre-extracted entities and an intent tag supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityHints {
    pub entities: ExtractedEntities,
    pub intent: Option<String>,
}

/// Physical table names behind the logical tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub pricing: String,
    pub price_history: String,
    pub sales: String,
    pub elasticity: String,
    pub competitors: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            pricing: "pricing_data".to_string(),
            price_history: "price_history".to_string(),
            sales: "sales_data".to_string(),
            elasticity: "elasticity_data".to_string(),
            competitors: "competitor_prices".to_string(),
        }
    }
}

impl TableNames {
    pub fn get(&self, key: TableKey) -> &str {
        match key {
            TableKey::Pricing => &self.pricing,
            TableKey::PriceHistory => &self.price_history,
            TableKey::Sales => &self.sales,
            TableKey::Elasticity => &self.elasticity,
            TableKey::Competitors => &self.competitors,
        }
    }
}

/// Renders table references for one dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCatalog {
    pub dialect: Dialect,
    pub names: TableNames,
    /// `project.dataset` prefix for the warehouse
    pub qualifier: Option<String>,
}

impl TableCatalog {
    pub fn new(dialect: Dialect, names: TableNames, qualifier: Option<String>) -> Self {
        Self {
            dialect,
            names,
            qualifier,
        }
    }

    /// Table reference as it appears in query text
    pub fn reference(&self, key: TableKey) -> String {
        let name = self.names.get(key);
        match (self.dialect, &self.qualifier) {
            (Dialect::BigQuery, Some(prefix)) => self.dialect.quote_table(&format!("{}.{}", prefix, name)),
            (Dialect::BigQuery, None) => self.dialect.quote_table(name),
            (Dialect::Sqlite, _) => name.to_string(),
        }
    }
}

impl Default for TableCatalog {
    fn default() -> Self {
        Self::new(Dialect::Sqlite, TableNames::default(), None)
    }
}
