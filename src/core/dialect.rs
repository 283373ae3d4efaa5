use serde::{Deserialize, Serialize};
use std::fmt;

/// Query-language variant accepted by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Embedded SQLite engine
    Sqlite,
    /// Remote warehouse (BigQuery standard SQL)
    BigQuery,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::BigQuery => "bigquery",
        }
    }

    /// Expression for the date `days` days before today
    pub fn days_ago(&self, days: u32) -> String {
        match self {
            Dialect::Sqlite => format!("date('now', '-{} days')", days),
            Dialect::BigQuery => format!("DATE_SUB(CURRENT_DATE(), INTERVAL {} DAY)", days),
        }
    }

    /// Expression for a literal `YYYY-MM-DD` date
    pub fn date_literal(&self, iso_date: &str) -> String {
        match self {
            Dialect::Sqlite => format!("date('{}')", iso_date),
            Dialect::BigQuery => format!("DATE '{}'", iso_date),
        }
    }

    /// Quote a (possibly dotted) table path
    pub fn quote_table(&self, path: &str) -> String {
        match self {
            Dialect::Sqlite => format!("\"{}\"", path.replace('"', "\"\"")),
            Dialect::BigQuery => format!("`{}`", path.replace('`', "")),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
