//! Fallback rule table.
//!
//! Rules are tried top to bottom and the first regex that matches wins.
//! Placeholders: `{pricing}` `{price_history}` `{sales}` `{elasticity}`
//! `{competitors}` (qualified tables), `{product_filter}` `{zone_filter}`
//! `{category_filter}` `{competitor_filter}` (optionally `{name:alias}` to
//! prefix the column), `{limit}`, `{comparator}`, `{threshold}`, `{since}`,
//! `{order}`.
//!
//! Defaults for unfilled placeholders: filters `1 = 1`, limit = the rule's
//! `default_limit`, comparator `>`, threshold `0`, since = 30 days ago,
//! order `DESC`.

use once_cell::sync::Lazy;
use regex::Regex;

/// Logical tables a template can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKey {
    Pricing,
    PriceHistory,
    Sales,
    Elasticity,
    Competitors,
}

impl TableKey {
    pub const ALL: [TableKey; 5] = [
        TableKey::Pricing,
        TableKey::PriceHistory,
        TableKey::Sales,
        TableKey::Elasticity,
        TableKey::Competitors,
    ];

    /// Placeholder name used in templates
    pub fn placeholder(&self) -> &'static str {
        match self {
            TableKey::Pricing => "pricing",
            TableKey::PriceHistory => "price_history",
            TableKey::Sales => "sales",
            TableKey::Elasticity => "elasticity",
            TableKey::Competitors => "competitors",
        }
    }
}

/// Role an otherwise unclaimed number may fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberRole {
    Limit,
    Threshold,
    Days,
}

/// One (pattern -> template) rule
#[derive(Debug)]
pub struct Rule {
    pub name: &'static str,
    pub pattern: &'static str,
    pub template: &'static str,
    pub confidence: f64,
    pub tables: &'static [TableKey],
    /// Precedence for assigning loose numbers, first unfilled role wins
    pub number_roles: &'static [NumberRole],
    pub default_limit: u32,
    pub description: &'static str,
}

pub static RULES: &[Rule] = &[
    Rule {
        name: "current_price_lookup",
        pattern: r"(?i)\b(?:current|latest|today'?s|present)\s+(?:price|pricing)\b|\bprice\s+(?:for|of)\s+(?:identifier|id|sku|product|item)\b",
        template: "SELECT product_id, product_name, zone, current_price, currency, last_updated FROM {pricing} WHERE {product_filter} AND {zone_filter} ORDER BY last_updated DESC LIMIT 1",
        confidence: 0.9,
        tables: &[TableKey::Pricing],
        number_roles: &[],
        default_limit: 1,
        description: "current value lookup by identifier",
    },
    Rule {
        name: "price_history",
        pattern: r"(?i)\bprice\s+(?:history|trends?|changes?|movements?)\b|\bhow\s+(?:has|have)\s+(?:the\s+)?prices?\s+changed\b",
        template: "SELECT product_id, zone, price, effective_date FROM {price_history} WHERE {product_filter} AND {zone_filter} AND effective_date >= {since} ORDER BY effective_date DESC LIMIT {limit}",
        confidence: 0.85,
        tables: &[TableKey::PriceHistory],
        number_roles: &[NumberRole::Days, NumberRole::Limit],
        default_limit: 100,
        description: "price changes over a period",
    },
    Rule {
        name: "price_threshold_filter",
        pattern: r"(?i)\b(?:prices?|priced|costs?|costing)\b.*\b(?:above|over|below|under|more\s+than|less\s+than|greater\s+than|exceeding|at\s+least|at\s+most)\b",
        template: "SELECT product_id, product_name, category, zone, current_price FROM {pricing} WHERE current_price {comparator} {threshold} AND {zone_filter} AND {category_filter} ORDER BY current_price {order} LIMIT {limit}",
        confidence: 0.8,
        tables: &[TableKey::Pricing],
        number_roles: &[NumberRole::Threshold, NumberRole::Limit],
        default_limit: 50,
        description: "products filtered by a price threshold",
    },
    Rule {
        name: "price_extremes",
        pattern: r"(?i)\b(?:most|least)\s+expensive\b|\b(?:cheapest|priciest)\b|\b(?:highest|lowest)[- ]priced\b",
        template: "SELECT product_id, product_name, category, zone, current_price FROM {pricing} WHERE {zone_filter} AND {category_filter} ORDER BY current_price {order} LIMIT {limit}",
        confidence: 0.8,
        tables: &[TableKey::Pricing],
        number_roles: &[NumberRole::Limit],
        default_limit: 10,
        description: "most or least expensive products",
    },
    Rule {
        name: "top_revenue_products",
        pattern: r"(?i)\b(?:top|best|highest|leading)\b.*\b(?:revenue|sales|selling)\b|\b(?:revenue|sales)\b.*\b(?:top|best|highest)\b",
        template: "SELECT product_id, SUM(revenue) AS total_revenue, SUM(units_sold) AS total_units FROM {sales} WHERE sale_date >= {since} AND {zone_filter} GROUP BY product_id ORDER BY total_revenue {order} LIMIT {limit}",
        confidence: 0.8,
        tables: &[TableKey::Sales],
        number_roles: &[NumberRole::Limit, NumberRole::Days],
        default_limit: 10,
        description: "products ranked by revenue",
    },
    Rule {
        name: "revenue_by_zone",
        pattern: r"(?i)\b(?:revenue|sales)\b.*\b(?:by|per|across|each)\s+(?:zone|region|market)s?\b",
        template: "SELECT zone, SUM(revenue) AS total_revenue, SUM(units_sold) AS total_units FROM {sales} WHERE sale_date >= {since} AND {product_filter} GROUP BY zone ORDER BY total_revenue {order} LIMIT {limit}",
        confidence: 0.8,
        tables: &[TableKey::Sales],
        number_roles: &[NumberRole::Days],
        default_limit: 50,
        description: "revenue aggregated per zone",
    },
    Rule {
        name: "elasticity_lookup",
        pattern: r"(?i)\belastic(?:ity|ities)?\b|\b(?:demand|price)\s+sensitiv",
        template: "SELECT product_id, zone, elasticity, r_squared, computed_at FROM {elasticity} WHERE {product_filter} AND {zone_filter} ORDER BY ABS(elasticity) {order} LIMIT {limit}",
        confidence: 0.75,
        tables: &[TableKey::Elasticity],
        number_roles: &[NumberRole::Limit],
        default_limit: 20,
        description: "demand sensitivity estimates",
    },
    Rule {
        name: "competitor_price_comparison",
        pattern: r"(?i)\bcompetit(?:or|ors|ive|ion)\b|\b(?:vs\.?|versus)\s|\bcompared\s+(?:to|with)\b",
        template: "SELECT p.product_id, p.product_name, p.zone, p.current_price, c.competitor_name, c.competitor_price, p.current_price - c.competitor_price AS price_gap FROM {pricing} p JOIN {competitors} c ON c.product_id = p.product_id AND c.zone = p.zone WHERE {product_filter:p} AND {zone_filter:p} AND {competitor_filter:c} ORDER BY ABS(p.current_price - c.competitor_price) {order} LIMIT {limit}",
        confidence: 0.75,
        tables: &[TableKey::Pricing, TableKey::Competitors],
        number_roles: &[NumberRole::Limit],
        default_limit: 25,
        description: "own prices against competitor prices",
    },
    Rule {
        name: "margin_analysis",
        pattern: r"(?i)\bmargins?\b|\bprofitab(?:le|ility)\b|\bmarkups?\b",
        template: "SELECT product_id, product_name, category, zone, current_price, cost, ROUND((current_price - cost) * 100.0 / current_price, 2) AS margin_pct FROM {pricing} WHERE current_price > 0 AND {product_filter} AND {category_filter} AND {zone_filter} ORDER BY margin_pct {order} LIMIT {limit}",
        confidence: 0.7,
        tables: &[TableKey::Pricing],
        number_roles: &[NumberRole::Limit],
        default_limit: 25,
        description: "margin per product",
    },
    Rule {
        name: "zone_price_comparison",
        pattern: r"(?i)\bprices?\b.*\b(?:by|per|across|between)\s+(?:zones?|regions?|markets?)\b",
        template: "SELECT zone, COUNT(*) AS products, ROUND(AVG(current_price), 2) AS avg_price FROM {pricing} WHERE {product_filter} AND {category_filter} GROUP BY zone ORDER BY avg_price {order} LIMIT {limit}",
        confidence: 0.7,
        tables: &[TableKey::Pricing],
        number_roles: &[NumberRole::Limit],
        default_limit: 50,
        description: "price levels compared across zones",
    },
    Rule {
        name: "category_price_summary",
        pattern: r"(?i)\b(?:average|avg|mean)\s+(?:price|pricing)\b|\bprices?\s+by\s+category\b",
        template: "SELECT category, COUNT(*) AS products, ROUND(AVG(current_price), 2) AS avg_price, MIN(current_price) AS min_price, MAX(current_price) AS max_price FROM {pricing} WHERE {zone_filter} AND {category_filter} GROUP BY category ORDER BY avg_price {order} LIMIT {limit}",
        confidence: 0.7,
        tables: &[TableKey::Pricing],
        number_roles: &[NumberRole::Limit],
        default_limit: 50,
        description: "price statistics per category",
    },
];

/// Keyword bucket used when no rule matches
#[derive(Debug)]
pub struct Bucket {
    pub name: &'static str,
    pub pattern: &'static str,
    pub template: &'static str,
    pub confidence: f64,
    pub tables: &'static [TableKey],
}

pub static BUCKETS: &[Bucket] = &[
    Bucket {
        name: "pricing",
        pattern: r"(?i)\b(?:price|prices|pricing|priced|cost|costs)\b",
        template: "SELECT product_id, product_name, category, zone, current_price, last_updated FROM {pricing} WHERE {product_filter} AND {zone_filter} ORDER BY last_updated DESC LIMIT {limit}",
        confidence: 0.4,
        tables: &[TableKey::Pricing],
    },
    Bucket {
        name: "demand_sensitivity",
        pattern: r"(?i)\b(?:demand|sensitiv\w*|elastic\w*|responsive\w*)\b",
        template: "SELECT product_id, zone, elasticity, computed_at FROM {elasticity} WHERE {product_filter} AND {zone_filter} ORDER BY computed_at DESC LIMIT {limit}",
        confidence: 0.35,
        tables: &[TableKey::Elasticity],
    },
    Bucket {
        name: "revenue",
        pattern: r"(?i)\b(?:revenue|sales|sold|income|turnover)\b",
        template: "SELECT product_id, zone, sale_date, units_sold, revenue FROM {sales} WHERE sale_date >= {since} AND {product_filter} AND {zone_filter} ORDER BY sale_date DESC LIMIT {limit}",
        confidence: 0.35,
        tables: &[TableKey::Sales],
    },
    Bucket {
        name: "margin",
        pattern: r"(?i)\b(?:margins?|profit\w*|markups?)\b",
        template: "SELECT product_id, product_name, current_price, cost FROM {pricing} WHERE {product_filter} AND {zone_filter} LIMIT {limit}",
        confidence: 0.3,
        tables: &[TableKey::Pricing],
    },
    Bucket {
        name: "competitive",
        pattern: r"(?i)\b(?:competitor\w*|competition|rivals?|market\s+share)\b",
        template: "SELECT product_id, competitor_name, competitor_price, zone, observed_at FROM {competitors} WHERE {product_filter} AND {zone_filter} ORDER BY observed_at DESC LIMIT {limit}",
        confidence: 0.3,
        tables: &[TableKey::Competitors],
    },
];

/// Used when neither a rule nor a bucket matches
pub const GENERIC_TEMPLATE: &str =
    "SELECT product_id, product_name, category, zone, current_price FROM {pricing} LIMIT {limit}";
pub const GENERIC_CONFIDENCE: f64 = 0.2;

pub const DEFAULT_LIMIT: u32 = 10;
pub const DEFAULT_DAYS: u32 = 30;
pub const DEFAULT_THRESHOLD: f64 = 0.0;
pub const DEFAULT_FILTER: &str = "1 = 1";

pub(crate) static COMPILED_RULES: Lazy<Vec<Regex>> =
    Lazy::new(|| RULES.iter().map(|r| Regex::new(r.pattern).unwrap()).collect());

pub(crate) static COMPILED_BUCKETS: Lazy<Vec<Regex>> =
    Lazy::new(|| BUCKETS.iter().map(|b| Regex::new(b.pattern).unwrap()).collect());

pub(crate) static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)(?::([a-z]+))?\}").unwrap());
