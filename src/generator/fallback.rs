use regex::Captures;
use std::collections::BTreeSet;

use crate::core::Dialect;
use crate::generator::entities::{Comparator, ExtractedEntities, SortOrder, Threshold, Vocabulary};
use crate::generator::rules::{
    NumberRole, TableKey, BUCKETS, COMPILED_BUCKETS, COMPILED_RULES, DEFAULT_DAYS, DEFAULT_FILTER,
    DEFAULT_LIMIT, DEFAULT_THRESHOLD, GENERIC_CONFIDENCE, GENERIC_TEMPLATE, PLACEHOLDER, RULES,
};
use crate::generator::{EntityHints, GeneratedQuery, TableCatalog};

/// Deterministic pattern-matching generator used when no usable candidate exists
#[derive(Debug, Clone)]
pub struct FallbackGenerator {
    catalog: TableCatalog,
    vocabulary: Vocabulary,
}

/// Template chosen for a question, before rendering
struct Selection {
    template: &'static str,
    confidence: f64,
    tables: &'static [TableKey],
    number_roles: &'static [NumberRole],
    default_limit: u32,
    pattern_matched: Option<String>,
    explanation: String,
}

impl FallbackGenerator {
    pub fn new(catalog: TableCatalog, vocabulary: Vocabulary) -> Self {
        Self { catalog, vocabulary }
    }

    pub fn dialect(&self) -> Dialect {
        self.catalog.dialect
    }

    pub fn catalog(&self) -> &TableCatalog {
        &self.catalog
    }

    /// Entities found in `question` with this generator's vocabulary
    pub fn extract(&self, question: &str) -> ExtractedEntities {
        ExtractedEntities::extract(question, &self.vocabulary)
    }

    /// Produce a query for `question`; never fails
    pub fn generate(&self, question: &str, hints: Option<&EntityHints>) -> GeneratedQuery {
        let mut entities = self.extract(question);
        if let Some(hints) = hints {
            entities.merge(&hints.entities);
        }
        let intent = hints
            .and_then(|h| h.intent.as_deref())
            .map(|i| i.trim().to_ascii_lowercase())
            .filter(|i| !i.is_empty());

        let selection = select(question, intent.as_deref());
        assign_loose_numbers(&mut entities, selection.number_roles);

        let mut defaults_applied = Vec::new();
        let query_text = PLACEHOLDER
            .replace_all(selection.template, |caps: &Captures| {
                let alias = caps.get(2).map(|m| m.as_str());
                let (value, defaulted) = self.placeholder(&caps[1], alias, &entities, selection.default_limit);
                if defaulted && !defaults_applied.iter().any(|d| d == &caps[1]) {
                    defaults_applied.push(caps[1].to_string());
                }
                value
            })
            .into_owned();

        let tables_referenced: BTreeSet<String> = selection
            .tables
            .iter()
            .map(|key| self.catalog.names.get(*key).to_string())
            .collect();

        tracing::debug!(
            "Fallback generated query via {} (confidence {:.2})",
            selection.pattern_matched.as_deref().unwrap_or("generic listing"),
            selection.confidence
        );

        GeneratedQuery {
            query_text,
            confidence: selection.confidence,
            explanation: selection.explanation,
            tables_referenced,
            pattern_matched: selection.pattern_matched,
            defaults_applied,
        }
    }

    /// Value for one placeholder, and whether it is a default
    fn placeholder(
        &self,
        name: &str,
        alias: Option<&str>,
        entities: &ExtractedEntities,
        default_limit: u32,
    ) -> (String, bool) {
        let column = |col: &str| match alias {
            Some(a) => format!("{}.{}", a, col),
            None => col.to_string(),
        };

        match name {
            "pricing" => (self.catalog.reference(TableKey::Pricing), false),
            "price_history" => (self.catalog.reference(TableKey::PriceHistory), false),
            "sales" => (self.catalog.reference(TableKey::Sales), false),
            "elasticity" => (self.catalog.reference(TableKey::Elasticity), false),
            "competitors" => (self.catalog.reference(TableKey::Competitors), false),
            "product_filter" => membership(&column("product_id"), &entities.identifiers),
            "zone_filter" => membership(&column("zone"), &entities.zones),
            "category_filter" => membership(&column("category"), &entities.categories),
            "competitor_filter" => membership(&column("competitor_name"), &entities.competitors),
            "limit" => match entities.limit {
                Some(n) => (n.max(1).to_string(), false),
                None => (default_limit.to_string(), true),
            },
            "comparator" => match entities.threshold {
                Some(t) => (t.comparator.as_sql().to_string(), false),
                None => (Comparator::Gt.as_sql().to_string(), true),
            },
            "threshold" => match entities.threshold {
                Some(t) => (t.value.to_string(), false),
                None => (DEFAULT_THRESHOLD.to_string(), true),
            },
            "since" => match (entities.since_date, entities.days) {
                (Some(date), _) => (
                    self.catalog
                        .dialect
                        .date_literal(&date.format("%Y-%m-%d").to_string()),
                    false,
                ),
                (None, Some(days)) => (self.catalog.dialect.days_ago(days), false),
                (None, None) => (self.catalog.dialect.days_ago(DEFAULT_DAYS), true),
            },
            "order" => match entities.order {
                Some(order) => (order.as_sql().to_string(), false),
                None => (SortOrder::Desc.as_sql().to_string(), true),
            },
            other => {
                tracing::warn!("⚠️ Unknown template placeholder {{{}}}", other);
                (DEFAULT_FILTER.to_string(), true)
            }
        }
    }
}

impl Default for FallbackGenerator {
    fn default() -> Self {
        Self::new(TableCatalog::default(), Vocabulary::default())
    }
}

fn select(question: &str, intent: Option<&str>) -> Selection {
    let named_rule = intent.and_then(|i| RULES.iter().position(|r| r.name == i));
    let rule_index = named_rule.or_else(|| COMPILED_RULES.iter().position(|re| re.is_match(question)));

    if let Some(index) = rule_index {
        let rule = &RULES[index];
        return Selection {
            template: rule.template,
            confidence: rule.confidence,
            tables: rule.tables,
            number_roles: rule.number_roles,
            default_limit: rule.default_limit,
            pattern_matched: Some(rule.name.to_string()),
            explanation: format!("Matched rule '{}': {}", rule.name, rule.description),
        };
    }

    let bucket_text = match intent {
        Some(intent) => format!("{} {}", question, intent.replace('_', " ")),
        None => question.to_string(),
    };
    if let Some(index) = COMPILED_BUCKETS.iter().position(|re| re.is_match(&bucket_text)) {
        let bucket = &BUCKETS[index];
        return Selection {
            template: bucket.template,
            confidence: bucket.confidence,
            tables: bucket.tables,
            number_roles: &[NumberRole::Limit],
            default_limit: DEFAULT_LIMIT,
            pattern_matched: Some(format!("bucket:{}", bucket.name)),
            explanation: format!("No rule matched; using the '{}' keyword bucket", bucket.name),
        };
    }

    Selection {
        template: GENERIC_TEMPLATE,
        confidence: GENERIC_CONFIDENCE,
        tables: &[TableKey::Pricing],
        number_roles: &[NumberRole::Limit],
        default_limit: DEFAULT_LIMIT,
        pattern_matched: None,
        explanation: "No rule or keyword bucket matched; listing products".to_string(),
    }
}

/// Hand unclaimed numbers to the first unfilled roles, in precedence order
fn assign_loose_numbers(entities: &mut ExtractedEntities, roles: &[NumberRole]) {
    let mut numbers = entities.loose_numbers.iter().copied();
    for role in roles {
        let filled = match role {
            NumberRole::Limit => entities.limit.is_some(),
            NumberRole::Threshold => entities.threshold.is_some(),
            NumberRole::Days => entities.days.is_some() || entities.since_date.is_some(),
        };
        if filled {
            continue;
        }
        let Some(n) = numbers.next() else { break };
        match role {
            NumberRole::Limit if n >= 1.0 && n.fract() == 0.0 => entities.limit = Some(n as u32),
            NumberRole::Days if n >= 1.0 && n.fract() == 0.0 => entities.days = Some(n as u32),
            NumberRole::Threshold => {
                entities.threshold = Some(Threshold {
                    comparator: Comparator::Gt,
                    value: n,
                })
            }
            _ => {}
        }
    }
}

/// `column = 'v'` / `column IN (...)`, or the always-true default
fn membership(column: &str, values: &[String]) -> (String, bool) {
    let literals: Vec<String> = values
        .iter()
        .map(|v| quote_literal(v))
        .filter(|v| v != "''")
        .collect();
    match literals.len() {
        0 => (DEFAULT_FILTER.to_string(), true),
        1 => (format!("{} = {}", column, literals[0]), false),
        _ => (format!("{} IN ({})", column, literals.join(", ")), false),
    }
}

/// Single-quoted literal restricted to identifier-like characters
fn quote_literal(value: &str) -> String {
    let mut cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '&' | ' ' | '.'))
        .collect();
    while cleaned.contains("--") {
        cleaned = cleaned.replace("--", "-");
    }
    format!("'{}'", cleaned.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TableNames;
    use crate::validation::SafetyValidator;

    fn generator() -> FallbackGenerator {
        FallbackGenerator::default()
    }

    fn warehouse_generator() -> FallbackGenerator {
        FallbackGenerator::new(
            TableCatalog::new(
                Dialect::BigQuery,
                TableNames::default(),
                Some("acme-prod.pricing".to_string()),
            ),
            Vocabulary::default(),
        )
    }

    #[test]
    fn test_current_price_lookup() {
        let q = generator().generate("What is the current price for identifier '123456'?", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("current_price_lookup"));
        assert!(q.confidence >= 0.85);
        assert!(q.query_text.contains("product_id = '123456'"));
        assert!(q.query_text.contains("FROM pricing_data"));
        assert!(q.query_text.ends_with("LIMIT 1"));
        assert!(q.tables_referenced.contains("pricing_data"));
        assert_eq!(q.defaults_applied, vec!["zone_filter".to_string()]);
        assert!(!q.query_text.contains('{'));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let gen = generator();
        let question = "top 5 products by revenue last quarter in the north";
        let first = gen.generate(question, None);
        for _ in 0..5 {
            assert_eq!(gen.generate(question, None), first);
        }
    }

    #[test]
    fn test_price_history_window() {
        let q = generator().generate("show price history for sku AB-1234 over the last 14 days", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("price_history"));
        assert!(q.query_text.contains("product_id = 'AB-1234'"));
        assert!(q.query_text.contains("effective_date >= date('now', '-14 days')"));
        assert!(q.query_text.ends_with("LIMIT 100"));
    }

    #[test]
    fn test_threshold_filter() {
        let q = generator().generate("which products are priced above $20.50 in the north", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("price_threshold_filter"));
        assert!(q.query_text.contains("current_price > 20.5"));
        assert!(q.query_text.contains("zone = 'NORTH'"));
        assert!(q.defaults_applied.contains(&"category_filter".to_string()));
    }

    #[test]
    fn test_large_threshold_is_not_an_identifier_filter() {
        let q = generator().generate("sales over 15000 in the north", None);

        assert!(!q.query_text.contains("'15000'"), "{}", q.query_text);
        assert!(q.query_text.contains("zone = 'NORTH'"));
    }

    #[test]
    fn test_top_revenue_with_limit_and_period() {
        let q = generator().generate("top 5 products by revenue last quarter", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("top_revenue_products"));
        assert!(q.query_text.contains("LIMIT 5"));
        assert!(q.query_text.contains("date('now', '-90 days')"));
        assert!(q.query_text.contains("ORDER BY total_revenue DESC"));
    }

    #[test]
    fn test_loose_number_fills_limit() {
        let q = generator().generate("cheapest 3 products", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("price_extremes"));
        assert!(q.query_text.contains("ORDER BY current_price ASC LIMIT 3"));
        assert!(!q.defaults_applied.contains(&"limit".to_string()));
    }

    #[test]
    fn test_competitor_comparison() {
        let q = generator().generate("compare our prices versus Acme", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("competitor_price_comparison"));
        assert!(q.query_text.contains("c.competitor_name = 'Acme'"));
        assert!(q.tables_referenced.contains("competitor_prices"));
        assert!(q.tables_referenced.contains("pricing_data"));
    }

    #[test]
    fn test_keyword_bucket() {
        let q = generator().generate("how is demand looking", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("bucket:demand_sensitivity"));
        assert!(q.confidence < 0.5);
    }

    #[test]
    fn test_generic_listing_has_lowest_confidence() {
        let q = generator().generate("tell me something interesting", None);

        assert_eq!(q.pattern_matched, None);
        assert_eq!(q.confidence, GENERIC_CONFIDENCE);
        assert!(q.query_text.starts_with("SELECT"));
        assert!(q.query_text.ends_with("LIMIT 10"));
    }

    #[test]
    fn test_intent_joins_bucket_selection() {
        let gen = generator();
        let without = gen.generate("what about the widgets", None);
        assert_eq!(without.pattern_matched, None);

        let hints = EntityHints {
            intent: Some("revenue".to_string()),
            ..Default::default()
        };
        let with = gen.generate("what about the widgets", Some(&hints));
        assert_eq!(with.pattern_matched.as_deref(), Some("bucket:revenue"));
    }

    #[test]
    fn test_intent_naming_a_rule_selects_it() {
        let hints = EntityHints {
            intent: Some("margin_analysis".to_string()),
            ..Default::default()
        };
        let q = generator().generate("show me the numbers", Some(&hints));
        assert_eq!(q.pattern_matched.as_deref(), Some("margin_analysis"));
    }

    #[test]
    fn test_hints_override_extraction() {
        let mut hints = EntityHints::default();
        hints.entities.identifiers = vec!["555'; DROP".to_string()];
        hints.entities.limit = Some(7);

        let q = generator().generate("price history for sku 111111", Some(&hints));
        assert!(q.query_text.contains("product_id = '555 DROP'"));
        assert!(q.query_text.contains("LIMIT 7"));
    }

    #[test]
    fn test_multiple_zones_render_in_list() {
        let q = generator().generate("current price for sku 42A1 in the north and south", None);
        assert!(q.query_text.contains("zone IN ('NORTH', 'SOUTH')"));
    }

    #[test]
    fn test_warehouse_rendering() {
        let q = warehouse_generator().generate("revenue by zone over the last 7 days", None);

        assert_eq!(q.pattern_matched.as_deref(), Some("revenue_by_zone"));
        assert!(q.query_text.contains("`acme-prod.pricing.sales_data`"));
        assert!(q.query_text.contains("DATE_SUB(CURRENT_DATE(), INTERVAL 7 DAY)"));
    }

    #[test]
    fn test_every_template_passes_validation() {
        let questions = [
            "What is the current price for identifier '123456'?",
            "price history for sku AB-1234",
            "products priced under 15 in category toys",
            "most expensive items",
            "top 3 sales in the east since 2026-01-01",
            "revenue per zone",
            "price elasticity for product 7788",
            "our prices vs. Acme in the west",
            "margin for electronics",
            "prices across zones",
            "average price in the toys category",
            "anything on pricing",
            "demand",
            "sold units",
            "profit",
            "rivals",
            "hello there",
        ];

        for gen in [generator(), warehouse_generator()] {
            let validator = SafetyValidator::new(gen.dialect(), 3);
            for question in questions {
                let q = gen.generate(question, None);
                let verdict = validator.validate(&q.query_text);
                assert!(verdict.is_valid, "{}: {:?}\n{}", question, verdict.violations, q.query_text);
                assert!(!q.query_text.contains('{'), "{}", q.query_text);
            }
        }
    }

    #[test]
    fn test_quote_literal_strips_comment_markers() {
        assert_eq!(quote_literal("A--B"), "'A-B'");
        assert_eq!(quote_literal("x'y"), "'xy'");
    }
}
