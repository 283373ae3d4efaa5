use chrono::NaiveDate;
use once_cell::sync::Lazy;
use rapidfuzz::distance::jaro_winkler;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Minimum Jaro-Winkler similarity for a word to count as a vocabulary term
const VOCABULARY_MATCH: f64 = 0.9;

static KEYED_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:identifier|id|sku|product|item|upc)\b\s*(?:#|no\.?|number|code)?\s*[:=]?\s*['"]?([A-Za-z0-9][A-Za-z0-9_\-]*\d[A-Za-z0-9_\-]*)"#,
    )
    .unwrap()
});

static QUOTED_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]([A-Za-z0-9][A-Za-z0-9_\-]*)['"]"#).unwrap());

static LONG_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{5,}\b").unwrap());

static LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:top|first|bottom|highest|lowest|best|worst|limit(?:\s+to)?)\s+(\d{1,4})\b").unwrap()
});

static THRESHOLD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(above|over|more\s+than|greater\s+than|exceeding|at\s+least|below|under|less\s+than|at\s+most)\s+\$?(\d+(?:\.\d+)?)",
    )
    .unwrap()
});

static PERIOD_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:last|past|previous)\s+(\d{1,4})\s+(day|week|month|year)s?\b").unwrap()
});

static PERIOD_NAMED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:last|past|previous|this)\s+(week|month|quarter|year)\b").unwrap());

static YESTERDAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\byesterday\b").unwrap());

static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap());

static ZONE_KEYED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:zone|region|market)\s+['"]?([A-Za-z0-9][A-Za-z0-9_\-]*)"#).unwrap()
});

static CATEGORY_KEYED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\bcategory\s+['"]?([A-Za-z][A-Za-z_\-]*)|\b(?:in|for)\s+(?:the\s+)?['"]?([A-Za-z][A-Za-z_\-]*)['"]?\s+category\b"#,
    )
    .unwrap()
});

static COMPETITOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:vs\.?|versus|compared\s+(?:to|with)|against)\s+['"]?([A-Za-z][A-Za-z0-9&_\-]*)"#).unwrap()
});

static ASCENDING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:lowest|least|cheapest|bottom|worst|smallest|minimum)\b").unwrap()
});

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]{4,}").unwrap());

/// Words that follow a comparison keyword but are not competitor names
const GENERIC_COMPETITOR_WORDS: &[&str] = &[
    "competitor", "competitors", "competition", "others", "other", "the", "market", "rivals",
];

/// Words that can follow "zone"/"region" without naming one
const ZONE_STOP_WORDS: &[&str] = &[
    "and", "or", "the", "for", "in", "over", "with", "by", "since", "during", "last", "past", "this",
];

/// Zone and category terms recognized without a leading keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    pub zones: Vec<String>,
    pub categories: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            zones: ["NORTH", "SOUTH", "EAST", "WEST", "CENTRAL"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            categories: ["electronics", "grocery", "apparel", "home", "beauty", "toys"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
        }
    }

    fn from_phrase(phrase: &str) -> Self {
        let phrase = phrase.to_ascii_lowercase();
        let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
        match phrase.as_str() {
            "at least" => Comparator::Ge,
            "at most" => Comparator::Le,
            "below" | "under" | "less than" => Comparator::Lt,
            _ => Comparator::Gt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub comparator: Comparator,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Coarse entities pulled out of a question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedEntities {
    pub identifiers: Vec<String>,
    pub limit: Option<u32>,
    pub threshold: Option<Threshold>,
    pub days: Option<u32>,
    pub since_date: Option<NaiveDate>,
    pub zones: Vec<String>,
    pub categories: Vec<String>,
    pub competitors: Vec<String>,
    pub order: Option<SortOrder>,
    /// Numbers not claimed by any contextual pattern, in order of appearance
    pub loose_numbers: Vec<f64>,
}

impl ExtractedEntities {
    /// Extract entities from `question`
    pub fn extract(question: &str, vocabulary: &Vocabulary) -> Self {
        let mut claimed: Vec<Range<usize>> = Vec::new();
        let mut entities = ExtractedEntities::default();

        for m in ISO_DATE.captures_iter(question) {
            if let Some(g) = m.get(1) {
                if let Ok(date) = NaiveDate::parse_from_str(g.as_str(), "%Y-%m-%d") {
                    entities.since_date.get_or_insert(date);
                    claimed.push(g.range());
                }
            }
        }

        if let Some(caps) = LIMIT.captures(question) {
            if let (Some(g), Ok(n)) = (caps.get(1), caps[1].parse::<u32>()) {
                entities.limit = Some(n);
                claimed.push(g.range());
            }
        }

        if let Some(caps) = THRESHOLD.captures(question) {
            if let (Some(g), Ok(value)) = (caps.get(2), caps[2].parse::<f64>()) {
                entities.threshold = Some(Threshold {
                    comparator: Comparator::from_phrase(&caps[1]),
                    value,
                });
                claimed.push(g.range());
            }
        }

        if let Some(caps) = PERIOD_COUNT.captures(question) {
            if let (Some(g), Ok(n)) = (caps.get(1), caps[1].parse::<u32>()) {
                let unit = match caps[2].to_ascii_lowercase().as_str() {
                    "week" => 7,
                    "month" => 30,
                    "year" => 365,
                    _ => 1,
                };
                entities.days = Some(n.saturating_mul(unit));
                claimed.push(g.range());
            }
        } else if let Some(caps) = PERIOD_NAMED.captures(question) {
            entities.days = Some(match caps[1].to_ascii_lowercase().as_str() {
                "week" => 7,
                "month" => 30,
                "quarter" => 90,
                _ => 365,
            });
        } else if YESTERDAY.is_match(question) {
            entities.days = Some(1);
        }

        // Identifiers come after the contextual roles so a number already read
        // as a limit, threshold, date or period is never also a product id.
        for caps in KEYED_IDENTIFIER.captures_iter(question) {
            if let Some(g) = caps.get(1) {
                if !overlaps(&claimed, &g.range()) {
                    push_unique(&mut entities.identifiers, g.as_str().to_string());
                    claimed.push(g.range());
                }
            }
        }
        for caps in QUOTED_TOKEN.captures_iter(question) {
            if let Some(g) = caps.get(1) {
                if g.as_str().chars().any(|c| c.is_ascii_digit()) && !overlaps(&claimed, &g.range()) {
                    push_unique(&mut entities.identifiers, g.as_str().to_string());
                    claimed.push(g.range());
                }
            }
        }
        for m in LONG_DIGITS.find_iter(question) {
            if !overlaps(&claimed, &m.range()) {
                push_unique(&mut entities.identifiers, m.as_str().to_string());
                claimed.push(m.range());
            }
        }

        for caps in ZONE_KEYED.captures_iter(question) {
            if ZONE_STOP_WORDS.contains(&caps[1].to_ascii_lowercase().as_str()) {
                continue;
            }
            push_unique(&mut entities.zones, caps[1].to_ascii_uppercase());
            if let Some(g) = caps.get(1) {
                claimed.push(g.range());
            }
        }
        for word in WORD.find_iter(question) {
            if let Some(zone) = closest_term(word.as_str(), &vocabulary.zones) {
                push_unique(&mut entities.zones, zone.to_ascii_uppercase());
            }
        }

        for caps in CATEGORY_KEYED.captures_iter(question) {
            if let Some(g) = caps.get(1).or_else(|| caps.get(2)) {
                push_unique(&mut entities.categories, g.as_str().to_ascii_lowercase());
            }
        }
        for word in WORD.find_iter(question) {
            let lower = word.as_str().to_ascii_lowercase();
            if let Some(category) = vocabulary.categories.iter().find(|c| c.eq_ignore_ascii_case(&lower)) {
                push_unique(&mut entities.categories, category.to_ascii_lowercase());
            }
        }

        for caps in COMPETITOR.captures_iter(question) {
            let name = caps[1].to_string();
            if !GENERIC_COMPETITOR_WORDS.contains(&name.to_ascii_lowercase().as_str()) {
                push_unique(&mut entities.competitors, name);
            }
        }

        if ASCENDING.is_match(question) {
            entities.order = Some(SortOrder::Asc);
        }

        for m in NUMBER.find_iter(question) {
            if !overlaps(&claimed, &m.range()) {
                if let Ok(n) = m.as_str().parse::<f64>() {
                    entities.loose_numbers.push(n);
                }
            }
        }

        entities
    }

    /// Overlay caller-supplied entities; present hint values win
    pub fn merge(&mut self, hints: &ExtractedEntities) {
        if !hints.identifiers.is_empty() {
            self.identifiers = sanitized(&hints.identifiers);
        }
        if hints.limit.is_some() {
            self.limit = hints.limit;
        }
        if hints.threshold.is_some() {
            self.threshold = hints.threshold;
        }
        if hints.days.is_some() {
            self.days = hints.days;
        }
        if hints.since_date.is_some() {
            self.since_date = hints.since_date;
        }
        if !hints.zones.is_empty() {
            self.zones = sanitized(&hints.zones)
                .into_iter()
                .map(|z| z.to_ascii_uppercase())
                .collect();
        }
        if !hints.categories.is_empty() {
            self.categories = sanitized(&hints.categories);
        }
        if !hints.competitors.is_empty() {
            self.competitors = sanitized(&hints.competitors);
        }
        if hints.order.is_some() {
            self.order = hints.order;
        }
        if !hints.loose_numbers.is_empty() {
            self.loose_numbers = hints.loose_numbers.clone();
        }
    }
}

fn overlaps(claimed: &[Range<usize>], span: &Range<usize>) -> bool {
    claimed.iter().any(|r| r.start < span.end && span.start < r.end)
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Keep only characters the extraction patterns themselves would accept
fn sanitized(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| {
            v.chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '&' | ' ' | '.'))
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|v| !v.is_empty())
        .collect()
}

fn closest_term<'a>(word: &str, terms: &'a [String]) -> Option<&'a str> {
    let word = word.to_lowercase();
    terms
        .iter()
        .map(|term| {
            let term_lower = term.to_lowercase();
            let score = jaro_winkler::normalized_similarity(word.chars(), term_lower.chars());
            (term.as_str(), score)
        })
        .filter(|(_, score)| *score >= VOCABULARY_MATCH)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(term, _)| term)
}
