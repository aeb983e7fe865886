//! Pattern-based extraction of business identifiers from email text.
//!
//! Pure and deterministic: identical input always yields identical output,
//! which keeps cache fingerprints and prompts stable. No I/O.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default cap on part numbers, the broadest pattern.
pub const DEFAULT_MAX_PART_NUMBERS: usize = 10;

/// Cap applied to every other entity list.
const MAX_PER_KIND: usize = 25;

static PO_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:p\.?o\.?|purchase\s+order)\s*(?:#|no\.?|number|num)?\s*[:\-]?\s*(\d{6,12})\b")
        .expect("PO number pattern")
});

static QUOTE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:quote|quotation|qt|rfq)\s*(?:#|no\.?|number|num)?\s*[:\-]?\s*([a-z]{0,4}-?\d{5,10})\b")
        .expect("quote number pattern")
});

/// Bare `CAS` quote identifiers that appear without a "quote" marker.
static CAS_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(CAS-?\d{6,8})\b").expect("CAS quote pattern"));

static CASE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:case|ticket|sr|incident)\s*(?:#|no\.?|number|num|id)?\s*[:\-]?\s*([a-z]{0,3}-?\d{4,10})\b")
        .expect("case number pattern")
});

static ORDER_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:order|so|sales\s+order)\s*(?:#|no\.?|number|num|ref)?\s*[:\-]?\s*([a-z]{0,3}-?\d{5,10})\b")
        .expect("order reference pattern")
});

static PART_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z]{2,5}-?\d{3,8}(?:-[A-Z0-9]{1,4})?)\b").expect("part number pattern")
});

static EMAIL_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email pattern")
});

static PHONE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,2}[\s.-])?\(?\b\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b").expect("phone pattern")
});

/// Identifiers extracted from an email or a whole chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySet {
    #[serde(default)]
    pub po_numbers: Vec<String>,
    #[serde(default)]
    pub quote_numbers: Vec<String>,
    #[serde(default)]
    pub case_numbers: Vec<String>,
    #[serde(default)]
    pub part_numbers: Vec<String>,
    #[serde(default)]
    pub order_references: Vec<String>,
    #[serde(default)]
    pub contacts: Vec<String>,
}

impl EntitySet {
    /// Total number of identifiers across all kinds.
    pub fn total(&self) -> usize {
        self.po_numbers.len()
            + self.quote_numbers.len()
            + self.case_numbers.len()
            + self.part_numbers.len()
            + self.order_references.len()
            + self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Union with `other`, keeping first-seen order.
    pub fn merge(&mut self, other: &EntitySet) {
        extend_unique(&mut self.po_numbers, &other.po_numbers);
        extend_unique(&mut self.quote_numbers, &other.quote_numbers);
        extend_unique(&mut self.case_numbers, &other.case_numbers);
        extend_unique(&mut self.part_numbers, &other.part_numbers);
        extend_unique(&mut self.order_references, &other.order_references);
        extend_unique(&mut self.contacts, &other.contacts);
    }

    /// Compact single-line rendering for prompts and fallback summaries.
    pub fn describe(&self) -> String {
        let kinds = [
            ("PO", &self.po_numbers),
            ("quote", &self.quote_numbers),
            ("case", &self.case_numbers),
            ("part", &self.part_numbers),
            ("order", &self.order_references),
            ("contact", &self.contacts),
        ];
        let parts: Vec<String> = kinds
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(label, values)| format!("{label}: {}", values.join(", ")))
            .collect();
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join("; ")
        }
    }

    /// Build from loosely shaped model output such as
    /// `{"po_numbers": ["123456"], "case_numbers": "CS-1234"}`.
    ///
    /// Unknown keys are ignored; non-string values are skipped.
    pub fn from_loose_json(value: &serde_json::Value) -> Self {
        let mut set = Self::default();
        let Some(map) = value.as_object() else {
            return set;
        };
        for (key, raw) in map {
            let values: Vec<String> = match raw {
                serde_json::Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                _ => continue,
            };
            let target = match key.as_str() {
                "po_numbers" | "po_number" | "pos" => &mut set.po_numbers,
                "quote_numbers" | "quote_number" | "quotes" => &mut set.quote_numbers,
                "case_numbers" | "case_number" | "cases" => &mut set.case_numbers,
                "part_numbers" | "part_number" | "parts" => &mut set.part_numbers,
                "order_references" | "order_numbers" | "orders" => &mut set.order_references,
                "contacts" | "contact" => &mut set.contacts,
                _ => continue,
            };
            extend_unique(target, &values);
        }
        set
    }
}

fn extend_unique(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

/// Stateless identifier extractor.
#[derive(Debug, Clone)]
pub struct EntityExtractor {
    max_part_numbers: usize,
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PART_NUMBERS)
    }
}

impl EntityExtractor {
    pub fn new(max_part_numbers: usize) -> Self {
        Self { max_part_numbers }
    }

    /// Extract every identifier kind from `text`.
    pub fn extract(&self, text: &str) -> EntitySet {
        let po_numbers = captures(&PO_NUMBER, text, MAX_PER_KIND);

        let mut quote_numbers = captures(&QUOTE_NUMBER, text, MAX_PER_KIND);
        for cas in captures(&CAS_QUOTE, text, MAX_PER_KIND) {
            let normalized = cas.replace('-', "");
            if !quote_numbers.iter().any(|q| q.replace('-', "") == normalized) {
                quote_numbers.push(cas);
            }
        }
        quote_numbers.truncate(MAX_PER_KIND);

        let case_numbers = captures(&CASE_NUMBER, text, MAX_PER_KIND);
        let order_references: Vec<String> = captures(&ORDER_REFERENCE, text, MAX_PER_KIND)
            .into_iter()
            .filter(|o| !po_numbers.contains(o))
            .collect();

        // Part numbers overlap every other identifier shape; drop anything
        // already claimed by a more specific extractor.
        let claimed: HashSet<&str> = po_numbers
            .iter()
            .chain(&quote_numbers)
            .chain(&case_numbers)
            .chain(&order_references)
            .map(String::as_str)
            .collect();
        let part_numbers: Vec<String> = unique_matches(&PART_NUMBER, text)
            .into_iter()
            .filter(|p| !claimed.contains(p.as_str()))
            .take(self.max_part_numbers)
            .collect();

        let mut contacts: Vec<String> = unique_matches(&EMAIL_ADDRESS, text)
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
        contacts.dedup();
        for phone in unique_matches(&PHONE_NUMBER, text) {
            if !contacts.contains(&phone) {
                contacts.push(phone);
            }
        }
        contacts.truncate(MAX_PER_KIND);

        EntitySet {
            po_numbers,
            quote_numbers,
            case_numbers,
            part_numbers,
            order_references,
            contacts,
        }
    }
}

/// First capture group of every match, uppercased and deduplicated.
fn captures(regex: &Regex, text: &str, limit: usize) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in regex.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            let value = m.as_str().to_uppercase();
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        if seen.len() >= limit {
            break;
        }
    }
    seen
}

fn unique_matches(regex: &Regex, text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in regex.find_iter(text) {
        let value = m.as_str().trim().to_string();
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_quote_number_from_subject() {
        let set = EntityExtractor::default().extract("Quote CAS892456 Ready for Review");
        assert_eq!(set.quote_numbers, vec!["CAS892456"]);
        assert!(set.part_numbers.is_empty(), "quote must not double as part number");
    }

    #[test]
    fn quote_marker_without_digits_is_ignored() {
        let set = EntityExtractor::default().extract("RE: RFQ - quote attached");
        assert!(set.quote_numbers.is_empty());
    }

    #[test]
    fn extracts_po_numbers_with_minimum_length() {
        let set = EntityExtractor::default()
            .extract("Please see PO# 4500123456 and P.O. 12345 (too short)");
        assert_eq!(set.po_numbers, vec!["4500123456"]);
    }

    #[test]
    fn extracts_case_and_order_references() {
        let set = EntityExtractor::default()
            .extract("Ticket #CS-20931 relates to order SO-778812, purchase order 998877");
        assert_eq!(set.case_numbers, vec!["CS-20931"]);
        assert_eq!(set.order_references, vec!["SO-778812"]);
        assert_eq!(set.po_numbers, vec!["998877"]);
    }

    #[test]
    fn extracts_contacts() {
        let set = EntityExtractor::default()
            .extract("Call me at 555-123-4567 or write to Jane.Doe@Example.com");
        assert!(set.contacts.contains(&"jane.doe@example.com".to_string()));
        assert!(set.contacts.contains(&"555-123-4567".to_string()));
    }

    #[test]
    fn part_numbers_are_deduplicated_and_truncated() {
        let text = (0..30)
            .map(|i| format!("XYZ-{:04} XYZ-{:04}", i, i))
            .collect::<Vec<_>>()
            .join(" ");
        let set = EntityExtractor::new(5).extract(&text);
        assert_eq!(set.part_numbers.len(), 5);
        assert_eq!(set.part_numbers[0], "XYZ-0000");
        assert_eq!(set.part_numbers[1], "XYZ-0001");
    }

    #[test]
    fn extraction_is_referentially_transparent() {
        let extractor = EntityExtractor::default();
        let text = "RFQ 77881 for parts ABC-1234, ABC-5678; PO 4500998877; case 123456; ops@acme.io";
        let before = text.to_string();
        let first = extractor.extract(text);
        let second = extractor.extract(text);
        assert_eq!(first, second);
        assert_eq!(text, before);
        assert!(!first.is_empty());
    }

    #[test]
    fn empty_text_yields_empty_set() {
        let set = EntityExtractor::default().extract("");
        assert!(set.is_empty());
        assert_eq!(set.describe(), "none");
    }

    #[test]
    fn merge_keeps_first_seen_order() {
        let mut a = EntitySet {
            po_numbers: vec!["111111".into()],
            ..Default::default()
        };
        let b = EntitySet {
            po_numbers: vec!["222222".into(), "111111".into()],
            contacts: vec!["x@y.com".into()],
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.po_numbers, vec!["111111", "222222"]);
        assert_eq!(a.total(), 3);
    }

    #[test]
    fn loose_json_accepts_strings_and_arrays() {
        let value = serde_json::json!({
            "po_numbers": ["4500123456", ""],
            "case_number": "CS-1234",
            "mystery": ["ignored"],
            "contacts": 42
        });
        let set = EntitySet::from_loose_json(&value);
        assert_eq!(set.po_numbers, vec!["4500123456"]);
        assert_eq!(set.case_numbers, vec!["CS-1234"]);
        assert_eq!(set.total(), 2);

        assert!(EntitySet::from_loose_json(&serde_json::json!({})).is_empty());
        assert!(EntitySet::from_loose_json(&serde_json::json!("nope")).is_empty());
    }
}
