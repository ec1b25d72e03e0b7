//! Two-tier parsing of model responses into typed items.
//!
//! Tier one decodes a JSON array (fenced or bare, or an array held by a
//! wrapper object). Tier two scans the response for individual JSON objects
//! and decodes whichever of them fit. If neither tier finds anything the
//! caller gets a [`ParseError`], never an empty success.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::ParseError;
use crate::utils::text::extract_json_block;

/// Which tier produced the items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Json,
    Pattern,
}

/// Successfully parsed items.
#[derive(Debug, Clone)]
pub struct Parsed<T> {
    pub items: Vec<T>,
    pub strategy: ParseStrategy,
    /// Elements that were found but did not decode into `T`
    pub skipped: usize,
}

/// Objects with at most one level of nesting (enough for `attributes`).
fn object_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{(?:[^{}]|\{[^{}]*\})*\}").expect("static regex is valid")
    })
}

/// Parse a response into a list of `T`.
///
/// `wrapper_fields` names the keys a model may nest the array under
/// (`{"entities": [...]}`); any array-valued field is accepted as a last
/// resort.
pub fn parse_items<T: DeserializeOwned>(
    response: &str,
    wrapper_fields: &[&str],
) -> Result<Parsed<T>, ParseError> {
    match parse_json_tier(response, wrapper_fields) {
        Ok(parsed) => Ok(parsed),
        Err(json_reason) => {
            debug!(reason = %json_reason, "JSON tier failed, trying pattern extraction");
            parse_pattern_tier(response)
                .ok_or_else(|| ParseError::new(format!("{}; no decodable objects", json_reason), response))
        }
    }
}

fn parse_json_tier<T: DeserializeOwned>(
    response: &str,
    wrapper_fields: &[&str],
) -> Result<Parsed<T>, String> {
    let block = extract_json_block(response).ok_or("no JSON found")?;
    let value: Value = serde_json::from_str(block).map_err(|e| format!("invalid JSON: {}", e))?;

    let elements = match value {
        Value::Array(elements) => elements,
        Value::Object(mut map) => {
            let field = wrapper_fields
                .iter()
                .find(|f| map.get(**f).is_some_and(Value::is_array))
                .map(|f| f.to_string())
                .or_else(|| {
                    map.iter()
                        .find(|(_, v)| v.is_array())
                        .map(|(k, _)| k.clone())
                });

            match field.and_then(|f| map.remove(&f)) {
                Some(Value::Array(elements)) => elements,
                _ => vec![Value::Object(map)],
            }
        }
        _ => return Err("JSON is neither an array nor an object".to_string()),
    };

    let total = elements.len();
    let items: Vec<T> = elements
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();

    if total > 0 && items.is_empty() {
        return Err(format!("none of {} JSON elements matched the expected shape", total));
    }

    Ok(Parsed {
        skipped: total - items.len(),
        items,
        strategy: ParseStrategy::Json,
    })
}

fn parse_pattern_tier<T: DeserializeOwned>(response: &str) -> Option<Parsed<T>> {
    let mut found = 0;
    let items: Vec<T> = object_pattern()
        .find_iter(response)
        .filter_map(|m| {
            found += 1;
            serde_json::from_str(m.as_str()).ok()
        })
        .collect();

    if items.is_empty() {
        return None;
    }

    Some(Parsed {
        skipped: found - items.len(),
        items,
        strategy: ParseStrategy::Pattern,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        name: String,
        #[serde(default)]
        attributes: serde_json::Map<String, Value>,
    }

    #[test]
    fn test_fenced_array() {
        let response = "Here you go:\n```json\n[{\"name\": \"Alice\"}, {\"name\": \"Acme\"}]\n```";
        let parsed: Parsed<Item> = parse_items(response, &[]).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Json);
        assert_eq!(parsed.items.len(), 2);
    }

    #[test]
    fn test_empty_array_is_success() {
        let parsed: Parsed<Item> = parse_items("[]", &[]).unwrap();
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn test_wrapper_object() {
        let response = r#"{"entities": [{"name": "Alice"}]}"#;
        let parsed: Parsed<Item> = parse_items(response, &["entities"]).unwrap();
        assert_eq!(parsed.items[0].name, "Alice");
    }

    #[test]
    fn test_skips_malformed_elements() {
        let parsed: Parsed<Item> = parse_items(r#"[{"name": "A"}, {"nom": "B"}]"#, &[]).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_pattern_fallback_on_broken_array() {
        // Trailing comma and a missing closing bracket break the array
        let response = r#"[{"name": "Alice", "attributes": {"age": 30}}, {"name": "Acme"},"#;
        let parsed: Parsed<Item> = parse_items(response, &[]).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Pattern);
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].attributes["age"], 30);
    }

    #[test]
    fn test_total_failure_is_error() {
        let err = parse_items::<Item>("I could not find any entities.", &[]).unwrap_err();
        assert!(err.reason.contains("no JSON found"));
    }
}
