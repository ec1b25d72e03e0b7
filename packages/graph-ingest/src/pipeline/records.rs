//! Numbered record lists for the per-item stages.
//!
//! Resolution and temporal enrichment send items as lines of the form
//! `[id] body` and expect one decision per id back. Models sometimes drop
//! or mangle the id, so decisions fall back to their position among the
//! chunk's records.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::utils::text::normalize_whitespace;

fn record_id_re() -> &'static Regex {
    static RECORD_ID: OnceLock<Regex> = OnceLock::new();
    RECORD_ID.get_or_init(|| Regex::new(r"(?m)^\[(\d+)\]").expect("static regex is valid"))
}

/// Render one record line.
pub fn format_record(id: usize, body: &str) -> String {
    format!("[{}] {}\n", id, normalize_whitespace(body))
}

/// Ids of the records in a chunk, in order.
pub fn record_ids(chunk_text: &str) -> Vec<usize> {
    record_id_re()
        .captures_iter(chunk_text)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Read a record id the model echoed back: `3`, `"3"` or `"[3]"`.
pub fn parse_record_id(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().trim_start_matches('[').trim_end_matches(']').trim().parse().ok(),
        _ => None,
    }
}

/// Pair each decision with the record it answers.
///
/// A decision whose echoed id belongs to the chunk keeps it; otherwise it
/// takes the id at its position. Ids already claimed are not reused, and
/// decisions that cannot be placed are dropped.
pub fn assign_record_ids<T>(
    decisions: Vec<(Option<usize>, T)>,
    chunk_ids: &[usize],
) -> Vec<(usize, T)> {
    let valid: HashSet<usize> = chunk_ids.iter().copied().collect();
    let mut claimed = HashSet::new();
    let mut assigned = Vec::with_capacity(decisions.len());

    for (position, (echoed, decision)) in decisions.into_iter().enumerate() {
        let id = echoed
            .filter(|id| valid.contains(id))
            .or_else(|| chunk_ids.get(position).copied());

        if let Some(id) = id {
            if claimed.insert(id) {
                assigned.push((id, decision));
            }
        }
    }

    assigned
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_ids_from_chunk() {
        let chunk = format!("{}{}", format_record(4, "Alice (Person)"), format_record(5, "Acme\n Corp"));
        assert_eq!(chunk, "[4] Alice (Person)\n[5] Acme Corp\n");
        assert_eq!(record_ids(&chunk), vec![4, 5]);
    }

    #[test]
    fn test_parse_record_id_variants() {
        assert_eq!(parse_record_id(&json!(3)), Some(3));
        assert_eq!(parse_record_id(&json!("3")), Some(3));
        assert_eq!(parse_record_id(&json!("[3]")), Some(3));
        assert_eq!(parse_record_id(&json!("x")), None);
        assert_eq!(parse_record_id(&json!(-1)), None);
    }

    #[test]
    fn test_assign_falls_back_to_position() {
        let decisions = vec![(None, "a"), (Some(99), "b"), (Some(7), "c")];
        let assigned = assign_record_ids(decisions, &[5, 6, 7]);
        assert_eq!(assigned, vec![(5, "a"), (6, "b"), (7, "c")]);
    }

    #[test]
    fn test_assign_never_reuses_ids() {
        let decisions = vec![(Some(5), "a"), (Some(5), "b")];
        let assigned = assign_record_ids(decisions, &[5, 6]);
        assert_eq!(assigned, vec![(5, "a")]);
    }
}
