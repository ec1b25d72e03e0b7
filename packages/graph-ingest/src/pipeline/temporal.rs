//! Temporal enrichment: infer validity windows for new facts.

use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::chunk::Chunk;
use super::map_refine::{map_refine, RefineTask};
use super::parse::parse_items;
use super::prompts::TEMPORAL_PROMPT;
use super::records::{assign_record_ids, format_record, parse_record_id, record_ids};
use super::state::{PipelineState, StageContext, StagePatch};
use crate::error::ParseError;
use crate::traits::llm::LanguageModel;
use crate::types::fact::{EnrichedFact, TemporalWindow};
use crate::utils::datetime::parse_flexible_datetime;
use crate::utils::text::truncate_with_ellipsis;

const MAX_SOURCE_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
struct RawTemporal {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "validAt", alias = "valid_from")]
    valid_at: Option<Value>,
    #[serde(default, alias = "invalidAt", alias = "valid_until")]
    invalid_at: Option<Value>,
}

/// Read a timestamp the model wrote; anything unparseable becomes `None`.
fn read_timestamp(value: Option<&Value>) -> Option<chrono::DateTime<chrono::Utc>> {
    match value? {
        Value::String(s) if !s.trim().eq_ignore_ascii_case("null") => parse_flexible_datetime(s),
        Value::Number(n) => parse_flexible_datetime(&n.to_string()),
        _ => None,
    }
}

/// Turn the model's proposal into a consistent window.
fn to_window(raw: &RawTemporal) -> TemporalWindow {
    let valid_at = read_timestamp(raw.valid_at.as_ref());
    let mut invalid_at = read_timestamp(raw.invalid_at.as_ref());

    if let (Some(start), Some(end)) = (valid_at, invalid_at) {
        if end < start {
            debug!(%start, %end, "Dropping invalid_at earlier than valid_at");
            invalid_at = None;
        }
    }

    TemporalWindow { valid_at, invalid_at }
}

struct TemporalTask {
    system: String,
}

impl RefineTask for TemporalTask {
    type Item = (usize, TemporalWindow);

    fn name(&self) -> &str {
        "temporal enrichment"
    }

    fn system_prompt(&self) -> String {
        self.system.clone()
    }

    fn user_prompt(&self, chunk: &Chunk, _previous: &[&(usize, TemporalWindow)], error_context: Option<&str>) -> String {
        let mut prompt = String::new();
        if let Some(error) = error_context {
            prompt.push_str(&format!("Your previous attempt failed: {}\n\n", error));
        }
        prompt.push_str("Facts:\n");
        prompt.push_str(&chunk.text);
        prompt
    }

    fn parse(&self, response: &str, chunk: &Chunk) -> Result<Vec<(usize, TemporalWindow)>, ParseError> {
        let parsed = parse_items::<RawTemporal>(response, &["facts", "results", "dates"])?;
        let decisions = parsed
            .items
            .into_iter()
            .map(|raw| (raw.id.as_ref().and_then(parse_record_id), raw))
            .collect();

        Ok(assign_record_ids(decisions, &record_ids(&chunk.text))
            .into_iter()
            .map(|(record, raw)| (record, to_window(&raw)))
            .collect())
    }

    fn dedupe_key(&self, item: &(usize, TemporalWindow)) -> Option<String> {
        Some(item.0.to_string())
    }

    fn line_oriented(&self) -> bool {
        true
    }
}

/// Attach validity windows to `state.resolved_facts`.
///
/// Output is one-to-one with the input; facts that duplicate stored edges
/// are passed through with an empty window.
pub async fn enrich_temporal<L>(ctx: &StageContext<'_, L>, state: &PipelineState) -> StagePatch
where
    L: LanguageModel + ?Sized,
{
    let mut patch = StagePatch::new();
    let facts = &state.resolved_facts;

    let names: HashMap<Uuid, &str> = state
        .resolved_entities
        .iter()
        .map(|e| (e.uuid(), e.final_name.as_str()))
        .collect();
    let name = |id: Uuid| names.get(&id).copied().unwrap_or("?");

    let content: String = facts
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.is_existing())
        .map(|(index, f)| {
            let fact = &f.fact;
            format_record(
                index,
                &format!(
                    "{} ({} -{}-> {})",
                    fact.fact_text,
                    name(fact.source_entity_id),
                    fact.relation_type,
                    name(fact.destination_entity_id)
                ),
            )
        })
        .collect();

    let mut windows: HashMap<usize, TemporalWindow> = HashMap::new();
    if !content.is_empty() {
        let system = format!(
            "{}{}\n\nSource text:\n{}",
            TEMPORAL_PROMPT,
            ctx.request
                .reference_timestamp
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            truncate_with_ellipsis(ctx.request.extraction_text().trim(), MAX_SOURCE_EXCERPT_CHARS)
        );
        let task = TemporalTask { system };
        let outcome = map_refine(
            ctx.llm,
            &task,
            &content,
            &ctx.options(ctx.config.resolution_temperature),
            ctx.cancel,
        )
        .await;
        patch.absorb_engine(&outcome);
        windows.extend(outcome.items);
    }

    let enriched: Vec<EnrichedFact> = facts
        .iter()
        .enumerate()
        .map(|(index, fact)| {
            let window = if fact.is_existing() {
                TemporalWindow::default()
            } else {
                windows.get(&index).copied().unwrap_or_default()
            };
            EnrichedFact::new(fact.clone(), window)
        })
        .collect();

    let dated = enriched.iter().filter(|f| !f.temporal.is_empty()).count();
    info!(facts = enriched.len(), dated, "Temporal enrichment complete");
    patch.action(format!("Dated {} of {} facts", dated, enriched.len()));
    patch.enriched_facts = Some(enriched);
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;
    use crate::types::config::PipelineConfig;
    use crate::types::entity::{ExtractedEntity, ResolvedEntity};
    use crate::types::fact::{ExtractedFact, ResolvedFact};
    use crate::types::ingest::IngestRequest;
    use chrono::{Datelike, TimeZone, Utc};

    const NEEDLE: &str = "You infer when facts";

    fn state(facts: Vec<ResolvedFact>) -> PipelineState {
        PipelineState {
            resolved_facts: facts,
            ..Default::default()
        }
    }

    fn fact(text: &str) -> ExtractedFact {
        ExtractedFact::new(Uuid::new_v4(), Uuid::new_v4(), "RELATED_TO", text)
    }

    async fn run(llm: &MockLlm, state: &PipelineState) -> Vec<EnrichedFact> {
        let config = PipelineConfig::default();
        let request = IngestRequest::new("p1", "Title", "Alice joined Acme Corp in 2020.")
            .with_reference_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let ctx = StageContext::new(llm, &config, &request, None);
        enrich_temporal(&ctx, state).await.enriched_facts.unwrap()
    }

    #[test]
    fn test_window_rules() {
        let window = to_window(&RawTemporal {
            id: None,
            valid_at: Some(Value::String("2020".into())),
            invalid_at: Some(Value::String("2019-01-01".into())),
        });
        assert_eq!(window.valid_at.unwrap().year(), 2020);
        assert!(window.invalid_at.is_none());

        let window = to_window(&RawTemporal {
            id: None,
            valid_at: Some(Value::String("null".into())),
            invalid_at: Some(Value::String("last tuesday".into())),
        });
        assert!(window.is_empty());

        let window = to_window(&RawTemporal {
            id: None,
            valid_at: Some(serde_json::json!(2021)),
            invalid_at: None,
        });
        assert_eq!(window.valid_at.unwrap().year(), 2021);
    }

    #[tokio::test]
    async fn test_new_facts_get_windows() {
        let llm = MockLlm::new().respond_when(
            NEEDLE,
            r#"[{"id": 0, "valid_at": "2020-01-01", "invalid_at": null}, {"id": 1, "valid_at": "garbage"}]"#,
        );
        let facts = vec![
            ResolvedFact::new_fact(fact("Alice joined Acme in 2020")),
            ResolvedFact::new_fact(fact("Alice likes tea")),
        ];

        let enriched = run(&llm, &state(facts)).await;

        assert_eq!(enriched.len(), 2);
        assert_eq!(enriched[0].temporal.valid_at.unwrap().year(), 2020);
        assert!(enriched[1].temporal.is_empty());

        let system = llm.calls()[0].system_prompt().unwrap().to_string();
        assert!(system.contains("Reference time: 2024-05-01T12:00:00Z"));
        assert!(system.contains("Alice joined Acme Corp in 2020."));
    }

    #[tokio::test]
    async fn test_existing_facts_are_not_sent() {
        let llm = MockLlm::new().respond_when(NEEDLE, r#"[{"valid_at": "2019"}]"#);
        let facts = vec![
            ResolvedFact::existing(fact("Already stored"), Uuid::new_v4()),
            ResolvedFact::new_fact(fact("Alice moved to Berlin")),
        ];

        let enriched = run(&llm, &state(facts)).await;

        assert!(enriched[0].temporal.is_empty());
        assert!(enriched[0].is_existing());
        // The reply has no id, so it lands on the only record sent: [1]
        assert_eq!(enriched[1].temporal.valid_at.unwrap().year(), 2019);
        let user = llm.calls()[0].user_prompt().unwrap().to_string();
        assert!(!user.contains("Already stored"));
    }

    #[tokio::test]
    async fn test_only_existing_facts_skip_model() {
        let llm = MockLlm::new();
        let facts = vec![ResolvedFact::existing(fact("Stored"), Uuid::new_v4())];

        let enriched = run(&llm, &state(facts)).await;

        assert_eq!(enriched.len(), 1);
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_entity_names_in_records() {
        let alice = ResolvedEntity::new_entity(ExtractedEntity::new("Alice", "Person"));
        let acme = ResolvedEntity::new_entity(ExtractedEntity::new("Acme", "Organization"));
        let fact = ExtractedFact::new(alice.uuid(), acme.uuid(), "WORKS_FOR", "Alice works at Acme");
        let state = PipelineState {
            resolved_entities: vec![alice, acme],
            resolved_facts: vec![ResolvedFact::new_fact(fact)],
            ..Default::default()
        };
        let llm = MockLlm::new().respond_when(NEEDLE, "[]");

        run(&llm, &state).await;

        let user = llm.calls()[0].user_prompt().unwrap().to_string();
        assert!(user.contains("[0] Alice works at Acme (Alice -WORKS_FOR-> Acme)"));
    }
}
