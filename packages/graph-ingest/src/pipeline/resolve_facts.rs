//! Fact resolution: match extracted facts against existing edges.
//!
//! Only facts whose endpoints both resolved to existing nodes can duplicate
//! a stored edge; everything else is new without asking the model. Among
//! the rest, an edge connecting the same nodes with the same type is a
//! deterministic match, and the remainder go to the model.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::chunk::Chunk;
use super::map_refine::{listing_batches, map_refine, RefineTask};
use super::parse::parse_items;
use super::prompts::FACT_RESOLUTION_PROMPT;
use super::records::{assign_record_ids, format_record, parse_record_id, record_ids};
use super::state::{PipelineState, StageContext, StagePatch};
use crate::error::ParseError;
use crate::traits::llm::LanguageModel;
use crate::types::fact::{ExtractedFact, ResolvedFact};
use crate::types::graph::Edge;
use crate::utils::text::truncate_with_ellipsis;

const MAX_FACT_CHARS: usize = 300;

#[derive(Debug, Clone, Deserialize)]
struct RawDecision {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "isDuplicate", alias = "duplicate")]
    is_duplicate: bool,
    #[serde(default, alias = "existingId", alias = "existing_edge_id")]
    existing_id: Option<String>,
}

/// A fact headed to the model, with its endpoints as stored node ids.
struct PendingFact {
    index: usize,
    source_node: Uuid,
    destination_node: Uuid,
}

struct FactResolutionTask<'a> {
    candidates: &'a [Edge],
    node_names: &'a HashMap<Uuid, String>,
    /// Endpoints per record id
    endpoints: HashMap<usize, (Uuid, Uuid)>,
    either_direction: bool,
}

fn describe_edge(edge: &Edge, node_names: &HashMap<Uuid, String>) -> String {
    let name = |id: Uuid| node_names.get(&id).cloned().unwrap_or_else(|| id.to_string());
    format!(
        "- id: {} | {} -{}-> {}: {}",
        edge.id,
        name(edge.source_id),
        edge.edge_type,
        name(edge.destination_id),
        truncate_with_ellipsis(&edge.fact_text, MAX_FACT_CHARS)
    )
}

impl FactResolutionTask<'_> {
    /// Accept a verdict only if the edge is a candidate joining the fact's nodes.
    fn validate(&self, record: usize, raw: RawDecision) -> Option<Uuid> {
        if !raw.is_duplicate {
            return None;
        }
        let edge_id = Uuid::parse_str(raw.existing_id?.trim()).ok()?;
        let (source, destination) = self.endpoints.get(&record)?;
        self.candidates
            .iter()
            .find(|e| e.id == edge_id)
            .filter(|e| e.connects(*source, *destination, self.either_direction))
            .map(|e| e.id)
    }
}

impl RefineTask for FactResolutionTask<'_> {
    type Item = (usize, Option<Uuid>);

    fn name(&self) -> &str {
        "fact resolution"
    }

    fn system_prompt(&self) -> String {
        let mut prompt = FACT_RESOLUTION_PROMPT.to_string();
        for edge in self.candidates {
            prompt.push_str(&describe_edge(edge, self.node_names));
            prompt.push('\n');
        }
        prompt
    }

    fn user_prompt(&self, chunk: &Chunk, _previous: &[&(usize, Option<Uuid>)], error_context: Option<&str>) -> String {
        let mut prompt = String::new();
        if let Some(error) = error_context {
            prompt.push_str(&format!("Your previous attempt failed: {}\n\n", error));
        }
        prompt.push_str("New facts:\n");
        prompt.push_str(&chunk.text);
        prompt
    }

    fn parse(&self, response: &str, chunk: &Chunk) -> Result<Vec<(usize, Option<Uuid>)>, ParseError> {
        let parsed = parse_items::<RawDecision>(response, &["decisions", "facts", "results"])?;
        let decisions = parsed
            .items
            .into_iter()
            .map(|raw| (raw.id.as_ref().and_then(parse_record_id), raw))
            .collect();

        Ok(assign_record_ids(decisions, &record_ids(&chunk.text))
            .into_iter()
            .map(|(record, raw)| (record, self.validate(record, raw)))
            .collect())
    }

    fn dedupe_key(&self, decision: &(usize, Option<Uuid>)) -> Option<String> {
        Some(decision.0.to_string())
    }

    fn line_oriented(&self) -> bool {
        true
    }
}

/// Resolve `state.facts` against `state.candidate_edges`.
pub async fn resolve_facts<L>(ctx: &StageContext<'_, L>, state: &PipelineState) -> StagePatch
where
    L: LanguageModel + ?Sized,
{
    let mut patch = StagePatch::new();
    let either_direction = ctx.config.bidirectional_fact_matching;

    // Entity uuid -> stored node id, for entities that resolved to existing nodes
    let stored: HashMap<Uuid, Uuid> = state
        .resolved_entities
        .iter()
        .filter_map(|e| e.existing_id().map(|node| (e.uuid(), node)))
        .collect();
    let entity_names: HashMap<Uuid, &str> = state
        .resolved_entities
        .iter()
        .map(|e| (e.uuid(), e.final_name.as_str()))
        .collect();

    let mut resolved: Vec<Option<ResolvedFact>> = vec![None; state.facts.len()];
    let mut pending = Vec::new();
    let mut deterministic = 0;

    for (index, fact) in state.facts.iter().enumerate() {
        let endpoints = (
            stored.get(&fact.source_entity_id),
            stored.get(&fact.destination_entity_id),
        );
        let (Some(&source_node), Some(&destination_node)) = endpoints else {
            // New or unknown endpoint: no stored edge can match
            continue;
        };

        let exact = state.candidate_edges.iter().find(|edge| {
            edge.edge_type == fact.relation_type && edge.connects(source_node, destination_node, either_direction)
        });
        match exact {
            Some(edge) => {
                deterministic += 1;
                resolved[index] = Some(ResolvedFact::existing(fact.clone(), edge.id));
            }
            None => pending.push(PendingFact {
                index,
                source_node,
                destination_node,
            }),
        }
    }

    // Only edges joining some pending pair of nodes can be a duplicate
    let relevant: Vec<Edge> = state
        .candidate_edges
        .iter()
        .filter(|edge| pending.iter().any(|p| edge.connects(p.source_node, p.destination_node, either_direction)))
        .cloned()
        .collect();

    let mut ai_matched = 0;
    if !relevant.is_empty() {
        let mut node_names: HashMap<Uuid, String> = state
            .resolved_entities
            .iter()
            .filter_map(|e| e.existing_id().map(|node| (node, e.final_name.clone())))
            .collect();
        for node in &state.candidate_nodes {
            node_names.entry(node.id).or_insert_with(|| node.name.clone());
        }

        let describe = |fact: &ExtractedFact| {
            format!(
                "{} -{}-> {}: {}",
                entity_names.get(&fact.source_entity_id).copied().unwrap_or("?"),
                fact.relation_type,
                entity_names.get(&fact.destination_entity_id).copied().unwrap_or("?"),
                truncate_with_ellipsis(&fact.fact_text, MAX_FACT_CHARS)
            )
        };
        let options = ctx.options(ctx.config.resolution_temperature);
        let listing: Vec<String> = relevant.iter().map(|edge| describe_edge(edge, &node_names)).collect();
        let batches = listing_batches(FACT_RESOLUTION_PROMPT, &listing, &options);
        if batches.len() > 1 {
            debug!(
                candidates = relevant.len(),
                batches = batches.len(),
                "Candidate edges split across calls"
            );
        }

        for batch in batches {
            let open: Vec<&PendingFact> = pending.iter().filter(|p| resolved[p.index].is_none()).collect();
            if open.is_empty() || patch.cancelled {
                break;
            }
            let content: String = open
                .iter()
                .map(|p| format_record(p.index, &describe(&state.facts[p.index])))
                .collect();

            let task = FactResolutionTask {
                candidates: &relevant[batch],
                node_names: &node_names,
                endpoints: open
                    .iter()
                    .map(|p| (p.index, (p.source_node, p.destination_node)))
                    .collect(),
                either_direction,
            };
            let outcome = map_refine(ctx.llm, &task, &content, &options, ctx.cancel).await;
            patch.absorb_engine(&outcome);

            for (record, edge_id) in outcome.items {
                if let (Some(edge_id), Some(fact)) = (edge_id, state.facts.get(record)) {
                    if resolved[record].is_none() {
                        ai_matched += 1;
                        resolved[record] = Some(ResolvedFact::existing(fact.clone(), edge_id));
                    }
                }
            }
        }
    }

    let resolved: Vec<ResolvedFact> = resolved
        .into_iter()
        .zip(state.facts.iter())
        .map(|(resolved, fact)| resolved.unwrap_or_else(|| ResolvedFact::new_fact(fact.clone())))
        .collect();

    let existing = resolved.iter().filter(|f| f.is_existing()).count();
    info!(
        facts = resolved.len(),
        existing,
        deterministic,
        ai_matched,
        candidates = state.candidate_edges.len(),
        relevant = relevant.len(),
        "Fact resolution complete"
    );
    patch.action(format!(
        "Resolved {} facts: {} new, {} existing",
        resolved.len(),
        resolved.len() - existing,
        existing
    ));
    patch.resolved_facts = Some(resolved);
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;
    use crate::types::config::PipelineConfig;
    use crate::types::entity::{ExtractedEntity, ResolvedEntity};
    use crate::types::ingest::IngestRequest;

    const NEEDLE: &str = "duplicate existing graph edges";

    struct Fixture {
        alice: ResolvedEntity,
        acme: ResolvedEntity,
        alice_node: Uuid,
        acme_node: Uuid,
    }

    fn fixture() -> Fixture {
        let alice_node = Uuid::new_v4();
        let acme_node = Uuid::new_v4();
        Fixture {
            alice: ResolvedEntity::existing(ExtractedEntity::new("Alice", "Person"), alice_node, "Alice"),
            acme: ResolvedEntity::existing(ExtractedEntity::new("Acme", "Organization"), acme_node, "Acme"),
            alice_node,
            acme_node,
        }
    }

    async fn run(llm: &MockLlm, config: &PipelineConfig, state: &PipelineState) -> StagePatch {
        let request = IngestRequest::new("p1", "Title", "content");
        let ctx = StageContext::new(llm, config, &request, None);
        resolve_facts(&ctx, state).await
    }

    #[tokio::test]
    async fn test_same_endpoints_and_type_match_without_model() {
        let f = fixture();
        let edge = Edge::new(f.alice_node, f.acme_node, "WORKS_FOR", "Alice works at Acme");
        let state = PipelineState {
            facts: vec![ExtractedFact::new(f.alice.uuid(), f.acme.uuid(), "WORKS_FOR", "Alice is at Acme")],
            resolved_entities: vec![f.alice, f.acme],
            candidate_edges: vec![edge.clone()],
            ..Default::default()
        };
        let llm = MockLlm::new();

        let patch = run(&llm, &PipelineConfig::default(), &state).await;

        assert_eq!(patch.resolved_facts.unwrap()[0].existing_id(), Some(edge.id));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reverse_direction_respects_config() {
        let f = fixture();
        let edge = Edge::new(f.acme_node, f.alice_node, "KNOWS", "Acme knows Alice");
        let state = PipelineState {
            facts: vec![ExtractedFact::new(f.alice.uuid(), f.acme.uuid(), "KNOWS", "Alice knows Acme")],
            resolved_entities: vec![f.alice, f.acme],
            candidate_edges: vec![edge.clone()],
            ..Default::default()
        };
        let llm = MockLlm::new().respond_when(NEEDLE, r#"[{"id": 0, "is_duplicate": false}]"#);

        let patch = run(&llm, &PipelineConfig::default(), &state).await;
        assert!(patch.resolved_facts.unwrap()[0].is_existing());

        let config = PipelineConfig::default().with_bidirectional_fact_matching(false);
        let patch = run(&llm, &config, &state).await;
        assert!(!patch.resolved_facts.unwrap()[0].is_existing());
    }

    #[tokio::test]
    async fn test_new_endpoint_is_always_new() {
        let f = fixture();
        let bob = ResolvedEntity::new_entity(ExtractedEntity::new("Bob", "Person"));
        let state = PipelineState {
            facts: vec![ExtractedFact::new(bob.uuid(), f.acme.uuid(), "WORKS_FOR", "Bob works at Acme")],
            resolved_entities: vec![bob, f.acme],
            candidate_edges: vec![Edge::new(f.alice_node, f.acme_node, "WORKS_FOR", "x")],
            ..Default::default()
        };
        let llm = MockLlm::new();

        let patch = run(&llm, &PipelineConfig::default(), &state).await;

        assert!(!patch.resolved_facts.unwrap()[0].is_existing());
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_model_verdict_is_validated() {
        let f = fixture();
        let employs = Edge::new(f.acme_node, f.alice_node, "EMPLOYS", "Acme employs Alice");
        let unrelated = Edge::new(Uuid::new_v4(), Uuid::new_v4(), "WORKS_FOR", "someone else");
        let state = PipelineState {
            facts: vec![
                ExtractedFact::new(f.alice.uuid(), f.acme.uuid(), "WORKS_FOR", "Alice works for Acme"),
                ExtractedFact::new(f.alice.uuid(), f.acme.uuid(), "FOUNDED", "Alice founded Acme"),
            ],
            resolved_entities: vec![f.alice, f.acme],
            candidate_edges: vec![employs.clone(), unrelated.clone()],
            ..Default::default()
        };
        let response = format!(
            r#"[{{"id": 0, "is_duplicate": true, "existing_id": "{}"}},
                {{"id": 1, "is_duplicate": true, "existing_id": "{}"}}]"#,
            employs.id, unrelated.id
        );
        let llm = MockLlm::new().respond_when(NEEDLE, response);

        let patch = run(&llm, &PipelineConfig::default(), &state).await;
        let resolved = patch.resolved_facts.unwrap();

        assert_eq!(resolved[0].existing_id(), Some(employs.id));
        assert!(!resolved[1].is_existing());

        let call = &llm.calls()[0];
        assert!(call.system_prompt().unwrap().contains("Acme -EMPLOYS-> Alice"));
        assert!(call.user_prompt().unwrap().contains("[0] Alice -WORKS_FOR-> Acme"));
    }

    #[tokio::test]
    async fn test_large_edge_listing_is_batched() {
        let f = fixture();
        let detail = "Met again at the quarterly partner summit and discussed the roadmap. ".repeat(5);
        let edges: Vec<Edge> = (0..30)
            .map(|i| Edge::new(f.alice_node, f.acme_node, format!("MET_{}", i), detail.clone()))
            .collect();
        let last = edges[29].clone();
        let state = PipelineState {
            facts: vec![ExtractedFact::new(f.alice.uuid(), f.acme.uuid(), "VISITED", "Alice visited Acme")],
            resolved_entities: vec![f.alice, f.acme],
            candidate_edges: edges,
            ..Default::default()
        };
        let response = format!(r#"[{{"id": 0, "is_duplicate": true, "existing_id": "{}"}}]"#, last.id);
        let llm = MockLlm::new()
            .with_max_model_tokens(4096)
            .respond_when(last.id.to_string(), response);

        let config = PipelineConfig::default();
        let patch = run(&llm, &config, &state).await;

        assert!(patch.errors.is_empty(), "errors: {:?}", patch.errors);
        assert_eq!(patch.resolved_facts.unwrap()[0].existing_id(), Some(last.id));

        let options = config.map_refine_options(4096, config.resolution_temperature);
        let calls = llm.calls();
        assert!(calls.len() > 1);
        for call in &calls {
            let system = crate::pipeline::chunk::estimate_tokens(call.system_prompt().unwrap());
            assert!(options.chunk_budget(system) >= options.min_chunk_tokens);
        }
    }
}
