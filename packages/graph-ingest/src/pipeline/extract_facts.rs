//! Fact extraction: directed relationships between resolved entities.
//!
//! The model names endpoints by text, so every proposal is mapped back to
//! an entity uuid through a tolerant name index. Proposals naming unknown
//! entities, or relating an entity to itself, are dropped.
//!
//! The entity listing rides in the system prompt. When it is too large for
//! one prompt, each pass runs once per batch of entities; the name index
//! still covers every entity, so a fact may name one outside its batch.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use super::chunk::Chunk;
use super::extract_entities::{render_request_context, FIRST_PERSON};
use super::map_refine::{listing_batches, map_refine, RefineTask};
use super::parse::parse_items;
use super::prompts::{FACT_EXTRACTION_PROMPT, UNCONNECTED_FACTS_PROMPT};
use super::state::{PipelineState, StageContext, StagePatch};
use crate::error::ParseError;
use crate::traits::llm::LanguageModel;
use crate::types::entity::ResolvedEntity;
use crate::types::fact::ExtractedFact;
use crate::utils::text::{clean_entity_name, normalize_name};

#[derive(Debug, Clone, Deserialize)]
struct RawFact {
    #[serde(alias = "source", alias = "from", alias = "source_name")]
    source_entity: String,
    #[serde(alias = "destination", alias = "target", alias = "to", alias = "destination_name")]
    destination_entity: String,
    #[serde(default, alias = "relation", alias = "type", alias = "relationship")]
    relation_type: Option<String>,
    #[serde(default, alias = "fact", alias = "text", alias = "description")]
    fact_text: Option<String>,
    #[serde(default)]
    attributes: Option<Value>,
}

/// Maps the many ways a model may spell an entity name back to its uuid.
#[derive(Debug, Default)]
pub(crate) struct NameIndex {
    ids: HashMap<String, Uuid>,
    names: HashMap<Uuid, String>,
}

impl NameIndex {
    pub(crate) fn new(entities: &[ResolvedEntity]) -> Self {
        let mut index = Self::default();
        for resolved in entities {
            index.names.insert(resolved.uuid(), resolved.final_name.clone());
            for name in [&resolved.final_name, &resolved.entity.name] {
                for key in Self::keys(name) {
                    index.ids.entry(key).or_insert(resolved.uuid());
                }
            }
        }
        index
    }

    /// Let first-person pronouns stand for the graph owner's entity.
    pub(crate) fn with_owner_aliases(mut self, entities: &[ResolvedEntity], owner: &str) -> Self {
        let owner_key = normalize_name(owner);
        let found = entities.iter().find(|e| {
            normalize_name(&e.final_name) == owner_key || normalize_name(&e.entity.name) == owner_key
        });
        if let Some(owner) = found {
            for pronoun in FIRST_PERSON {
                self.ids.insert(pronoun.to_string(), owner.uuid());
            }
        }
        self
    }

    fn keys(name: &str) -> Vec<String> {
        let trimmed = name.trim();
        vec![
            trimmed.to_string(),
            trimmed.to_lowercase(),
            normalize_name(trimmed),
            normalize_name(&clean_entity_name(trimmed)),
        ]
    }

    /// Find the entity a model-written name refers to.
    pub(crate) fn lookup(&self, name: &str) -> Option<Uuid> {
        Self::keys(name)
            .into_iter()
            .filter(|key| !key.is_empty())
            .find_map(|key| self.ids.get(&key).copied())
    }

    pub(crate) fn name(&self, id: Uuid) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or("?")
    }
}

#[derive(Debug, Clone)]
enum FactPass {
    /// First pass over every entity
    All,
    /// Follow-up restricted to facts touching these entities
    Unconnected(HashSet<Uuid>),
}

fn entity_line(resolved: &ResolvedEntity) -> String {
    format!("- {} ({})", resolved.final_name, resolved.entity.node_type)
}

struct FactExtractionTask<'a> {
    /// Entities shown in this call's system prompt
    listed: &'a [ResolvedEntity],
    index: &'a NameIndex,
    context: String,
    pass: &'a FactPass,
}

impl FactExtractionTask<'_> {
    fn to_fact(&self, raw: RawFact) -> Option<ExtractedFact> {
        let Some(source) = self.index.lookup(&raw.source_entity) else {
            debug!(name = %raw.source_entity, "Dropping fact with unknown source entity");
            return None;
        };
        let Some(destination) = self.index.lookup(&raw.destination_entity) else {
            debug!(name = %raw.destination_entity, "Dropping fact with unknown destination entity");
            return None;
        };
        if source == destination {
            return None;
        }
        if let FactPass::Unconnected(targets) = self.pass {
            if !targets.contains(&source) && !targets.contains(&destination) {
                return None;
            }
        }

        let relation = raw.relation_type.unwrap_or_default();
        let mut fact = ExtractedFact::new(source, destination, &relation, "");
        fact.fact_text = match raw.fact_text.map(|t| t.trim().to_string()) {
            Some(text) if !text.is_empty() => text,
            _ => format!(
                "{} {} {}",
                self.index.name(source),
                fact.relation_type.to_lowercase().replace('_', " "),
                self.index.name(destination)
            ),
        };
        if let Some(Value::Object(attributes)) = raw.attributes {
            fact.attributes = attributes;
        }
        Some(fact)
    }
}

impl RefineTask for FactExtractionTask<'_> {
    type Item = ExtractedFact;

    fn name(&self) -> &str {
        match self.pass {
            FactPass::All => "fact extraction",
            FactPass::Unconnected(_) => "unconnected fact extraction",
        }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = match self.pass {
            FactPass::All => FACT_EXTRACTION_PROMPT.to_string(),
            FactPass::Unconnected(_) => format!("{}\nEntities:\n", UNCONNECTED_FACTS_PROMPT),
        };
        for resolved in self.listed {
            prompt.push_str(&entity_line(resolved));
            prompt.push('\n');
        }
        if let FactPass::Unconnected(targets) = self.pass {
            prompt.push_str("\nUnconnected entities:\n");
            for resolved in self.listed.iter().filter(|e| targets.contains(&e.uuid())) {
                prompt.push_str(&format!("- {}\n", resolved.final_name));
            }
        }
        prompt
    }

    fn user_prompt(&self, chunk: &Chunk, previous: &[&ExtractedFact], error_context: Option<&str>) -> String {
        let mut prompt = self.context.clone();

        if !previous.is_empty() {
            prompt.push_str("\nFacts found so far:\n");
            for fact in previous {
                prompt.push_str(&format!(
                    "- {} -{}-> {}\n",
                    self.index.name(fact.source_entity_id),
                    fact.relation_type,
                    self.index.name(fact.destination_entity_id)
                ));
            }
        }

        if let Some(error) = error_context {
            prompt.push_str(&format!("\nYour previous attempt failed: {}\n", error));
        }

        prompt.push_str("\nText:\n");
        prompt.push_str(&chunk.text);
        prompt
    }

    fn parse(&self, response: &str, _chunk: &Chunk) -> Result<Vec<ExtractedFact>, ParseError> {
        let parsed = parse_items::<RawFact>(response, &["facts", "relationships", "results"])?;
        if parsed.skipped > 0 {
            debug!(skipped = parsed.skipped, "Skipped malformed fact objects");
        }
        Ok(parsed.items.into_iter().filter_map(|raw| self.to_fact(raw)).collect())
    }

    fn dedupe_key(&self, fact: &ExtractedFact) -> Option<String> {
        Some(fact.merge_key())
    }

    fn merge(&self, existing: &mut ExtractedFact, incoming: ExtractedFact) {
        existing.absorb(incoming);
    }
}

/// Run one pass, one call sequence per batch of listed entities.
async fn run_pass<L>(
    ctx: &StageContext<'_, L>,
    entities: &[ResolvedEntity],
    index: &NameIndex,
    pass: &FactPass,
    patch: &mut StagePatch,
) -> IndexMap<String, ExtractedFact>
where
    L: LanguageModel + ?Sized,
{
    let options = ctx.options(ctx.config.extraction_temperature);
    let text = ctx.request.extraction_text();

    let (base, listing): (String, Vec<String>) = match pass {
        FactPass::All => (
            FACT_EXTRACTION_PROMPT.to_string(),
            entities.iter().map(entity_line).collect(),
        ),
        FactPass::Unconnected(targets) => (
            format!("{}\nEntities:\n\nUnconnected entities:\n", UNCONNECTED_FACTS_PROMPT),
            entities
                .iter()
                .map(|e| {
                    if targets.contains(&e.uuid()) {
                        format!("{}\n- {}", entity_line(e), e.final_name)
                    } else {
                        entity_line(e)
                    }
                })
                .collect(),
        ),
    };
    let batches = listing_batches(&base, &listing, &options);
    if batches.len() > 1 {
        debug!(entities = entities.len(), batches = batches.len(), "Entity listing split across calls");
    }

    let mut facts: IndexMap<String, ExtractedFact> = IndexMap::new();
    for batch in batches {
        if patch.cancelled {
            break;
        }
        let listed = &entities[batch];
        if let FactPass::Unconnected(targets) = pass {
            if !listed.iter().any(|e| targets.contains(&e.uuid())) {
                continue;
            }
        }

        let task = FactExtractionTask {
            listed,
            index,
            context: render_request_context(ctx.request, ctx.config),
            pass,
        };
        let outcome = map_refine(ctx.llm, &task, text, &options, ctx.cancel).await;
        patch.absorb_engine(&outcome);
        merge_facts(&mut facts, outcome.items);
    }
    facts
}

fn merge_facts(facts: &mut IndexMap<String, ExtractedFact>, incoming: Vec<ExtractedFact>) {
    for fact in incoming {
        match facts.get_mut(&fact.merge_key()) {
            Some(existing) => existing.absorb(fact),
            None => {
                facts.insert(fact.merge_key(), fact);
            }
        }
    }
}

/// Extract facts between `state.resolved_entities`.
pub async fn extract_facts<L>(ctx: &StageContext<'_, L>, state: &PipelineState) -> StagePatch
where
    L: LanguageModel + ?Sized,
{
    let mut patch = StagePatch::new();
    let entities = &state.resolved_entities;

    if entities.len() < 2 {
        debug!(entities = entities.len(), "Too few entities for facts");
        patch.facts = Some(Vec::new());
        return patch;
    }

    let mut index = NameIndex::new(entities);
    if ctx.request.source_type.is_personal_note() {
        index = index.with_owner_aliases(entities, &ctx.config.owner_entity_name);
    }

    let mut facts = run_pass(ctx, entities, &index, &FactPass::All, &mut patch).await;
    let first_pass = facts.len();

    if ctx.config.unconnected_entity_pass && !patch.cancelled {
        let unconnected: HashSet<Uuid> = entities
            .iter()
            .map(|e| e.uuid())
            .filter(|id| !facts.values().any(|f| f.touches(*id)))
            .collect();

        if !unconnected.is_empty() {
            debug!(unconnected = unconnected.len(), "Running unconnected entity pass");
            let pass = FactPass::Unconnected(unconnected);
            let follow_up = run_pass(ctx, entities, &index, &pass, &mut patch).await;
            merge_facts(&mut facts, follow_up.into_values().collect());
        }
    }

    let facts: Vec<ExtractedFact> = facts.into_values().collect();
    info!(
        facts = facts.len(),
        first_pass,
        follow_up = facts.len() - first_pass,
        "Fact extraction complete"
    );
    patch.action(format!(
        "Extracted {} fact{}",
        facts.len(),
        if facts.len() == 1 { "" } else { "s" }
    ));
    patch.facts = Some(facts);
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;
    use crate::types::config::PipelineConfig;
    use crate::types::entity::ExtractedEntity;
    use crate::types::graph::SourceType;
    use crate::types::ingest::IngestRequest;

    const NEEDLE: &str = "You extract relationships";
    const FOLLOW_UP: &str = "have no facts yet";

    fn entities(names: &[&str]) -> Vec<ResolvedEntity> {
        names
            .iter()
            .map(|n| ResolvedEntity::new_entity(ExtractedEntity::new(*n, "Thing")))
            .collect()
    }

    async fn run(llm: &MockLlm, config: &PipelineConfig, resolved: Vec<ResolvedEntity>) -> StagePatch {
        let request = IngestRequest::new("p1", "Title", "Alice joined Acme Corp in 2020. Bob lives in Paris.");
        let state = PipelineState {
            resolved_entities: resolved,
            ..Default::default()
        };
        let ctx = StageContext::new(llm, config, &request, None);
        extract_facts(&ctx, &state).await
    }

    #[test]
    fn test_name_index_is_tolerant() {
        let resolved = entities(&["Acme Corp", "Alice"]);
        let index = NameIndex::new(&resolved);

        assert_eq!(index.lookup("Acme Corp"), Some(resolved[0].uuid()));
        assert_eq!(index.lookup("acme corp"), Some(resolved[0].uuid()));
        assert_eq!(index.lookup("Acme, Corp."), Some(resolved[0].uuid()));
        assert_eq!(index.lookup("the company Acme Corp"), Some(resolved[0].uuid()));
        assert_eq!(index.lookup("Initech"), None);
    }

    #[test]
    fn test_name_index_knows_final_names() {
        let resolved = vec![ResolvedEntity::new_entity(ExtractedEntity::new("Bob", "Person"))
            .with_final_name("Robert Smith")];
        let index = NameIndex::new(&resolved);

        assert_eq!(index.lookup("Bob"), Some(resolved[0].uuid()));
        assert_eq!(index.lookup("Robert Smith"), Some(resolved[0].uuid()));
        assert_eq!(index.name(resolved[0].uuid()), "Robert Smith");
    }

    #[tokio::test]
    async fn test_facts_map_to_entity_ids() {
        let resolved = entities(&["Alice", "Acme Corp"]);
        let llm = MockLlm::new().respond_when(
            NEEDLE,
            r#"[{"source_entity": "Alice", "destination_entity": "acme corp", "relation_type": "works for", "fact_text": "Alice joined Acme Corp in 2020."},
                {"source_entity": "Alice", "destination_entity": "Initech", "relation_type": "KNOWS"},
                {"source_entity": "Alice", "destination_entity": "Alice", "relation_type": "IS"}]"#,
        );

        let patch = run(&llm, &PipelineConfig::default(), resolved.clone()).await;
        let facts = patch.facts.unwrap();

        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].source_entity_id, resolved[0].uuid());
        assert_eq!(facts[0].destination_entity_id, resolved[1].uuid());
        assert_eq!(facts[0].relation_type, "WORKS_FOR");
        // Both entities are connected, so no follow-up pass
        assert_eq!(llm.calls_matching(FOLLOW_UP), 0);
    }

    #[tokio::test]
    async fn test_blank_fact_text_is_synthesized() {
        let resolved = entities(&["Alice", "Acme Corp"]);
        let llm = MockLlm::new().respond_when(
            NEEDLE,
            r#"[{"source": "Alice", "target": "Acme Corp", "relation": "WORKS_FOR", "fact": "  "}]"#,
        );

        let patch = run(&llm, &PipelineConfig::default(), resolved).await;
        assert_eq!(patch.facts.unwrap()[0].fact_text, "Alice works for Acme Corp");
    }

    #[tokio::test]
    async fn test_unconnected_pass_adds_facts() {
        let resolved = entities(&["Alice", "Acme Corp", "Bob", "Paris"]);
        let llm = MockLlm::new()
            .respond_when(
                NEEDLE,
                r#"[{"source_entity": "Alice", "destination_entity": "Acme Corp", "relation_type": "WORKS_FOR", "fact_text": "Alice joined Acme Corp."}]"#,
            )
            .respond_when(
                FOLLOW_UP,
                r#"[{"source_entity": "Bob", "destination_entity": "Paris", "relation_type": "LIVES_IN", "fact_text": "Bob lives in Paris."},
                    {"source_entity": "Alice", "destination_entity": "Acme Corp", "relation_type": "FOUNDED", "fact_text": "unrelated"}]"#,
            );

        let patch = run(&llm, &PipelineConfig::default(), resolved).await;
        let facts = patch.facts.unwrap();

        let relations: Vec<&str> = facts.iter().map(|f| f.relation_type.as_str()).collect();
        assert_eq!(relations, vec!["WORKS_FOR", "LIVES_IN"]);

        let follow_up = llm
            .calls()
            .into_iter()
            .find(|c| c.system_prompt().unwrap().contains(FOLLOW_UP))
            .unwrap();
        let system = follow_up.system_prompt().unwrap().to_string();
        let unconnected = system.split("Unconnected entities:").nth(1).unwrap();
        assert!(unconnected.contains("Bob"));
        assert!(!unconnected.contains("Alice"));
    }

    #[tokio::test]
    async fn test_unconnected_pass_can_be_disabled() {
        let resolved = entities(&["Alice", "Acme Corp", "Bob"]);
        let llm = MockLlm::new().respond_when(NEEDLE, "[]");
        let config = PipelineConfig::default().with_unconnected_entity_pass(false);

        let patch = run(&llm, &config, resolved).await;

        assert!(patch.facts.unwrap().is_empty());
        assert_eq!(llm.calls_matching(FOLLOW_UP), 0);
    }

    #[test]
    fn test_owner_aliases_cover_pronouns() {
        let resolved = entities(&["Sam", "Rust"]);
        let index = NameIndex::new(&resolved).with_owner_aliases(&resolved, "sam");

        assert_eq!(index.lookup("I"), Some(resolved[0].uuid()));
        assert_eq!(index.lookup("myself"), Some(resolved[0].uuid()));
        assert_eq!(NameIndex::new(&resolved).lookup("me"), None);
    }

    #[tokio::test]
    async fn test_note_facts_resolve_first_person_to_owner() {
        let resolved = entities(&["Sam", "Rust"]);
        let llm = MockLlm::new().respond_when(
            NEEDLE,
            r#"[{"source_entity": "I", "destination_entity": "Rust", "relation_type": "IS_LEARNING", "fact_text": "I started learning Rust."}]"#,
        );
        let config = PipelineConfig::default().with_owner_entity_name("Sam");
        let request = IngestRequest::new("n1", "Journal", "I started learning Rust.").with_source_type(SourceType::Note);
        let state = PipelineState {
            resolved_entities: resolved.clone(),
            ..Default::default()
        };
        let ctx = StageContext::new(&llm, &config, &request, None);

        let facts = extract_facts(&ctx, &state).await.facts.unwrap();

        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].source_entity_id, resolved[0].uuid());
        assert_eq!(facts[0].destination_entity_id, resolved[1].uuid());
    }

    #[tokio::test]
    async fn test_large_entity_listing_is_batched() {
        let names: Vec<String> = (0..120).map(|i| format!("Community garden plot number {}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let resolved = entities(&names);
        let llm = MockLlm::new()
            .with_max_model_tokens(4096)
            .respond_when(
                "Community garden plot number 119 ",
                r#"[{"source_entity": "Community garden plot number 0", "destination_entity": "Community garden plot number 119", "relation_type": "BORDERS"}]"#,
            );
        let config = PipelineConfig::default().with_unconnected_entity_pass(false);

        let patch = run(&llm, &config, resolved.clone()).await;

        assert!(patch.errors.is_empty(), "errors: {:?}", patch.errors);
        let facts = patch.facts.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].source_entity_id, resolved[0].uuid());
        assert_eq!(facts[0].destination_entity_id, resolved[119].uuid());

        let options = config.map_refine_options(4096, config.extraction_temperature);
        let calls = llm.calls();
        assert!(calls.len() > 1);
        for call in &calls {
            let system = crate::pipeline::chunk::estimate_tokens(call.system_prompt().unwrap());
            assert!(options.chunk_budget(system) >= options.min_chunk_tokens);
        }
    }

    #[tokio::test]
    async fn test_single_entity_makes_no_calls() {
        let llm = MockLlm::new();
        let patch = run(&llm, &PipelineConfig::default(), entities(&["Alice"])).await;

        assert!(patch.facts.unwrap().is_empty());
        assert!(llm.calls().is_empty());
    }
}
