//! Entity resolution: match extracted entities against existing nodes.
//!
//! Exact (case-insensitive) name matches are settled without the model.
//! The rest are sent as numbered records alongside the candidate nodes;
//! anything the model does not positively match to a candidate is new.
//! When the candidate listing is too large for one system prompt it is
//! split into batches, and each batch only sees the records still open.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::chunk::Chunk;
use super::map_refine::{listing_batches, map_refine, RefineTask};
use super::parse::parse_items;
use super::prompts::ENTITY_RESOLUTION_PROMPT;
use super::records::{assign_record_ids, format_record, parse_record_id, record_ids};
use super::state::{PipelineState, StageContext, StagePatch};
use crate::error::ParseError;
use crate::traits::llm::LanguageModel;
use crate::types::entity::{ExtractedEntity, ResolvedEntity};
use crate::types::graph::Node;
use crate::utils::text::{clean_entity_name, truncate_with_ellipsis};

const MAX_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Deserialize)]
struct RawDecision {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "isDuplicate", alias = "duplicate")]
    is_duplicate: bool,
    #[serde(default, alias = "existingId", alias = "existing_node_id")]
    existing_id: Option<String>,
    #[serde(default, alias = "finalName", alias = "name")]
    final_name: Option<String>,
}

/// One record's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDecision {
    pub record: usize,
    pub existing_id: Option<Uuid>,
    pub final_name: Option<String>,
}

fn match_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn describe_entity(entity: &ExtractedEntity) -> String {
    match entity.summary.as_deref() {
        Some(summary) => format!(
            "{} ({}): {}",
            entity.name,
            entity.node_type,
            truncate_with_ellipsis(summary, MAX_SUMMARY_CHARS)
        ),
        None => format!("{} ({})", entity.name, entity.node_type),
    }
}

fn describe_node(node: &Node) -> String {
    let mut line = format!("- id: {} | {} ({})", node.id, node.name, node.node_type);
    if let Some(summary) = node.summary.as_deref() {
        line.push_str(": ");
        line.push_str(&truncate_with_ellipsis(summary, MAX_SUMMARY_CHARS));
    }
    line
}

struct EntityResolutionTask<'a> {
    candidates: &'a [Node],
}

impl RefineTask for EntityResolutionTask<'_> {
    type Item = EntityDecision;

    fn name(&self) -> &str {
        "entity resolution"
    }

    fn system_prompt(&self) -> String {
        let mut prompt = ENTITY_RESOLUTION_PROMPT.to_string();
        for node in self.candidates {
            prompt.push_str(&describe_node(node));
            prompt.push('\n');
        }
        prompt
    }

    fn user_prompt(&self, chunk: &Chunk, _previous: &[&EntityDecision], error_context: Option<&str>) -> String {
        let mut prompt = String::new();
        if let Some(error) = error_context {
            prompt.push_str(&format!("Your previous attempt failed: {}\n\n", error));
        }
        prompt.push_str("New entities:\n");
        prompt.push_str(&chunk.text);
        prompt
    }

    fn parse(&self, response: &str, chunk: &Chunk) -> Result<Vec<EntityDecision>, ParseError> {
        let parsed = parse_items::<RawDecision>(response, &["decisions", "entities", "results"])?;
        let decisions = parsed
            .items
            .into_iter()
            .map(|raw| (raw.id.as_ref().and_then(parse_record_id), raw))
            .collect();

        Ok(assign_record_ids(decisions, &record_ids(&chunk.text))
            .into_iter()
            .map(|(record, raw)| {
                let existing_id = raw
                    .existing_id
                    .filter(|_| raw.is_duplicate)
                    .and_then(|id| Uuid::parse_str(id.trim()).ok())
                    .filter(|id| self.candidates.iter().any(|n| n.id == *id));
                let final_name = raw
                    .final_name
                    .map(|n| clean_entity_name(&n))
                    .filter(|n| !n.is_empty());
                EntityDecision {
                    record,
                    existing_id,
                    final_name,
                }
            })
            .collect())
    }

    fn dedupe_key(&self, decision: &EntityDecision) -> Option<String> {
        Some(decision.record.to_string())
    }

    fn line_oriented(&self) -> bool {
        true
    }
}

/// Resolve `state.entities` against `state.candidate_nodes`.
pub async fn resolve_entities<L>(ctx: &StageContext<'_, L>, state: &PipelineState) -> StagePatch
where
    L: LanguageModel + ?Sized,
{
    let mut patch = StagePatch::new();
    let candidates = &state.candidate_nodes;

    let by_name: HashMap<String, &Node> = candidates
        .iter()
        .map(|node| (match_key(&node.name), node))
        .collect();

    let mut resolved: Vec<Option<ResolvedEntity>> = vec![None; state.entities.len()];
    let mut pending = Vec::new();
    for (index, entity) in state.entities.iter().enumerate() {
        match by_name.get(&match_key(&entity.name)) {
            Some(node) => {
                resolved[index] = Some(ResolvedEntity::existing(entity.clone(), node.id, node.name.clone()));
            }
            None => pending.push(index),
        }
    }
    let exact = state.entities.len() - pending.len();

    let mut ai_matched = 0;
    if !pending.is_empty() && !candidates.is_empty() {
        let options = ctx.options(ctx.config.resolution_temperature);
        let listing: Vec<String> = candidates.iter().map(describe_node).collect();
        let batches = listing_batches(ENTITY_RESOLUTION_PROMPT, &listing, &options);
        if batches.len() > 1 {
            debug!(
                candidates = candidates.len(),
                batches = batches.len(),
                "Candidate nodes split across calls"
            );
        }

        let names: HashMap<Uuid, &str> = candidates.iter().map(|n| (n.id, n.name.as_str())).collect();
        // First name the model proposed for a record it called new
        let mut proposed: HashMap<usize, String> = HashMap::new();

        for batch in batches {
            let open: Vec<usize> = pending.iter().copied().filter(|&i| resolved[i].is_none()).collect();
            if open.is_empty() || patch.cancelled {
                break;
            }
            let content: String = open
                .iter()
                .map(|&index| format_record(index, &describe_entity(&state.entities[index])))
                .collect();

            let task = EntityResolutionTask {
                candidates: &candidates[batch],
            };
            let outcome = map_refine(ctx.llm, &task, &content, &options, ctx.cancel).await;
            patch.absorb_engine(&outcome);

            for decision in outcome.items {
                let Some(entity) = state.entities.get(decision.record) else {
                    continue;
                };
                if resolved[decision.record].is_some() {
                    continue;
                }
                match decision.existing_id {
                    Some(node_id) => {
                        ai_matched += 1;
                        let name = names.get(&node_id).copied().unwrap_or(entity.name.as_str());
                        resolved[decision.record] = Some(ResolvedEntity::existing(entity.clone(), node_id, name));
                    }
                    None => {
                        if let Some(name) = decision.final_name {
                            proposed.entry(decision.record).or_insert(name);
                        }
                    }
                }
            }
        }

        for (record, name) in proposed {
            if resolved[record].is_none() {
                resolved[record] = Some(ResolvedEntity::new_entity(state.entities[record].clone()).with_final_name(name));
            }
        }
    } else if !pending.is_empty() {
        debug!(pending = pending.len(), "No candidate nodes, all remaining entities are new");
    }

    let resolved: Vec<ResolvedEntity> = resolved
        .into_iter()
        .zip(state.entities.iter())
        .map(|(resolved, entity)| resolved.unwrap_or_else(|| ResolvedEntity::new_entity(entity.clone())))
        .collect();

    let existing = resolved.iter().filter(|r| r.is_existing()).count();
    info!(
        entities = resolved.len(),
        existing,
        exact,
        ai_matched,
        candidates = candidates.len(),
        "Entity resolution complete"
    );
    patch.action(format!(
        "Resolved {} entities: {} new, {} existing",
        resolved.len(),
        resolved.len() - existing,
        existing
    ));
    patch.resolved_entities = Some(resolved);
    patch
}
