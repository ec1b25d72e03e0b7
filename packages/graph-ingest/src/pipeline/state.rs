//! Accumulated pipeline state and the patches stages return.
//!
//! Stages never mutate state directly. Each one reads the current
//! [`PipelineState`] and returns a [`StagePatch`]; the orchestrator applies
//! patches in order with these per-field rules:
//!
//! | field                                   | rule                      |
//! |-----------------------------------------|---------------------------|
//! | entities, resolved entities             | replace when `Some`       |
//! | facts, resolved facts, enriched facts   | replace when `Some`       |
//! | candidate nodes / edges                 | replace when `Some`       |
//! | created source                          | set when `Some`           |
//! | created nodes / edges                   | append                    |
//! | actions, errors                         | append                    |
//! | cancelled                               | sticky (once set, stays)  |

use tokio_util::sync::CancellationToken;

use super::map_refine::{MapRefineOptions, MapRefineOutcome};
use crate::traits::llm::LanguageModel;
use crate::types::config::PipelineConfig;
use crate::types::entity::{ExtractedEntity, ResolvedEntity};
use crate::types::fact::{EnrichedFact, ExtractedFact, ResolvedFact};
use crate::types::graph::{Edge, Node, Source};
use crate::types::ingest::{IngestOutcome, IngestRequest};

/// Everything known about one ingestion so far.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub entities: Vec<ExtractedEntity>,
    pub resolved_entities: Vec<ResolvedEntity>,
    pub facts: Vec<ExtractedFact>,
    pub resolved_facts: Vec<ResolvedFact>,
    pub enriched_facts: Vec<EnrichedFact>,

    /// Existing nodes offered to entity resolution
    pub candidate_nodes: Vec<Node>,

    /// Existing edges offered to fact resolution
    pub candidate_edges: Vec<Edge>,

    pub created_source: Option<Source>,
    pub created_nodes: Vec<Node>,
    pub created_edges: Vec<Edge>,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Changes produced by one stage.
#[derive(Debug, Clone, Default)]
pub struct StagePatch {
    pub entities: Option<Vec<ExtractedEntity>>,
    pub resolved_entities: Option<Vec<ResolvedEntity>>,
    pub facts: Option<Vec<ExtractedFact>>,
    pub resolved_facts: Option<Vec<ResolvedFact>>,
    pub enriched_facts: Option<Vec<EnrichedFact>>,
    pub candidate_nodes: Option<Vec<Node>>,
    pub candidate_edges: Option<Vec<Edge>>,
    pub created_source: Option<Source>,
    pub created_nodes: Vec<Node>,
    pub created_edges: Vec<Edge>,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl StagePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a human-readable action.
    pub fn action(&mut self, message: impl Into<String>) {
        self.actions.push(message.into());
    }

    /// Record a non-fatal error.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Carry over an engine run's errors and cancellation.
    pub fn absorb_engine<T>(&mut self, outcome: &MapRefineOutcome<T>) {
        self.errors.extend(outcome.errors.iter().cloned());
        self.cancelled |= outcome.cancelled;
    }
}

impl PipelineState {
    /// Merge a stage's patch into the state.
    pub fn apply(&mut self, patch: StagePatch) {
        if let Some(entities) = patch.entities {
            self.entities = entities;
        }
        if let Some(resolved) = patch.resolved_entities {
            self.resolved_entities = resolved;
        }
        if let Some(facts) = patch.facts {
            self.facts = facts;
        }
        if let Some(resolved) = patch.resolved_facts {
            self.resolved_facts = resolved;
        }
        if let Some(enriched) = patch.enriched_facts {
            self.enriched_facts = enriched;
        }
        if let Some(nodes) = patch.candidate_nodes {
            self.candidate_nodes = nodes;
        }
        if let Some(edges) = patch.candidate_edges {
            self.candidate_edges = edges;
        }
        if patch.created_source.is_some() {
            self.created_source = patch.created_source;
        }
        self.created_nodes.extend(patch.created_nodes);
        self.created_edges.extend(patch.created_edges);
        self.actions.extend(patch.actions);
        self.errors.extend(patch.errors);
        self.cancelled |= patch.cancelled;
    }

    /// Final envelope for the caller.
    pub fn into_outcome(self) -> IngestOutcome {
        let final_message = IngestOutcome::status_message(
            self.created_nodes.len(),
            self.created_edges.len(),
            self.errors.len(),
            self.cancelled,
        );
        IngestOutcome {
            created_nodes: self.created_nodes,
            created_edges: self.created_edges,
            created_source: self.created_source,
            final_message,
            actions: self.actions,
            errors: self.errors,
            cancelled: self.cancelled,
        }
    }
}

/// Collaborators and settings shared by every model-backed stage.
pub struct StageContext<'a, L: ?Sized> {
    pub llm: &'a L,
    pub config: &'a PipelineConfig,
    pub request: &'a IngestRequest,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a, L: LanguageModel + ?Sized> StageContext<'a, L> {
    pub fn new(
        llm: &'a L,
        config: &'a PipelineConfig,
        request: &'a IngestRequest,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            llm,
            config,
            request,
            cancel,
        }
    }

    /// Engine options at the given temperature.
    pub fn options(&self, temperature: f32) -> MapRefineOptions {
        self.config
            .map_refine_options(self.llm.max_model_tokens(), temperature)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.is_cancelled())
    }
}
