//! The GraphPipeline - main entry point for graph ingestion.
//!
//! Stages run strictly in order, each reading the accumulated state and
//! returning a patch:
//!
//! ```text
//! extract entities -> candidate nodes -> resolve entities
//!   -> extract facts -> candidate edges -> resolve facts
//!   -> temporal enrichment -> persist
//! ```
//!
//! Cancellation is checked before every model call and between stages.
//! Once persistence starts it runs to completion.

use indexmap::IndexMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::extract_entities::extract_entities;
use super::extract_facts::extract_facts;
use super::persist::{persist_graph, validate_request};
use super::resolve_entities::resolve_entities;
use super::resolve_facts::resolve_facts;
use super::state::{PipelineState, StageContext, StagePatch};
use super::temporal::enrich_temporal;
use crate::jobs::EntityPreview;
use crate::traits::embedder::{try_embed, Embedder, EmbedderRegistry};
use crate::traits::llm::LanguageModel;
use crate::traits::store::GraphStore;
use crate::types::config::PipelineConfig;
use crate::types::entity::ExtractedEntity;
use crate::types::graph::{Edge, Node};
use crate::types::ingest::{IngestOutcome, IngestRequest};
use crate::utils::text::clean_entity_name;

/// Hits taken from each individual search query.
const CANDIDATES_PER_QUERY: usize = 5;

/// Knowledge-graph ingestion over a store and a language model.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = GraphPipeline::new(MemoryGraphStore::new(), llm)
///     .with_config(PipelineConfig::default().with_owner_entity_name("Sam"));
///
/// let request = IngestRequest::new("page-1", "Team update", "Alice joined Acme Corp in 2020.");
/// let outcome = pipeline.ingest(&request).await;
/// println!("{}", outcome.final_message);
/// ```
pub struct GraphPipeline<S: GraphStore, L: LanguageModel> {
    store: S,
    llm: L,
    embedders: Option<Arc<dyn EmbedderRegistry>>,
    config: PipelineConfig,
}

impl<S: GraphStore, L: LanguageModel> GraphPipeline<S, L> {
    /// Create a pipeline with default configuration and no embedders.
    pub fn new(store: S, llm: L) -> Self {
        Self {
            store,
            llm,
            embedders: None,
            config: PipelineConfig::default(),
        }
    }

    /// Use embedders for candidate search and stored vectors.
    pub fn with_embedders(mut self, embedders: Arc<dyn EmbedderRegistry>) -> Self {
        self.embedders = Some(embedders);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn llm(&self) -> &L {
        &self.llm
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingest one piece of content into the graph.
    ///
    /// Always returns an outcome; problems are listed in its `errors`.
    pub async fn ingest(&self, request: &IngestRequest) -> IngestOutcome {
        self.run(request, None).await
    }

    /// Ingest with cancellation support.
    pub async fn ingest_with_cancel(&self, request: &IngestRequest, cancel: CancellationToken) -> IngestOutcome {
        self.run(request, Some(&cancel)).await
    }

    /// Extract and resolve entities without writing anything.
    pub async fn preview_entities(&self, request: &IngestRequest, cancel: Option<&CancellationToken>) -> EntityPreview {
        let mut state = PipelineState::default();

        if self.start(request, &mut state) {
            let ctx = StageContext::new(&self.llm, &self.config, request, cancel);
            let embedder = self.embedder();

            let patch = extract_entities(&ctx, &state).await;
            state.apply(patch);
            if !self.should_stop(&ctx, &mut state, "entity extraction") {
                let patch = self.candidate_nodes(&state.entities, embedder.as_ref()).await;
                state.apply(patch);
                let patch = resolve_entities(&ctx, &state).await;
                state.apply(patch);
            }
        }

        EntityPreview {
            resolved_entities: state.resolved_entities,
            actions: state.actions,
            errors: state.errors,
            cancelled: state.cancelled,
        }
    }

    async fn run(&self, request: &IngestRequest, cancel: Option<&CancellationToken>) -> IngestOutcome {
        let mut state = PipelineState::default();
        info!(
            page_id = %request.page_id,
            source_type = request.source_type.as_str(),
            content_len = request.extraction_text().len(),
            "Starting ingestion"
        );

        if !self.start(request, &mut state) {
            return state.into_outcome();
        }

        let ctx = StageContext::new(&self.llm, &self.config, request, cancel);
        let embedder = self.embedder();

        let patch = extract_entities(&ctx, &state).await;
        state.apply(patch);
        if self.should_stop(&ctx, &mut state, "entity extraction") {
            return state.into_outcome();
        }

        let patch = self.candidate_nodes(&state.entities, embedder.as_ref()).await;
        state.apply(patch);
        let patch = resolve_entities(&ctx, &state).await;
        state.apply(patch);
        if self.should_stop(&ctx, &mut state, "entity resolution") {
            return state.into_outcome();
        }

        let patch = extract_facts(&ctx, &state).await;
        state.apply(patch);
        if self.should_stop(&ctx, &mut state, "fact extraction") {
            return state.into_outcome();
        }

        let patch = self.candidate_edges(&state, embedder.as_ref()).await;
        state.apply(patch);
        let patch = resolve_facts(&ctx, &state).await;
        state.apply(patch);
        if self.should_stop(&ctx, &mut state, "fact resolution") {
            return state.into_outcome();
        }

        let patch = enrich_temporal(&ctx, &state).await;
        state.apply(patch);
        if self.should_stop(&ctx, &mut state, "temporal enrichment") {
            return state.into_outcome();
        }

        match persist_graph(&self.store, embedder.as_ref(), request, &state).await {
            Ok(patch) => state.apply(patch),
            Err(e) => {
                warn!(error = %e, "Persistence aborted");
                state.errors.push(e.to_string());
            }
        }

        let outcome = state.into_outcome();
        info!(
            page_id = %request.page_id,
            nodes = outcome.created_nodes.len(),
            edges = outcome.created_edges.len(),
            errors = outcome.errors.len(),
            "Ingestion complete"
        );
        outcome
    }

    /// Preconditions shared by every run. Returns false when the run cannot start.
    fn start(&self, request: &IngestRequest, state: &mut PipelineState) -> bool {
        if !self.llm.is_ready() {
            warn!("Language model is not ready, skipping ingestion");
            state.errors.push("language model is not ready".to_string());
            return false;
        }
        if let Err(e) = validate_request(request) {
            warn!(error = %e, "Rejecting ingestion request");
            state.errors.push(e.to_string());
            return false;
        }
        true
    }

    /// Mark the run cancelled if the token fired or a stage saw it.
    fn should_stop(&self, ctx: &StageContext<'_, L>, state: &mut PipelineState, stage: &str) -> bool {
        if ctx.is_cancelled() || state.cancelled {
            info!(stage, "Ingestion cancelled, nothing persisted");
            state.cancelled = true;
            state.actions.push(format!("Cancelled after {}", stage));
            return true;
        }
        false
    }

    fn embedder(&self) -> Option<Arc<dyn Embedder>> {
        let embedder = self
            .embedders
            .as_ref()
            .and_then(|registry| registry.get(&self.config.embedder_name));
        if self.embedders.is_some() && embedder.is_none() {
            debug!(name = %self.config.embedder_name, "No embedder registered under configured name");
        }
        embedder
    }

    /// Existing nodes that extracted entities may duplicate.
    ///
    /// Every entity gets an exact name lookup first and those hits are always
    /// kept. Fuzzy and vector hits only fill the room left under the cap.
    async fn candidate_nodes(&self, entities: &[ExtractedEntity], embedder: Option<&Arc<dyn Embedder>>) -> StagePatch {
        let mut patch = StagePatch::new();
        let cap = self.config.max_candidate_nodes;

        let mut exact: IndexMap<Uuid, Node> = IndexMap::new();
        for entity in entities {
            let cleaned = clean_entity_name(&entity.name);
            let mut names = vec![entity.name.trim()];
            if !cleaned.eq_ignore_ascii_case(entity.name.trim()) {
                names.push(cleaned.as_str());
            }
            for name in names {
                match self.store.find_nodes_by_name(name).await {
                    Ok(nodes) => {
                        for node in nodes {
                            exact.entry(node.id).or_insert(node);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, entity = %entity.uuid, "Node name lookup failed");
                        patch.error(format!("candidate lookup for \"{}\": {}", name, e));
                    }
                }
            }
        }

        let room = cap.saturating_sub(exact.len());
        let mut extras: IndexMap<Uuid, Node> = IndexMap::new();
        let keep = |nodes: Vec<Node>, extras: &mut IndexMap<Uuid, Node>| {
            for node in nodes {
                if !exact.contains_key(&node.id) {
                    extras.entry(node.id).or_insert(node);
                }
            }
        };

        for entity in entities {
            if extras.len() >= room {
                break;
            }
            let name = clean_entity_name(&entity.name);

            match self.store.search_nodes_text(&name, CANDIDATES_PER_QUERY).await {
                Ok(nodes) => keep(nodes, &mut extras),
                Err(e) => {
                    warn!(error = %e, entity = %entity.uuid, "Node text search failed");
                    patch.error(format!("candidate search for \"{}\": {}", name, e));
                }
            }

            if let Some(embedding) = try_embed(embedder, &name).await {
                match self
                    .store
                    .search_nodes_vector(&embedding, CANDIDATES_PER_QUERY, self.config.candidate_min_similarity)
                    .await
                {
                    Ok(nodes) => keep(nodes, &mut extras),
                    Err(e) => {
                        warn!(error = %e, entity = %entity.uuid, "Node vector search failed");
                    }
                }
            }
        }

        let exact_hits = exact.len();
        let candidates: Vec<Node> = exact
            .into_values()
            .chain(extras.into_values().take(room))
            .collect();
        debug!(exact = exact_hits, candidates = candidates.len(), "Gathered candidate nodes");
        patch.candidate_nodes = Some(candidates);
        patch
    }

    /// Existing edges that extracted facts may duplicate.
    async fn candidate_edges(&self, state: &PipelineState, embedder: Option<&Arc<dyn Embedder>>) -> StagePatch {
        let mut patch = StagePatch::new();
        let cap = self.config.max_candidate_edges;

        let existing: Vec<Uuid> = state
            .resolved_entities
            .iter()
            .filter_map(|e| e.existing_id())
            .collect();
        if existing.is_empty() || state.facts.is_empty() {
            patch.candidate_edges = Some(Vec::new());
            return patch;
        }

        let mut candidates: IndexMap<Uuid, Edge> = IndexMap::new();
        match self.store.edges_touching(&existing, cap).await {
            Ok(edges) => {
                for edge in edges {
                    candidates.entry(edge.id).or_insert(edge);
                }
            }
            Err(e) => {
                warn!(error = %e, nodes = existing.len(), "Incident edge lookup failed");
                patch.error(format!("candidate edges: {}", e));
            }
        }

        for fact in &state.facts {
            if candidates.len() >= cap {
                break;
            }
            match self.store.search_edges_text(&fact.fact_text, CANDIDATES_PER_QUERY).await {
                Ok(edges) => {
                    for edge in edges {
                        candidates.entry(edge.id).or_insert(edge);
                    }
                }
                Err(e) => {
                    warn!(error = %e, fact = %fact.uuid, "Edge text search failed");
                }
            }

            if let Some(embedding) = try_embed(embedder, &fact.fact_text).await {
                if let Ok(edges) = self
                    .store
                    .search_edges_vector(&embedding, CANDIDATES_PER_QUERY, self.config.candidate_min_similarity)
                    .await
                {
                    for edge in edges {
                        candidates.entry(edge.id).or_insert(edge);
                    }
                }
            }
        }

        let candidates: Vec<Edge> = candidates.into_values().take(cap).collect();
        debug!(candidates = candidates.len(), "Gathered candidate edges");
        patch.candidate_edges = Some(candidates);
        patch
    }
}
