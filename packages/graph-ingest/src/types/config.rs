//! Configuration for the ingestion pipeline.

use serde::{Deserialize, Serialize};

use crate::pipeline::map_refine::MapRefineOptions;

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Context window override.
    ///
    /// When None, the language model's own `max_model_tokens()` is used.
    pub max_model_tokens: Option<usize>,

    /// Tokens reserved for each model response. Default: 2048.
    pub max_response_tokens: usize,

    /// Fraction of the context window reserved for prompt overhead
    /// and estimation error. Default: 0.25.
    pub prompt_overhead_ratio: f32,

    /// Overlap between consecutive chunks, in tokens. Default: 64.
    pub chunk_overlap_tokens: usize,

    /// Chunks that would need splitting below this size are abandoned.
    /// Default: 256.
    pub min_chunk_tokens: usize,

    /// Attempts per chunk, including the first. Default: 3.
    pub max_retries: usize,

    /// Temperature for entity and fact extraction. Default: 0.1.
    pub extraction_temperature: f32,

    /// Temperature for personal-note extraction. Default: 0.5.
    pub note_temperature: f32,

    /// Temperature for resolution and temporal enrichment. Default: 0.0.
    pub resolution_temperature: f32,

    /// Cap on existing nodes offered to entity resolution. Default: 50.
    pub max_candidate_nodes: usize,

    /// Cap on existing edges offered to fact resolution. Default: 50.
    pub max_candidate_edges: usize,

    /// Minimum cosine similarity for vector candidate search. Default: 0.75.
    pub candidate_min_similarity: f32,

    /// Entity that first-person pronouns in personal notes resolve to.
    pub owner_entity_name: String,

    /// Name of the embedder to request from the registry.
    pub embedder_name: String,

    /// Match new facts against existing edges in both directions.
    ///
    /// Storage edges are directed; with this on, "A reports to B" is
    /// considered a duplicate of an existing "B reports to A" edge.
    /// Default: true.
    pub bidirectional_fact_matching: bool,

    /// Run the follow-up fact pass over entities left without facts.
    /// Default: true.
    pub unconnected_entity_pass: bool,

    /// How many previous chat turns to include as context. Default: 6.
    pub max_context_messages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_model_tokens: None,
            max_response_tokens: 2048,
            prompt_overhead_ratio: 0.25,
            chunk_overlap_tokens: 64,
            min_chunk_tokens: 256,
            max_retries: 3,
            extraction_temperature: 0.1,
            note_temperature: 0.5,
            resolution_temperature: 0.0,
            max_candidate_nodes: 50,
            max_candidate_edges: 50,
            candidate_min_similarity: 0.75,
            owner_entity_name: "Me".to_string(),
            embedder_name: "default".to_string(),
            bidirectional_fact_matching: true,
            unconnected_entity_pass: true,
            max_context_messages: 6,
        }
    }
}

impl PipelineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the model context window.
    pub fn with_max_model_tokens(mut self, tokens: usize) -> Self {
        self.max_model_tokens = Some(tokens);
        self
    }

    pub fn with_max_response_tokens(mut self, tokens: usize) -> Self {
        self.max_response_tokens = tokens;
        self
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_chunk_overlap(mut self, tokens: usize) -> Self {
        self.chunk_overlap_tokens = tokens;
        self
    }

    pub fn with_min_chunk_tokens(mut self, tokens: usize) -> Self {
        self.min_chunk_tokens = tokens;
        self
    }

    /// Set the graph owner's entity name for personal notes.
    pub fn with_owner_entity_name(mut self, name: impl Into<String>) -> Self {
        self.owner_entity_name = name.into();
        self
    }

    pub fn with_embedder_name(mut self, name: impl Into<String>) -> Self {
        self.embedder_name = name.into();
        self
    }

    pub fn with_bidirectional_fact_matching(mut self, enabled: bool) -> Self {
        self.bidirectional_fact_matching = enabled;
        self
    }

    pub fn with_unconnected_entity_pass(mut self, enabled: bool) -> Self {
        self.unconnected_entity_pass = enabled;
        self
    }

    pub fn with_max_candidates(mut self, nodes: usize, edges: usize) -> Self {
        self.max_candidate_nodes = nodes;
        self.max_candidate_edges = edges;
        self
    }

    /// Engine options for one stage.
    ///
    /// `model_tokens` is the language model's context window; the config
    /// override wins when set.
    pub fn map_refine_options(&self, model_tokens: usize, temperature: f32) -> MapRefineOptions {
        MapRefineOptions {
            max_model_tokens: self.max_model_tokens.unwrap_or(model_tokens),
            max_response_tokens: self.max_response_tokens,
            overhead_ratio: self.prompt_overhead_ratio,
            chunk_overlap_tokens: self.chunk_overlap_tokens,
            min_chunk_tokens: self.min_chunk_tokens,
            max_retries: self.max_retries,
            temperature,
        }
    }
}
