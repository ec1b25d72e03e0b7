//! Knowledge-Graph Ingestion Library
//!
//! Turns captured text (web pages, selections, chat turns, personal notes)
//! into nodes and edges of a personal knowledge graph.
//!
//! # Pipeline
//!
//! ```text
//! entity extraction -> entity resolution -> fact extraction
//!   -> fact resolution -> temporal enrichment -> graph persistence
//! ```
//!
//! Every model-backed stage runs on the same token-budgeted map-refine
//! engine: content is chunked to fit the model's context window, results
//! from earlier chunks are fed into later prompts, duplicates are merged,
//! and failed attempts are retried with the error fed back to the model.
//!
//! Runs tolerate partial failure: malformed responses, unavailable models
//! and individual storage errors are recorded in the outcome instead of
//! aborting the ingestion.
//!
//! # Usage
//!
//! ```rust,ignore
//! use graph_ingest::{GraphPipeline, IngestRequest, MemoryGraphStore};
//! use graph_ingest::testing::MockLlm;
//!
//! let pipeline = GraphPipeline::new(MemoryGraphStore::new(), MockLlm::new());
//!
//! let request = IngestRequest::new("page-1", "Team update", "Alice joined Acme Corp in 2020.");
//! let outcome = pipeline.ingest(&request).await;
//! println!("{}", outcome.final_message);
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator abstractions (LanguageModel, Embedder, GraphStore)
//! - [`types`] - Data model, request/outcome envelopes and configuration
//! - [`pipeline`] - The map-refine engine, the stages and the orchestrator
//! - [`stores`] - Storage implementations (MemoryGraphStore, SqliteGraphStore)
//! - [`jobs`] - Tagged job kinds for worker queues
//! - [`testing`] - Mock implementations for testing

pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;
pub mod utils;

#[cfg(feature = "openai")]
pub mod ai;

// Re-export core types at crate root
pub use error::{GraphError, ParseError, Result};
pub use jobs::{EntityPreview, GraphJob, GraphJobResult};
pub use traits::{
    embedder::{Embedder, EmbedderRegistry},
    llm::{ChatMessage, ChatRequest, ChatResponse, LanguageModel, Role},
    store::{EdgeTable, GraphSearch, GraphStore, NodeTable, ProvenanceTable, SourceTable},
};
pub use types::{
    config::PipelineConfig,
    entity::{Attributes, ExtractedEntity, Resolution, ResolvedEntity},
    fact::{EnrichedFact, ExtractedFact, ResolvedFact, TemporalWindow},
    graph::{Edge, Node, Source, SourceEdge, SourceNode, SourceType},
    ingest::{IngestOutcome, IngestRequest},
};

// Re-export the pipeline entry points
pub use pipeline::{
    map_refine, GraphPipeline, MapRefineOptions, MapRefineOutcome, PipelineState, RefineTask,
    StagePatch,
};

// Re-export stores
pub use stores::MemoryGraphStore;

#[cfg(feature = "sqlite")]
pub use stores::SqliteGraphStore;
