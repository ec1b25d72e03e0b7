//! Ingestion pipeline - the core of the library.
//!
//! The pipeline orchestrates:
//! - The map-refine engine (chunk, call, merge, retry)
//! - Entity extraction and resolution against existing nodes
//! - Fact extraction and resolution against existing edges
//! - Temporal enrichment of new facts
//! - Fault-tolerant persistence

pub mod chunk;
pub mod extract_entities;
pub mod extract_facts;
pub mod map_refine;
pub mod orchestrator;
pub mod parse;
pub mod persist;
pub mod prompts;
pub mod records;
pub mod resolve_entities;
pub mod resolve_facts;
pub mod state;
pub mod temporal;

pub use chunk::{chunk_lines, chunk_text, estimate_tokens, Chunk};
pub use extract_entities::{extract_entities, EntityExtractionTask};
pub use extract_facts::extract_facts;
pub use map_refine::{map_refine, MapRefineOptions, MapRefineOutcome, RefineTask};
pub use orchestrator::GraphPipeline;
pub use parse::{parse_items, ParseStrategy, Parsed};
pub use persist::{persist_graph, validate_request};
pub use prompts::{
    note_entity_prompt, prompt_hash, ENTITY_EXTRACTION_PROMPT, ENTITY_RESOLUTION_PROMPT,
    FACT_EXTRACTION_PROMPT, FACT_RESOLUTION_PROMPT, NOTE_ENTITY_EXTRACTION_PROMPT,
    TEMPORAL_PROMPT, UNCONNECTED_FACTS_PROMPT,
};
pub use resolve_entities::{resolve_entities, EntityDecision};
pub use resolve_facts::resolve_facts;
pub use state::{PipelineState, StageContext, StagePatch};
pub use temporal::enrich_temporal;
