//! Storage traits for sources, nodes, edges and provenance.
//!
//! The storage layer is split into focused traits for flexibility:
//! - `SourceTable`: ingestion provenance records
//! - `NodeTable`: graph vertices
//! - `EdgeTable`: directed relationships
//! - `ProvenanceTable`: `MENTIONED_IN` / `EXTRACTED_FROM` join rows
//! - `GraphSearch`: full-text and vector-similarity lookup
//! - `GraphStore`: composite trait combining all of them
//!
//! Rows are written once and never updated by the pipeline.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::graph::{Edge, Node, Source, SourceEdge, SourceNode};

/// Provenance records, one per ingestion.
#[async_trait]
pub trait SourceTable: Send + Sync {
    /// Insert a source and return the stored row.
    async fn create_source(&self, source: &Source) -> Result<Source>;

    /// Get a source by id.
    async fn get_source(&self, id: Uuid) -> Result<Option<Source>>;
}

/// Graph vertices.
#[async_trait]
pub trait NodeTable: Send + Sync {
    /// Insert a node and return the stored row.
    async fn create_node(&self, node: &Node) -> Result<Node>;

    /// Get a node by id.
    async fn get_node(&self, id: Uuid) -> Result<Option<Node>>;

    /// Whether a node with this id is stored.
    async fn node_exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.get_node(id).await?.is_some())
    }

    /// Get multiple nodes by id, skipping unknown ids.
    async fn get_nodes(&self, ids: &[Uuid]) -> Result<Vec<Node>> {
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.get_node(*id).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Nodes whose trimmed name matches `name` case-insensitively, oldest first.
    async fn find_nodes_by_name(&self, name: &str) -> Result<Vec<Node>>;

    /// Count stored nodes.
    async fn count_nodes(&self) -> Result<usize>;
}

/// Directed relationships.
#[async_trait]
pub trait EdgeTable: Send + Sync {
    /// Insert an edge and return the stored row.
    async fn create_edge(&self, edge: &Edge) -> Result<Edge>;

    /// Get an edge by id.
    async fn get_edge(&self, id: Uuid) -> Result<Option<Edge>>;

    /// All edges with either endpoint in `node_ids`.
    async fn edges_touching(&self, node_ids: &[Uuid], limit: usize) -> Result<Vec<Edge>>;

    /// Count stored edges.
    async fn count_edges(&self) -> Result<usize>;
}

/// Join rows recording which source produced which node/edge.
#[async_trait]
pub trait ProvenanceTable: Send + Sync {
    /// Record that a node was mentioned in a source.
    async fn link_node(&self, link: &SourceNode) -> Result<()>;

    /// Record that an edge was extracted from a source.
    async fn link_edge(&self, link: &SourceEdge) -> Result<()>;

    /// Node ids mentioned in a source.
    async fn nodes_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>>;

    /// Edge ids extracted from a source.
    async fn edges_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>>;
}

/// Search used to build "existing" candidate sets for resolution.
#[async_trait]
pub trait GraphSearch: Send + Sync {
    /// Fuzzy / full-text search over node names and summaries.
    async fn search_nodes_text(&self, query: &str, limit: usize) -> Result<Vec<Node>>;

    /// Nodes whose name embedding is at least `min_score` similar, best first.
    async fn search_nodes_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Node>>;

    /// Full-text search over edge fact text.
    async fn search_edges_text(&self, query: &str, limit: usize) -> Result<Vec<Edge>>;

    /// Edges whose fact embedding is at least `min_score` similar, best first.
    async fn search_edges_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Edge>>;
}

/// Composite storage trait combining all tables and search.
///
/// This is the main trait used by the pipeline.
pub trait GraphStore: SourceTable + NodeTable + EdgeTable + ProvenanceTable + GraphSearch {}

// Blanket implementation: anything implementing every table is a GraphStore
impl<T: SourceTable + NodeTable + EdgeTable + ProvenanceTable + GraphSearch> GraphStore for T {}

/// Split a search query into lower-cased terms of at least two characters.
pub fn search_terms(query: &str) -> Vec<String> {
    crate::utils::text::normalize_name(query)
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// Share of query terms present in `haystack` (already normalized).
pub fn term_score(terms: &[String], haystack: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let words: std::collections::HashSet<&str> = haystack.split_whitespace().collect();
    let hits = terms.iter().filter(|t| words.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}
