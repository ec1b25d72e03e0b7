//! In-memory graph storage for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{GraphError, Result};
use crate::traits::store::{
    search_terms, term_score, EdgeTable, GraphSearch, NodeTable, ProvenanceTable, SourceTable,
};
use crate::types::graph::{Edge, Node, Source, SourceEdge, SourceNode};
use crate::utils::{cosine_similarity, normalize_name};

/// In-memory storage for sources, nodes, edges and provenance rows.
///
/// Enforces the same referential rules a relational backend would: edges
/// need both endpoint nodes, join rows need both sides. Not suitable for
/// production as data is lost on restart.
pub struct MemoryGraphStore {
    sources: RwLock<HashMap<Uuid, Source>>,
    nodes: RwLock<HashMap<Uuid, Node>>,
    edges: RwLock<HashMap<Uuid, Edge>>,
    source_nodes: RwLock<Vec<SourceNode>>,
    source_edges: RwLock<Vec<SourceEdge>>,
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            edges: RwLock::new(HashMap::new()),
            source_nodes: RwLock::new(Vec::new()),
            source_edges: RwLock::new(Vec::new()),
        }
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        self.sources.write().unwrap().clear();
        self.nodes.write().unwrap().clear();
        self.edges.write().unwrap().clear();
        self.source_nodes.write().unwrap().clear();
        self.source_edges.write().unwrap().clear();
    }

    /// Get the number of stored sources.
    pub fn source_count(&self) -> usize {
        self.sources.read().unwrap().len()
    }

    /// Snapshot of all nodes, oldest first.
    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().unwrap().values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Snapshot of all edges, oldest first.
    pub fn all_edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.read().unwrap().values().cloned().collect();
        edges.sort_by_key(|e| e.id);
        edges
    }

    /// Nodes whose name matches case-insensitively.
    pub fn nodes_named(&self, name: &str) -> Vec<Node> {
        let wanted = name.trim().to_lowercase();
        self.all_nodes()
            .into_iter()
            .filter(|n| n.name.trim().to_lowercase() == wanted)
            .collect()
    }
}

/// Sort scored rows best first (ties oldest first) and keep `limit`.
fn top_scored<T: Clone>(mut scored: Vec<(f32, Uuid, T)>, limit: usize) -> Vec<T> {
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(limit).map(|(_, _, row)| row).collect()
}

#[async_trait]
impl SourceTable for MemoryGraphStore {
    async fn create_source(&self, source: &Source) -> Result<Source> {
        let mut sources = self.sources.write().unwrap();
        if sources.contains_key(&source.id) {
            return Err(GraphError::storage(format!("source {} already exists", source.id)));
        }
        sources.insert(source.id, source.clone());
        Ok(source.clone())
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        Ok(self.sources.read().unwrap().get(&id).cloned())
    }
}

#[async_trait]
impl NodeTable for MemoryGraphStore {
    async fn create_node(&self, node: &Node) -> Result<Node> {
        if node.name.trim().is_empty() {
            return Err(GraphError::storage("node name must not be empty"));
        }
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&node.id) {
            return Err(GraphError::storage(format!("node {} already exists", node.id)));
        }
        nodes.insert(node.id, node.clone());
        Ok(node.clone())
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<Node>> {
        Ok(self.nodes.read().unwrap().get(&id).cloned())
    }

    async fn find_nodes_by_name(&self, name: &str) -> Result<Vec<Node>> {
        Ok(self.nodes_named(name))
    }

    async fn count_nodes(&self) -> Result<usize> {
        Ok(self.nodes.read().unwrap().len())
    }
}

#[async_trait]
impl EdgeTable for MemoryGraphStore {
    async fn create_edge(&self, edge: &Edge) -> Result<Edge> {
        {
            let nodes = self.nodes.read().unwrap();
            for endpoint in [edge.source_id, edge.destination_id] {
                if !nodes.contains_key(&endpoint) {
                    return Err(GraphError::storage(format!(
                        "edge {} references unknown node {}",
                        edge.id, endpoint
                    )));
                }
            }
        }

        let mut edges = self.edges.write().unwrap();
        if edges.contains_key(&edge.id) {
            return Err(GraphError::storage(format!("edge {} already exists", edge.id)));
        }
        edges.insert(edge.id, edge.clone());
        Ok(edge.clone())
    }

    async fn get_edge(&self, id: Uuid) -> Result<Option<Edge>> {
        Ok(self.edges.read().unwrap().get(&id).cloned())
    }

    async fn edges_touching(&self, node_ids: &[Uuid], limit: usize) -> Result<Vec<Edge>> {
        let mut edges: Vec<Edge> = self
            .edges
            .read()
            .unwrap()
            .values()
            .filter(|e| node_ids.contains(&e.source_id) || node_ids.contains(&e.destination_id))
            .cloned()
            .collect();
        edges.sort_by_key(|e| e.id);
        edges.truncate(limit);
        Ok(edges)
    }

    async fn count_edges(&self) -> Result<usize> {
        Ok(self.edges.read().unwrap().len())
    }
}

#[async_trait]
impl ProvenanceTable for MemoryGraphStore {
    async fn link_node(&self, link: &SourceNode) -> Result<()> {
        if !self.sources.read().unwrap().contains_key(&link.source_id) {
            return Err(GraphError::storage(format!("unknown source {}", link.source_id)));
        }
        if !self.nodes.read().unwrap().contains_key(&link.node_id) {
            return Err(GraphError::storage(format!("unknown node {}", link.node_id)));
        }
        let mut links = self.source_nodes.write().unwrap();
        if !links.contains(link) {
            links.push(*link);
        }
        Ok(())
    }

    async fn link_edge(&self, link: &SourceEdge) -> Result<()> {
        if !self.sources.read().unwrap().contains_key(&link.source_id) {
            return Err(GraphError::storage(format!("unknown source {}", link.source_id)));
        }
        if !self.edges.read().unwrap().contains_key(&link.edge_id) {
            return Err(GraphError::storage(format!("unknown edge {}", link.edge_id)));
        }
        let mut links = self.source_edges.write().unwrap();
        if !links.contains(link) {
            links.push(*link);
        }
        Ok(())
    }

    async fn nodes_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .source_nodes
            .read()
            .unwrap()
            .iter()
            .filter(|l| l.source_id == source_id)
            .map(|l| l.node_id)
            .collect())
    }

    async fn edges_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .source_edges
            .read()
            .unwrap()
            .iter()
            .filter(|l| l.source_id == source_id)
            .map(|l| l.edge_id)
            .collect())
    }
}

#[async_trait]
impl GraphSearch for MemoryGraphStore {
    async fn search_nodes_text(&self, query: &str, limit: usize) -> Result<Vec<Node>> {
        let terms = search_terms(query);
        if terms.is_empty() {
            return Ok(vec![]);
        }
        let wanted = normalize_name(query);

        let scored = self
            .nodes
            .read()
            .unwrap()
            .values()
            .filter_map(|node| {
                let name = normalize_name(&node.name);
                let haystack = format!(
                    "{} {}",
                    name,
                    normalize_name(node.summary.as_deref().unwrap_or_default())
                );
                let mut score = term_score(&terms, &haystack);
                if name == wanted {
                    score += 1.0;
                }
                (score > 0.0).then(|| (score, node.id, node.clone()))
            })
            .collect();

        Ok(top_scored(scored, limit))
    }

    async fn search_nodes_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Node>> {
        let scored = self
            .nodes
            .read()
            .unwrap()
            .values()
            .filter_map(|node| {
                let score = cosine_similarity(embedding, node.name_embedding.as_deref()?);
                (score >= min_score).then(|| (score, node.id, node.clone()))
            })
            .collect();

        Ok(top_scored(scored, limit))
    }

    async fn search_edges_text(&self, query: &str, limit: usize) -> Result<Vec<Edge>> {
        let terms = search_terms(query);
        if terms.is_empty() {
            return Ok(vec![]);
        }

        let scored = self
            .edges
            .read()
            .unwrap()
            .values()
            .filter_map(|edge| {
                let score = term_score(&terms, &normalize_name(&edge.fact_text));
                (score > 0.0).then(|| (score, edge.id, edge.clone()))
            })
            .collect();

        Ok(top_scored(scored, limit))
    }

    async fn search_edges_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Edge>> {
        let scored = self
            .edges
            .read()
            .unwrap()
            .values()
            .filter_map(|edge| {
                let score = cosine_similarity(embedding, edge.fact_embedding.as_deref()?);
                (score >= min_score).then(|| (score, edge.id, edge.clone()))
            })
            .collect();

        Ok(top_scored(scored, limit))
    }
}
