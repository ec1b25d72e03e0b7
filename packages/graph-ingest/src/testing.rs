//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the ingestion library
//! without making real LLM, embedding or database calls.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::{GraphError, Result};
use crate::traits::embedder::{Embedder, EmbedderRegistry};
use crate::traits::llm::{ChatRequest, ChatResponse, LanguageModel};
use crate::traits::store::{
    EdgeTable, GraphSearch, NodeTable, ProvenanceTable, SourceTable,
};
use crate::types::graph::{Edge, Node, Source, SourceEdge, SourceNode};

/// Which part of a request a scripted rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptPart {
    System,
    User,
}

#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Fail(String),
}

#[derive(Debug, Clone)]
struct MockRule {
    part: PromptPart,
    needle: String,
    reply: MockReply,
    /// Remaining uses; `None` means unlimited
    remaining: Option<usize>,
}

/// A scripted language model for testing.
///
/// Rules are checked in the order they were added; the first rule whose
/// needle appears in the targeted prompt answers. Unmatched requests get
/// the default response (`[]` unless configured).
pub struct MockLlm {
    rules: Arc<RwLock<Vec<MockRule>>>,
    default_response: String,
    ready: bool,
    max_model_tokens: usize,

    /// Call tracking for assertions
    calls: Arc<RwLock<Vec<ChatRequest>>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    /// Create a ready mock with an 8k context window that answers `[]`.
    pub fn new() -> Self {
        Self {
            rules: Arc::new(RwLock::new(Vec::new())),
            default_response: "[]".to_string(),
            ready: true,
            max_model_tokens: 8192,
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Set whether the model reports itself ready.
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Set the reported context window.
    pub fn with_max_model_tokens(mut self, tokens: usize) -> Self {
        self.max_model_tokens = tokens;
        self
    }

    /// Set the response for requests no rule matches.
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    fn push_rule(self, part: PromptPart, needle: impl Into<String>, reply: MockReply, remaining: Option<usize>) -> Self {
        self.rules.write().unwrap().push(MockRule {
            part,
            needle: needle.into(),
            reply,
            remaining,
        });
        self
    }

    /// Answer with `response` whenever the system prompt contains `needle`.
    pub fn respond_when(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.push_rule(PromptPart::System, needle, MockReply::Text(response.into()), None)
    }

    /// Answer with `response` once, the first time the system prompt
    /// contains `needle`.
    pub fn respond_once_when(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.push_rule(PromptPart::System, needle, MockReply::Text(response.into()), Some(1))
    }

    /// Answer with `response` whenever the user prompt contains `needle`.
    pub fn respond_when_user(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.push_rule(PromptPart::User, needle, MockReply::Text(response.into()), None)
    }

    /// Fail with an LLM error whenever the system prompt contains `needle`.
    pub fn fail_when(self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.push_rule(PromptPart::System, needle, MockReply::Fail(message.into()), None)
    }

    /// Get all requests made to this mock.
    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.read().unwrap().clone()
    }

    /// Number of requests whose system prompt contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.system_prompt().is_some_and(|s| s.contains(needle)))
            .count()
    }

    /// Clear call history.
    pub fn clear_calls(&self) {
        self.calls.write().unwrap().clear();
    }

    fn reply_for(&self, request: &ChatRequest) -> MockReply {
        let mut rules = self.rules.write().unwrap();
        for rule in rules.iter_mut() {
            if rule.remaining == Some(0) {
                continue;
            }
            let prompt = match rule.part {
                PromptPart::System => request.system_prompt(),
                PromptPart::User => request.user_prompt(),
            };
            if prompt.is_some_and(|p| p.contains(&rule.needle)) {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                return rule.reply.clone();
            }
        }
        MockReply::Text(self.default_response.clone())
    }
}

#[async_trait]
impl LanguageModel for MockLlm {
    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn chat_completions(&self, request: ChatRequest) -> Result<ChatResponse> {
        let reply = self.reply_for(&request);
        self.calls.write().unwrap().push(request);

        match reply {
            MockReply::Text(text) => Ok(ChatResponse::from_text(text)),
            MockReply::Fail(message) => Err(GraphError::llm(message)),
        }
    }

    fn max_model_tokens(&self) -> usize {
        self.max_model_tokens
    }
}

/// A deterministic embedder for testing.
///
/// Vectors are seeded from a SHA-256 of the trimmed, lower-cased text, so
/// equal names embed identically.
pub struct MockEmbedder {
    dim: usize,
    ready: AtomicBool,
    failing: AtomicBool,
    embeddings: RwLock<HashMap<String, Vec<f32>>>,
    calls: AtomicUsize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            dim: 16,
            ready: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            embeddings: RwLock::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    /// Add a predefined embedding for text.
    pub fn with_embedding(self, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        self.embeddings.write().unwrap().insert(text.into(), embedding);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make every embedding call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of embedding calls made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Generate a deterministic embedding based on text.
    fn generate_deterministic_embedding(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(text.trim().to_lowercase().as_bytes());
        let hash = hasher.finalize();

        (0..self.dim)
            .map(|i| {
                let byte = hash[i % 32] as f32;
                // Normalize to [-1, 1] range
                (byte / 127.5) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn text_to_vector(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(GraphError::Embedding("mock embedder failure".into()));
        }

        Ok(self
            .embeddings
            .read()
            .unwrap()
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.generate_deterministic_embedding(text)))
    }
}

/// A registry of named embedders for testing.
#[derive(Default)]
pub struct MockEmbedders {
    embedders: HashMap<String, Arc<dyn Embedder>>,
}

impl MockEmbedders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an embedder under `name`.
    pub fn with(mut self, name: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        self.embedders.insert(name.into(), embedder);
        self
    }

    /// Register an embedder under `"default"`.
    pub fn with_default(self, embedder: Arc<dyn Embedder>) -> Self {
        self.with("default", embedder)
    }
}

impl EmbedderRegistry for MockEmbedders {
    fn get(&self, name: &str) -> Option<Arc<dyn Embedder>> {
        self.embedders.get(name).cloned()
    }
}

/// A store wrapper that fails writes for selected items.
///
/// Node creation fails for names in the failing set (case-insensitive);
/// edge creation fails for edge types in the failing set. Everything else
/// is delegated to the inner store.
pub struct FaultyStore<S> {
    inner: S,
    failing_node_names: HashSet<String>,
    failing_edge_types: HashSet<String>,
    fail_sources: bool,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing_node_names: HashSet::new(),
            failing_edge_types: HashSet::new(),
            fail_sources: false,
        }
    }

    /// Fail `create_node` for nodes with this name.
    pub fn fail_node(mut self, name: impl Into<String>) -> Self {
        self.failing_node_names.insert(name.into().to_lowercase());
        self
    }

    /// Fail `create_edge` for edges of this type.
    pub fn fail_edge_type(mut self, edge_type: impl Into<String>) -> Self {
        self.failing_edge_types.insert(edge_type.into());
        self
    }

    /// Fail `create_source`.
    pub fn fail_sources(mut self) -> Self {
        self.fail_sources = true;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: SourceTable> SourceTable for FaultyStore<S> {
    async fn create_source(&self, source: &Source) -> Result<Source> {
        if self.fail_sources {
            return Err(GraphError::storage("injected source failure"));
        }
        self.inner.create_source(source).await
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        self.inner.get_source(id).await
    }
}

#[async_trait]
impl<S: NodeTable> NodeTable for FaultyStore<S> {
    async fn create_node(&self, node: &Node) -> Result<Node> {
        if self.failing_node_names.contains(&node.name.to_lowercase()) {
            return Err(GraphError::storage(format!("injected failure for node {}", node.name)));
        }
        self.inner.create_node(node).await
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<Node>> {
        self.inner.get_node(id).await
    }

    async fn find_nodes_by_name(&self, name: &str) -> Result<Vec<Node>> {
        self.inner.find_nodes_by_name(name).await
    }

    async fn count_nodes(&self) -> Result<usize> {
        self.inner.count_nodes().await
    }
}

#[async_trait]
impl<S: EdgeTable> EdgeTable for FaultyStore<S> {
    async fn create_edge(&self, edge: &Edge) -> Result<Edge> {
        if self.failing_edge_types.contains(&edge.edge_type) {
            return Err(GraphError::storage(format!(
                "injected failure for edge {}",
                edge.edge_type
            )));
        }
        self.inner.create_edge(edge).await
    }

    async fn get_edge(&self, id: Uuid) -> Result<Option<Edge>> {
        self.inner.get_edge(id).await
    }

    async fn edges_touching(&self, node_ids: &[Uuid], limit: usize) -> Result<Vec<Edge>> {
        self.inner.edges_touching(node_ids, limit).await
    }

    async fn count_edges(&self) -> Result<usize> {
        self.inner.count_edges().await
    }
}

#[async_trait]
impl<S: ProvenanceTable> ProvenanceTable for FaultyStore<S> {
    async fn link_node(&self, link: &SourceNode) -> Result<()> {
        self.inner.link_node(link).await
    }

    async fn link_edge(&self, link: &SourceEdge) -> Result<()> {
        self.inner.link_edge(link).await
    }

    async fn nodes_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        self.inner.nodes_for_source(source_id).await
    }

    async fn edges_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        self.inner.edges_for_source(source_id).await
    }
}

#[async_trait]
impl<S: GraphSearch> GraphSearch for FaultyStore<S> {
    async fn search_nodes_text(&self, query: &str, limit: usize) -> Result<Vec<Node>> {
        self.inner.search_nodes_text(query, limit).await
    }

    async fn search_nodes_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Node>> {
        self.inner.search_nodes_vector(embedding, limit, min_score).await
    }

    async fn search_edges_text(&self, query: &str, limit: usize) -> Result<Vec<Edge>> {
        self.inner.search_edges_text(query, limit).await
    }

    async fn search_edges_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Edge>> {
        self.inner.search_edges_vector(embedding, limit, min_score).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryGraphStore;

    #[tokio::test]
    async fn test_mock_llm_rules_in_order() {
        let llm = MockLlm::new()
            .respond_once_when("entities", "first")
            .respond_when("entities", "second")
            .fail_when("broken", "boom");

        let ask = |system: &str| ChatRequest::new(system, "user");
        let a = llm.chat_completions(ask("find entities")).await.unwrap();
        let b = llm.chat_completions(ask("find entities")).await.unwrap();
        let c = llm.chat_completions(ask("other")).await.unwrap();

        assert_eq!(a.into_content().unwrap(), "first");
        assert_eq!(b.into_content().unwrap(), "second");
        assert_eq!(c.into_content().unwrap(), "[]");
        assert!(llm.chat_completions(ask("broken")).await.is_err());
        assert_eq!(llm.calls().len(), 4);
        assert_eq!(llm.calls_matching("entities"), 2);
    }

    #[tokio::test]
    async fn test_mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new().with_dim(8);
        let a = embedder.text_to_vector("Alice").await.unwrap();
        let b = embedder.text_to_vector(" alice ").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);

        embedder.set_failing(true);
        assert!(embedder.text_to_vector("Alice").await.is_err());
        assert_eq!(embedder.call_count(), 3);
    }

    #[tokio::test]
    async fn test_faulty_store_fails_selected_nodes() {
        let store = FaultyStore::new(MemoryGraphStore::new()).fail_node("Bob");
        assert!(store.create_node(&Node::new("Alice", "Person")).await.is_ok());
        assert!(store.create_node(&Node::new("bob", "Person")).await.is_err());
        assert_eq!(store.count_nodes().await.unwrap(), 1);
    }
}
