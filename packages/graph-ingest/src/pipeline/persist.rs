//! Graph persistence: write the source, new nodes and new edges.
//!
//! Individual write failures are logged and skipped so one bad row never
//! loses the rest of the run. Only an invalid request aborts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{PipelineState, StagePatch};
use crate::error::{GraphError, Result};
use crate::traits::embedder::{try_embed, Embedder};
use crate::traits::store::GraphStore;
use crate::types::graph::{Edge, Node, Source, SourceEdge, SourceNode};
use crate::types::ingest::IngestRequest;
use crate::utils::similarity::{edit_distance, word_overlap_ratio};
use crate::utils::text::normalize_name;

const MIN_SUBSTRING_LEN: usize = 3;
const MIN_EDIT_DISTANCE_LEN: usize = 4;
const MAX_EDIT_DISTANCE: usize = 2;
const MIN_WORD_OVERLAP: f32 = 0.5;

/// Reject requests missing the identifiers persistence needs.
pub fn validate_request(request: &IngestRequest) -> Result<()> {
    if request.page_id.trim().is_empty() {
        return Err(GraphError::Validation { field: "pageId" });
    }
    if request.title.trim().is_empty() {
        return Err(GraphError::Validation { field: "title" });
    }
    Ok(())
}

/// Stored nodes known to this run, searchable by name.
#[derive(Debug, Default)]
pub(crate) struct NodeDirectory {
    entries: Vec<(String, String, Uuid)>,
}

impl NodeDirectory {
    pub(crate) fn insert(&mut self, name: &str, id: Uuid) {
        self.entries.push((name.to_string(), normalize_name(name), id));
    }

    fn exact(&self, normalized: &str) -> Option<Uuid> {
        self.entries
            .iter()
            .find(|(_, n, _)| n == normalized)
            .map(|(_, _, id)| *id)
    }

    /// Find the node a name most plausibly refers to.
    ///
    /// Tried in order: identical name, identical normalized name, one
    /// normalized name containing the other (closest length wins), edit
    /// distance of at most two, and at least half the words shared.
    pub(crate) fn find(&self, name: &str) -> Option<Uuid> {
        if let Some((_, _, id)) = self.entries.iter().find(|(original, _, _)| original == name) {
            return Some(*id);
        }

        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        if let Some(id) = self.exact(&wanted) {
            return Some(id);
        }

        let substring = self
            .entries
            .iter()
            .filter(|(_, n, _)| {
                n.len() >= MIN_SUBSTRING_LEN
                    && wanted.len() >= MIN_SUBSTRING_LEN
                    && (n.contains(wanted.as_str()) || wanted.contains(n.as_str()))
            })
            .min_by_key(|(_, n, _)| n.len().abs_diff(wanted.len()));
        if let Some((_, _, id)) = substring {
            return Some(*id);
        }

        if wanted.chars().count() >= MIN_EDIT_DISTANCE_LEN {
            let closest = self
                .entries
                .iter()
                .map(|(_, n, id)| (edit_distance(n, &wanted), *id))
                .filter(|(distance, _)| *distance <= MAX_EDIT_DISTANCE)
                .min_by_key(|(distance, _)| *distance);
            if let Some((_, id)) = closest {
                return Some(id);
            }
        }

        self.entries
            .iter()
            .map(|(_, n, id)| (word_overlap_ratio(n, &wanted), *id))
            .filter(|(overlap, _)| *overlap >= MIN_WORD_OVERLAP)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, id)| id)
    }
}

/// Build the source row for a request.
fn source_for(request: &IngestRequest) -> Source {
    let mut metadata = request.metadata.clone();
    if !request.url.trim().is_empty() {
        metadata.insert("url".into(), request.url.trim().into());
    }
    metadata.insert("content_hash".into(), Source::hash_content(request.extraction_text()).into());

    Source::new(
        request.source_type,
        request.page_id.trim(),
        request.title.trim(),
        request.reference_timestamp,
    )
    .with_metadata(metadata)
}

/// Write the run's results to the store.
///
/// Returns an error only for an invalid request; every storage failure is
/// recorded in the patch instead.
pub async fn persist_graph<S>(
    store: &S,
    embedder: Option<&Arc<dyn Embedder>>,
    request: &IngestRequest,
    state: &PipelineState,
) -> Result<StagePatch>
where
    S: GraphStore + ?Sized,
{
    validate_request(request)?;
    let mut patch = StagePatch::new();

    let source = match store.create_source(&source_for(request)).await {
        Ok(source) => {
            debug!(source_id = %source.id, "Created source");
            patch.action(format!("Created source \"{}\"", source.name));
            Some(source)
        }
        Err(e) => {
            warn!(error = %e, page_id = %request.page_id, "Failed to create source, continuing without provenance");
            patch.error(format!("source: {}", e));
            None
        }
    };
    let source_id = source.as_ref().map(|s| s.id);

    // Entity uuid -> stored node id
    let mut node_ids: HashMap<Uuid, Uuid> = HashMap::new();
    let mut directory = NodeDirectory::default();
    // Entities whose node could not be written
    let mut failed: HashSet<Uuid> = HashSet::new();

    for resolved in state.resolved_entities.iter().filter(|e| e.is_existing()) {
        if let Some(id) = resolved.existing_id() {
            node_ids.insert(resolved.uuid(), id);
            directory.insert(&resolved.final_name, id);
            if let Some(source_id) = source_id {
                link_node(store, &mut patch, source_id, id).await;
            }
        }
    }

    for resolved in state.resolved_entities.iter().filter(|e| !e.is_existing()) {
        let name = resolved.final_name.trim();
        if name.is_empty() {
            continue;
        }

        // Two entities resolved to the same name share one node
        if let Some(id) = directory.exact(&normalize_name(name)) {
            node_ids.insert(resolved.uuid(), id);
            continue;
        }

        let node = Node::new(name, resolved.entity.node_type.clone())
            .with_summary(resolved.entity.summary.clone())
            .with_attributes(resolved.entity.attributes.clone())
            .with_name_embedding(try_embed(embedder, name).await);

        match store.create_node(&node).await {
            Ok(node) => {
                node_ids.insert(resolved.uuid(), node.id);
                directory.insert(&node.name, node.id);
                if let Some(source_id) = source_id {
                    link_node(store, &mut patch, source_id, node.id).await;
                }
                patch.created_nodes.push(node);
            }
            Err(e) => {
                warn!(error = %e, name, "Failed to create node, skipping");
                patch.error(format!("node \"{}\": {}", name, e));
                failed.insert(resolved.uuid());
            }
        }
    }

    let names: HashMap<Uuid, &str> = state
        .resolved_entities
        .iter()
        .map(|e| (e.uuid(), e.final_name.as_str()))
        .collect();
    let mut known: HashMap<Uuid, bool> = patch.created_nodes.iter().map(|n| (n.id, true)).collect();
    let mut existing_facts = 0;

    for enriched in &state.enriched_facts {
        if enriched.is_existing() {
            existing_facts += 1;
            continue;
        }
        let fact = enriched.fact();

        let lost: Vec<&str> = [fact.source_entity_id, fact.destination_entity_id]
            .into_iter()
            .filter(|entity| failed.contains(entity))
            .map(|entity| names.get(&entity).copied().unwrap_or("?"))
            .collect();
        if !lost.is_empty() {
            warn!(relation = %fact.relation_type, "Fact endpoint node was not created, skipping");
            patch.error(format!(
                "fact \"{}\": node \"{}\" was not created",
                fact.fact_text,
                lost.join("\", \"")
            ));
            continue;
        }

        // Name lookup only for entities that never got a node of their own
        let endpoint = |entity: Uuid| {
            node_ids
                .get(&entity)
                .copied()
                .or_else(|| names.get(&entity).and_then(|name| directory.find(name)))
        };
        let (Some(source_node), Some(destination_node)) =
            (endpoint(fact.source_entity_id), endpoint(fact.destination_entity_id))
        else {
            warn!(relation = %fact.relation_type, "Fact endpoint has no stored node, skipping");
            patch.error(format!("fact \"{}\": endpoint node not found", fact.fact_text));
            continue;
        };
        if source_node == destination_node {
            debug!(relation = %fact.relation_type, "Both endpoints resolved to one node, skipping");
            continue;
        }

        let mut missing = false;
        for id in [source_node, destination_node] {
            if !node_is_stored(store, &mut known, id).await {
                missing = true;
            }
        }
        if missing {
            warn!(relation = %fact.relation_type, "Fact endpoint missing from store, skipping");
            patch.error(format!("fact \"{}\": endpoint node not stored", fact.fact_text));
            continue;
        }

        let mut edge = Edge::new(source_node, destination_node, fact.relation_type.clone(), fact.fact_text.clone());
        edge.valid_at = enriched.temporal.valid_at;
        edge.invalid_at = enriched.temporal.invalid_at;
        edge.attributes = fact.attributes.clone();
        edge.fact_embedding = try_embed(embedder, &fact.fact_text).await;
        edge.type_embedding = try_embed(embedder, &fact.relation_type).await;

        match store.create_edge(&edge).await {
            Ok(edge) => {
                if let Some(source_id) = source_id {
                    let link = SourceEdge {
                        source_id,
                        edge_id: edge.id,
                    };
                    if let Err(e) = store.link_edge(&link).await {
                        warn!(error = %e, edge_id = %edge.id, "Failed to link edge to source");
                        patch.error(format!("{} link: {}", SourceEdge::RELATION, e));
                    }
                }
                patch.created_edges.push(edge);
            }
            Err(e) => {
                warn!(error = %e, relation = %fact.relation_type, "Failed to create edge, skipping");
                patch.error(format!("edge {}: {}", fact.relation_type, e));
            }
        }
    }

    info!(
        nodes = patch.created_nodes.len(),
        edges = patch.created_edges.len(),
        existing_facts,
        errors = patch.errors.len(),
        "Persisted graph"
    );
    patch.action(format!(
        "Created {} node{} and {} edge{}",
        patch.created_nodes.len(),
        if patch.created_nodes.len() == 1 { "" } else { "s" },
        patch.created_edges.len(),
        if patch.created_edges.len() == 1 { "" } else { "s" }
    ));
    if existing_facts > 0 {
        patch.action(format!(
            "Skipped {} fact{} already in the graph",
            existing_facts,
            if existing_facts == 1 { "" } else { "s" }
        ));
    }
    patch.created_source = source;
    Ok(patch)
}

async fn link_node<S: GraphStore + ?Sized>(store: &S, patch: &mut StagePatch, source_id: Uuid, node_id: Uuid) {
    let link = SourceNode { source_id, node_id };
    if let Err(e) = store.link_node(&link).await {
        warn!(error = %e, %node_id, "Failed to link node to source");
        patch.error(format!("{} link: {}", SourceNode::RELATION, e));
    }
}

async fn node_is_stored<S: GraphStore + ?Sized>(store: &S, known: &mut HashMap<Uuid, bool>, id: Uuid) -> bool {
    if let Some(stored) = known.get(&id) {
        return *stored;
    }
    let stored = match store.node_exists(id).await {
        Ok(stored) => stored,
        Err(e) => {
            warn!(error = %e, node_id = %id, "Could not check node existence");
            false
        }
    };
    known.insert(id, stored);
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryGraphStore;
    use crate::testing::{FaultyStore, MockEmbedder};
    use crate::traits::store::{NodeTable, ProvenanceTable};
    use crate::types::entity::{ExtractedEntity, ResolvedEntity};
    use crate::types::fact::{EnrichedFact, ExtractedFact, ResolvedFact, TemporalWindow};
    use chrono::{TimeZone, Utc};

    fn new_entity(name: &str) -> ResolvedEntity {
        ResolvedEntity::new_entity(ExtractedEntity::new(name, "Thing"))
    }

    fn new_fact(src: &ResolvedEntity, dst: &ResolvedEntity, relation: &str) -> EnrichedFact {
        let fact = ExtractedFact::new(src.uuid(), dst.uuid(), relation, format!("{} {} {}", src.final_name, relation, dst.final_name));
        EnrichedFact::new(ResolvedFact::new_fact(fact), TemporalWindow::default())
    }

    fn request() -> IngestRequest {
        IngestRequest::new("page-1", "A page", "Alice joined Acme Corp in 2020.").with_url("https://example.com/a")
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&request()).is_ok());
        assert!(matches!(
            validate_request(&IngestRequest::new(" ", "t", "c")),
            Err(GraphError::Validation { field: "pageId" })
        ));
        assert!(matches!(
            validate_request(&IngestRequest::new("p", "", "c")),
            Err(GraphError::Validation { field: "title" })
        ));
    }

    #[test]
    fn test_directory_fuzzy_lookup() {
        let apple = Uuid::new_v4();
        let acme = Uuid::new_v4();
        let mut directory = NodeDirectory::default();
        directory.insert("Apple Inc.", apple);
        directory.insert("Acme Corp", acme);

        assert_eq!(directory.find("Apple Inc."), Some(apple));
        assert_eq!(directory.find("apple inc"), Some(apple));
        assert_eq!(directory.find("Apple, Inc"), Some(apple));
        assert_eq!(directory.find("Apple"), Some(apple));
        assert_eq!(directory.find("Acme Crop"), Some(acme));
        assert_eq!(directory.find("Zebra"), None);
        assert_eq!(directory.find("?!"), None);
    }

    #[tokio::test]
    async fn test_writes_source_nodes_edges_and_links() {
        let store = MemoryGraphStore::new();
        let alice = new_entity("Alice");
        let acme = new_entity("Acme Corp");
        let mut fact = new_fact(&alice, &acme, "WORKS_FOR");
        fact.temporal.valid_at = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let state = PipelineState {
            resolved_entities: vec![alice, acme],
            enriched_facts: vec![fact],
            ..Default::default()
        };

        let patch = persist_graph(&store, None, &request(), &state).await.unwrap();

        assert_eq!(patch.created_nodes.len(), 2);
        assert_eq!(patch.created_edges.len(), 1);
        assert!(patch.errors.is_empty());
        assert_eq!(patch.created_edges[0].valid_at, Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()));

        let source = patch.created_source.unwrap();
        assert_eq!(source.target_id, "page-1");
        assert_eq!(source.metadata["url"], "https://example.com/a");
        assert!(source.metadata.contains_key("content_hash"));
        assert_eq!(store.nodes_for_source(source.id).await.unwrap().len(), 2);
        assert_eq!(store.edges_for_source(source.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_node_does_not_stop_the_rest() {
        let store = FaultyStore::new(MemoryGraphStore::new()).fail_node("Bob");
        let entities = vec![new_entity("Alice"), new_entity("Bob"), new_entity("Carol")];
        let facts = vec![
            new_fact(&entities[0], &entities[1], "KNOWS"),
            new_fact(&entities[0], &entities[2], "KNOWS"),
        ];
        let state = PipelineState {
            resolved_entities: entities,
            enriched_facts: facts,
            ..Default::default()
        };

        let patch = persist_graph(&store, None, &request(), &state).await.unwrap();

        assert_eq!(patch.created_nodes.len(), 2);
        assert_eq!(patch.created_edges.len(), 1);
        assert_eq!(patch.errors.len(), 2);
        assert_eq!(store.inner().count_nodes().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_facts_of_failed_node_are_skipped() {
        let store = FaultyStore::new(MemoryGraphStore::new()).fail_node("Acme Crop");
        let alice = new_entity("Alice");
        let acme = new_entity("Acme Corp");
        let typo = new_entity("Acme Crop");
        let facts = vec![new_fact(&alice, &typo, "WORKS_FOR"), new_fact(&alice, &acme, "KNOWS")];
        let state = PipelineState {
            resolved_entities: vec![alice, acme, typo],
            enriched_facts: facts,
            ..Default::default()
        };

        let patch = persist_graph(&store, None, &request(), &state).await.unwrap();

        // The typo's fact must not land on the similarly named node
        assert_eq!(patch.created_edges.len(), 1);
        assert_eq!(patch.created_edges[0].edge_type, "KNOWS");
        assert_eq!(patch.errors.len(), 2);
        assert!(patch.errors[1].contains("\"Acme Crop\" was not created"));
    }

    #[test]
    fn test_substring_match_prefers_closest_length() {
        let joanna = Uuid::new_v4();
        let anna = Uuid::new_v4();
        let mut directory = NodeDirectory::default();
        directory.insert("Joanna", joanna);
        directory.insert("Anna", anna);

        assert_eq!(directory.find("Ann"), Some(anna));
        assert_eq!(directory.find("Joann"), Some(joanna));
    }

    #[tokio::test]
    async fn test_existing_entities_and_facts_are_not_rewritten() {
        let store = MemoryGraphStore::new();
        let stored = store.create_node(&Node::new("Acme Corp", "Organization")).await.unwrap();
        let alice = new_entity("Alice");
        let acme = ResolvedEntity::existing(ExtractedEntity::new("acme corp", "Organization"), stored.id, "Acme Corp");
        let edge_fact = ExtractedFact::new(alice.uuid(), acme.uuid(), "WORKS_FOR", "Alice works at Acme");
        let known_fact = ExtractedFact::new(acme.uuid(), alice.uuid(), "EMPLOYS", "Acme employs Alice");
        let state = PipelineState {
            resolved_entities: vec![alice, acme],
            enriched_facts: vec![
                EnrichedFact::new(ResolvedFact::new_fact(edge_fact), TemporalWindow::default()),
                EnrichedFact::new(ResolvedFact::existing(known_fact, Uuid::new_v4()), TemporalWindow::default()),
            ],
            ..Default::default()
        };

        let patch = persist_graph(&store, None, &request(), &state).await.unwrap();

        assert_eq!(patch.created_nodes.len(), 1);
        assert_eq!(patch.created_edges.len(), 1);
        assert_eq!(patch.created_edges[0].destination_id, stored.id);
        assert!(patch.actions.iter().any(|a| a == "Skipped 1 fact already in the graph"));
        assert_eq!(store.count_nodes().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_same_final_name_shares_a_node() {
        let store = MemoryGraphStore::new();
        let first = new_entity("Bob");
        let second = ResolvedEntity::new_entity(ExtractedEntity::new("Bobby", "Person")).with_final_name("bob");
        let other = new_entity("Carol");
        let fact = new_fact(&second, &other, "KNOWS");
        let state = PipelineState {
            resolved_entities: vec![first, second, other],
            enriched_facts: vec![fact],
            ..Default::default()
        };

        let patch = persist_graph(&store, None, &request(), &state).await.unwrap();

        assert_eq!(patch.created_nodes.len(), 2);
        assert_eq!(patch.created_edges[0].source_id, patch.created_nodes[0].id);
    }

    #[tokio::test]
    async fn test_source_failure_keeps_nodes() {
        let store = FaultyStore::new(MemoryGraphStore::new()).fail_sources();
        let state = PipelineState {
            resolved_entities: vec![new_entity("Alice")],
            ..Default::default()
        };

        let patch = persist_graph(&store, None, &request(), &state).await.unwrap();

        assert!(patch.created_source.is_none());
        assert_eq!(patch.created_nodes.len(), 1);
        assert_eq!(patch.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_embeddings_are_optional() {
        let store = MemoryGraphStore::new();
        let embedder = MockEmbedder::new();
        embedder.set_failing(true);
        let embedder: Arc<dyn Embedder> = Arc::new(embedder);
        let alice = new_entity("Alice");
        let acme = new_entity("Acme");
        let state = PipelineState {
            enriched_facts: vec![new_fact(&alice, &acme, "WORKS_FOR")],
            resolved_entities: vec![alice, acme],
            ..Default::default()
        };

        let patch = persist_graph(&store, Some(&embedder), &request(), &state).await.unwrap();

        assert_eq!(patch.created_edges.len(), 1);
        assert!(patch.created_nodes.iter().all(|n| n.name_embedding.is_none()));

        let working: Arc<dyn Embedder> = Arc::new(MockEmbedder::new());
        let patch = persist_graph(&store, Some(&working), &request(), &state).await.unwrap();
        assert!(patch.created_nodes.iter().all(|n| n.name_embedding.is_some()));
        assert!(patch.created_edges[0].fact_embedding.is_some());
    }
}
