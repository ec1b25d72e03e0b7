//! SQLite graph storage.
//!
//! A file-based backend using SQLite. Good for:
//! - Local, single-user knowledge graphs
//! - Testing with persistent data
//!
//! Ids and timestamps are stored as text, attributes as JSON text and
//! embeddings as little-endian f32 BLOBs. SQLite has no vector index, so
//! similarity is computed in Rust. Full-text search uses FTS5.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{GraphError, Result};
use crate::traits::store::{
    search_terms, EdgeTable, GraphSearch, NodeTable, ProvenanceTable, SourceTable,
};
use crate::types::entity::Attributes;
use crate::types::graph::{Edge, Node, Source, SourceEdge, SourceNode, SourceType};
use crate::utils::cosine_similarity;

/// SQLite-based graph store.
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> GraphError {
    GraphError::Storage(Box::new(e))
}

impl SqliteGraphStore {
    /// Open (creating if needed) the database at `database_url`.
    ///
    /// # Example URLs
    /// - `sqlite://./graph.db` - File-based database
    /// - `sqlite::memory:` - In-memory database (use [`Self::in_memory`])
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    ///
    /// Uses a single connection, since every SQLite connection to
    /// `:memory:` gets its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(db_err)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                name TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                reference_time TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 1.0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sources_target ON sources(target_type, target_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                node_type TEXT NOT NULL,
                name TEXT NOT NULL CHECK (length(trim(name)) > 0),
                summary TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                name_embedding BLOB,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_name ON nodes(lower(trim(name)));
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS edges (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES nodes(id),
                destination_id TEXT NOT NULL REFERENCES nodes(id),
                edge_type TEXT NOT NULL,
                fact_text TEXT NOT NULL,
                valid_at TEXT,
                invalid_at TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                fact_embedding BLOB,
                type_embedding BLOB,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
            CREATE INDEX IF NOT EXISTS idx_edges_destination ON edges(destination_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_nodes (
                source_id TEXT NOT NULL REFERENCES sources(id),
                node_id TEXT NOT NULL REFERENCES nodes(id),
                PRIMARY KEY (source_id, node_id)
            );

            CREATE TABLE IF NOT EXISTS source_edges (
                source_id TEXT NOT NULL REFERENCES sources(id),
                edge_id TEXT NOT NULL REFERENCES edges(id),
                PRIMARY KEY (source_id, edge_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // FTS5 tables for keyword search
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
                id UNINDEXED,
                name,
                summary
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS edges_fts USING fts5(
                id UNINDEXED,
                fact_text
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| GraphError::Storage(Box::new(e)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| GraphError::Storage(Box::new(e)))
}

fn parse_attributes(s: &str) -> Result<Attributes> {
    Ok(serde_json::from_str(s)?)
}

/// FTS5 query matching any of the query's terms.
fn fts_query(query: &str) -> Option<String> {
    let terms = search_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

// Row types for sqlx queries
#[derive(Debug, FromRow)]
struct SourceRow {
    id: String,
    target_type: String,
    target_id: String,
    name: String,
    metadata: String,
    reference_time: String,
    weight: f64,
    created_at: String,
}

impl SourceRow {
    fn into_source(self) -> Result<Source> {
        Ok(Source {
            id: parse_id(&self.id)?,
            target_type: SourceType::from_str(&self.target_type).map_err(GraphError::storage)?,
            target_id: self.target_id,
            name: self.name,
            metadata: parse_attributes(&self.metadata)?,
            reference_time: parse_time(&self.reference_time)?,
            weight: self.weight as f32,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct NodeRow {
    id: String,
    node_type: String,
    name: String,
    summary: Option<String>,
    attributes: String,
    name_embedding: Option<Vec<u8>>,
    created_at: String,
}

impl NodeRow {
    fn into_node(self) -> Result<Node> {
        Ok(Node {
            id: parse_id(&self.id)?,
            node_type: self.node_type,
            name: self.name,
            summary: self.summary,
            attributes: parse_attributes(&self.attributes)?,
            name_embedding: self.name_embedding.as_deref().map(decode_embedding),
            created_at: parse_time(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct EdgeRow {
    id: String,
    source_id: String,
    destination_id: String,
    edge_type: String,
    fact_text: String,
    valid_at: Option<String>,
    invalid_at: Option<String>,
    attributes: String,
    fact_embedding: Option<Vec<u8>>,
    type_embedding: Option<Vec<u8>>,
    created_at: String,
}

impl EdgeRow {
    fn into_edge(self) -> Result<Edge> {
        Ok(Edge {
            id: parse_id(&self.id)?,
            source_id: parse_id(&self.source_id)?,
            destination_id: parse_id(&self.destination_id)?,
            edge_type: self.edge_type,
            fact_text: self.fact_text,
            valid_at: self.valid_at.as_deref().map(parse_time).transpose()?,
            invalid_at: self.invalid_at.as_deref().map(parse_time).transpose()?,
            attributes: parse_attributes(&self.attributes)?,
            fact_embedding: self.fact_embedding.as_deref().map(decode_embedding),
            type_embedding: self.type_embedding.as_deref().map(decode_embedding),
            created_at: parse_time(&self.created_at)?,
        })
    }
}

const NODE_COLUMNS: &str = "id, node_type, name, summary, attributes, name_embedding, created_at";
const EDGE_COLUMNS: &str = "id, source_id, destination_id, edge_type, fact_text, valid_at, invalid_at, attributes, fact_embedding, type_embedding, created_at";

#[async_trait]
impl SourceTable for SqliteGraphStore {
    async fn create_source(&self, source: &Source) -> Result<Source> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, target_type, target_id, name, metadata, reference_time, weight, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source.id.to_string())
        .bind(source.target_type.as_str())
        .bind(&source.target_id)
        .bind(&source.name)
        .bind(serde_json::to_string(&source.metadata)?)
        .bind(source.reference_time.to_rfc3339())
        .bind(source.weight as f64)
        .bind(source.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(source.clone())
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        let row: Option<SourceRow> = sqlx::query_as(
            "SELECT id, target_type, target_id, name, metadata, reference_time, weight, created_at FROM sources WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(SourceRow::into_source).transpose()
    }
}

#[async_trait]
impl NodeTable for SqliteGraphStore {
    async fn create_node(&self, node: &Node) -> Result<Node> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO nodes (id, node_type, name, summary, attributes, name_embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node.id.to_string())
        .bind(&node.node_type)
        .bind(&node.name)
        .bind(node.summary.clone())
        .bind(serde_json::to_string(&node.attributes)?)
        .bind(node.name_embedding.as_deref().map(encode_embedding))
        .bind(node.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("INSERT INTO nodes_fts (id, name, summary) VALUES (?, ?, ?)")
            .bind(node.id.to_string())
            .bind(&node.name)
            .bind(node.summary.as_deref().unwrap_or_default())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(node.clone())
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<Node>> {
        let row: Option<NodeRow> =
            sqlx::query_as(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        row.map(NodeRow::into_node).transpose()
    }

    async fn find_nodes_by_name(&self, name: &str) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM nodes WHERE lower(trim(name)) = lower(?) ORDER BY created_at, id",
            NODE_COLUMNS
        ))
        .bind(name.trim())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    async fn count_nodes(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl EdgeTable for SqliteGraphStore {
    async fn create_edge(&self, edge: &Edge) -> Result<Edge> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO edges (id, source_id, destination_id, edge_type, fact_text, valid_at, invalid_at,
                               attributes, fact_embedding, type_embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(edge.id.to_string())
        .bind(edge.source_id.to_string())
        .bind(edge.destination_id.to_string())
        .bind(&edge.edge_type)
        .bind(&edge.fact_text)
        .bind(edge.valid_at.map(|t| t.to_rfc3339()))
        .bind(edge.invalid_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&edge.attributes)?)
        .bind(edge.fact_embedding.as_deref().map(encode_embedding))
        .bind(edge.type_embedding.as_deref().map(encode_embedding))
        .bind(edge.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("INSERT INTO edges_fts (id, fact_text) VALUES (?, ?)")
            .bind(edge.id.to_string())
            .bind(&edge.fact_text)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(edge.clone())
    }

    async fn get_edge(&self, id: Uuid) -> Result<Option<Edge>> {
        let row: Option<EdgeRow> =
            sqlx::query_as(&format!("SELECT {} FROM edges WHERE id = ?", EDGE_COLUMNS))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        row.map(EdgeRow::into_edge).transpose()
    }

    async fn edges_touching(&self, node_ids: &[Uuid], limit: usize) -> Result<Vec<Edge>> {
        if node_ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = node_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT {} FROM edges WHERE source_id IN ({}) OR destination_id IN ({}) ORDER BY id LIMIT ?",
            EDGE_COLUMNS, placeholders, placeholders
        );

        let mut q = sqlx::query_as::<_, EdgeRow>(&query);
        for _ in 0..2 {
            for id in node_ids {
                q = q.bind(id.to_string());
            }
        }
        let rows = q
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(EdgeRow::into_edge).collect()
    }

    async fn count_edges(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ProvenanceTable for SqliteGraphStore {
    async fn link_node(&self, link: &SourceNode) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO source_nodes (source_id, node_id) VALUES (?, ?)")
            .bind(link.source_id.to_string())
            .bind(link.node_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn link_edge(&self, link: &SourceEdge) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO source_edges (source_id, edge_id) VALUES (?, ?)")
            .bind(link.source_id.to_string())
            .bind(link.edge_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn nodes_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT node_id FROM source_nodes WHERE source_id = ? ORDER BY rowid")
                .bind(source_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        rows.iter().map(|(id,)| parse_id(id)).collect()
    }

    async fn edges_for_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT edge_id FROM source_edges WHERE source_id = ? ORDER BY rowid")
                .bind(source_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        rows.iter().map(|(id,)| parse_id(id)).collect()
    }
}

#[async_trait]
impl GraphSearch for SqliteGraphStore {
    async fn search_nodes_text(&self, query: &str, limit: usize) -> Result<Vec<Node>> {
        let Some(fts) = fts_query(query) else {
            return Ok(vec![]);
        };

        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM nodes
            JOIN (SELECT id AS fts_id, bm25(nodes_fts) AS score FROM nodes_fts WHERE nodes_fts MATCH ?) f
              ON nodes.id = f.fts_id
            ORDER BY (lower(nodes.name) = lower(?)) DESC, f.score
            LIMIT ?
            "#,
            NODE_COLUMNS
        ))
        .bind(fts)
        .bind(query.trim())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    async fn search_nodes_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM nodes WHERE name_embedding IS NOT NULL",
            NODE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut scored = Vec::new();
        for row in rows {
            let node = row.into_node()?;
            let score = node
                .name_embedding
                .as_deref()
                .map(|e| cosine_similarity(embedding, e))
                .unwrap_or(0.0);
            if score >= min_score {
                scored.push((score, node));
            }
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, n)| n).collect())
    }

    async fn search_edges_text(&self, query: &str, limit: usize) -> Result<Vec<Edge>> {
        let Some(fts) = fts_query(query) else {
            return Ok(vec![]);
        };

        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM edges
            JOIN (SELECT id AS fts_id, bm25(edges_fts) AS score FROM edges_fts WHERE edges_fts MATCH ?) f
              ON edges.id = f.fts_id
            ORDER BY f.score
            LIMIT ?
            "#,
            EDGE_COLUMNS
        ))
        .bind(fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(EdgeRow::into_edge).collect()
    }

    async fn search_edges_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<Edge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM edges WHERE fact_embedding IS NOT NULL",
            EDGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut scored = Vec::new();
        for row in rows {
            let edge = row.into_edge()?;
            let score = edge
                .fact_embedding
                .as_deref()
                .map(|e| cosine_similarity(embedding, e))
                .unwrap_or(0.0);
            if score >= min_score {
                scored.push((score, edge));
            }
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, e)| e).collect())
    }
}
