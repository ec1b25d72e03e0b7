//! Persisted graph rows: sources, nodes, edges and provenance join rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::entity::Attributes;

/// Kind of captured input an ingestion came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// A full web page
    #[default]
    Page,

    /// A text selection from a page
    Selection,

    /// A chat turn
    Chat,

    /// A user-authored personal note
    Note,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Selection => "selection",
            Self::Chat => "chat",
            Self::Note => "note",
        }
    }

    /// Personal notes use the first-person extraction mode.
    pub fn is_personal_note(&self) -> bool {
        matches!(self, Self::Note)
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "page" | "webpage" => Ok(Self::Page),
            "selection" => Ok(Self::Selection),
            "chat" | "message" => Ok(Self::Chat),
            "note" | "personal_note" => Ok(Self::Note),
            other => Err(format!("unknown source type: {}", other)),
        }
    }
}

/// Provenance record for one ingestion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub target_type: SourceType,
    /// Identifier of the captured page/selection/chat in the caller's system
    pub target_id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Attributes,
    pub reference_time: DateTime<Utc>,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(
        target_type: SourceType,
        target_id: impl Into<String>,
        name: impl Into<String>,
        reference_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            target_type,
            target_id: target_id.into(),
            name: name.into(),
            metadata: Attributes::new(),
            reference_time,
            weight: 1.0,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Attributes) -> Self {
        self.metadata = metadata;
        self
    }

    /// Calculate SHA-256 hash of ingested content.
    pub fn hash_content(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A persisted graph vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub node_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_type: node_type.into(),
            name: name.into(),
            summary: None,
            attributes: Attributes::new(),
            name_embedding: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary;
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_name_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.name_embedding = embedding;
        self
    }
}

/// A persisted, directed relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub destination_id: Uuid,
    pub edge_type: String,
    pub fact_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(
        source_id: Uuid,
        destination_id: Uuid,
        edge_type: impl Into<String>,
        fact_text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source_id,
            destination_id,
            edge_type: edge_type.into(),
            fact_text: fact_text.into(),
            valid_at: None,
            invalid_at: None,
            attributes: Attributes::new(),
            fact_embedding: None,
            type_embedding: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this edge connects the two nodes, optionally in either direction.
    pub fn connects(&self, source_id: Uuid, destination_id: Uuid, either_direction: bool) -> bool {
        (self.source_id == source_id && self.destination_id == destination_id)
            || (either_direction
                && self.source_id == destination_id
                && self.destination_id == source_id)
    }
}

/// Join row: a node was mentioned in a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceNode {
    pub source_id: Uuid,
    pub node_id: Uuid,
}

impl SourceNode {
    pub const RELATION: &'static str = "MENTIONED_IN";
}

/// Join row: an edge was extracted from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceEdge {
    pub source_id: Uuid,
    pub edge_id: Uuid,
}

impl SourceEdge {
    pub const RELATION: &'static str = "EXTRACTED_FROM";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_parse() {
        assert_eq!("Note".parse::<SourceType>(), Ok(SourceType::Note));
        assert_eq!("webpage".parse::<SourceType>(), Ok(SourceType::Page));
        assert!("fax".parse::<SourceType>().is_err());
        assert!(SourceType::Note.is_personal_note());
        assert!(!SourceType::Chat.is_personal_note());
    }

    #[test]
    fn test_edge_connects_directionality() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let edge = Edge::new(a, b, "REPORTS_TO", "A reports to B");

        assert!(edge.connects(a, b, false));
        assert!(!edge.connects(b, a, false));
        assert!(edge.connects(b, a, true));
    }

    #[test]
    fn test_hash_content_is_stable() {
        assert_eq!(Source::hash_content("abc"), Source::hash_content("abc"));
        assert_ne!(Source::hash_content("abc"), Source::hash_content("abd"));
    }
}
