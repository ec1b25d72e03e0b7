//! Entities proposed by the model and their resolution against the graph.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value attributes carried by entities, facts, nodes and edges.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Outcome of deciding whether an extracted item already exists in storage.
///
/// `Existing` always carries the storage id it duplicates, so an
/// "existing without id" state cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "existing_id", rename_all = "snake_case")]
pub enum Resolution {
    /// Net-new; will be written by persistence
    New,

    /// Duplicate of the stored row with this id
    Existing(Uuid),
}

impl Resolution {
    /// Whether the item duplicates a stored row.
    pub fn is_existing(&self) -> bool {
        matches!(self, Self::Existing(_))
    }

    /// The duplicated row's id, if any.
    pub fn existing_id(&self) -> Option<Uuid> {
        match self {
            Self::Existing(id) => Some(*id),
            Self::New => None,
        }
    }
}

/// A raw entity proposed by the extraction model.
///
/// The uuid is assigned at extraction time and stays stable for the rest of
/// the pipeline run; facts reference entities by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub node_type: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ExtractedEntity {
    /// Create an entity with a fresh uuid.
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            summary: None,
            node_type: node_type.into(),
            attributes: Attributes::new(),
        }
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Add one attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// An extracted entity after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    #[serde(flatten)]
    pub entity: ExtractedEntity,

    pub resolution: Resolution,

    /// Canonical display name from here on; the stored node's name when the
    /// entity merged into an existing node.
    pub final_name: String,
}

impl ResolvedEntity {
    /// Resolve as a net-new entity, keeping its extracted name.
    pub fn new_entity(entity: ExtractedEntity) -> Self {
        let final_name = entity.name.clone();
        Self {
            entity,
            resolution: Resolution::New,
            final_name,
        }
    }

    /// Resolve as a duplicate of a stored node.
    pub fn existing(entity: ExtractedEntity, node_id: Uuid, final_name: impl Into<String>) -> Self {
        Self {
            entity,
            resolution: Resolution::Existing(node_id),
            final_name: final_name.into(),
        }
    }

    /// Override the canonical name.
    pub fn with_final_name(mut self, final_name: impl Into<String>) -> Self {
        self.final_name = final_name.into();
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.entity.uuid
    }

    pub fn is_existing(&self) -> bool {
        self.resolution.is_existing()
    }

    pub fn existing_id(&self) -> Option<Uuid> {
        self.resolution.existing_id()
    }
}
