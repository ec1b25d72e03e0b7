//! Relationships ("facts") between extracted entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{Attributes, Resolution};

/// A directed relationship proposed by the model.
///
/// Endpoint ids reference [`super::entity::ExtractedEntity::uuid`], not
/// storage ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub uuid: Uuid,
    pub source_entity_id: Uuid,
    pub destination_entity_id: Uuid,
    pub relation_type: String,
    pub fact_text: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Individual texts already folded into `fact_text`
    #[serde(skip)]
    absorbed_texts: Vec<String>,
}

impl ExtractedFact {
    /// Create a fact with a fresh uuid. The relation type is normalized to
    /// UPPER_SNAKE_CASE.
    pub fn new(
        source_entity_id: Uuid,
        destination_entity_id: Uuid,
        relation_type: &str,
        fact_text: impl Into<String>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            source_entity_id,
            destination_entity_id,
            relation_type: normalize_relation_type(relation_type),
            fact_text: fact_text.into(),
            attributes: Attributes::new(),
            absorbed_texts: Vec::new(),
        }
    }

    /// Ordered identity used to merge duplicate proposals.
    pub fn merge_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.source_entity_id, self.destination_entity_id, self.relation_type
        )
    }

    /// Fold another proposal with the same merge key into this one.
    ///
    /// Distinct fact texts are joined with "; "; attributes are shallow-merged
    /// with the incoming keys winning.
    pub fn absorb(&mut self, other: ExtractedFact) {
        if self.absorbed_texts.is_empty() && !self.fact_text.trim().is_empty() {
            self.absorbed_texts.push(self.fact_text.trim().to_string());
        }

        let incoming = if other.absorbed_texts.is_empty() {
            vec![other.fact_text.trim().to_string()]
        } else {
            other.absorbed_texts
        };
        for text in incoming {
            if text.is_empty() || self.absorbed_texts.contains(&text) {
                continue;
            }
            if self.fact_text.trim().is_empty() {
                self.fact_text = text.clone();
            } else {
                self.fact_text = format!("{}; {}", self.fact_text, text);
            }
            self.absorbed_texts.push(text);
        }

        for (key, value) in other.attributes {
            self.attributes.insert(key, value);
        }
    }

    /// Whether the given entity is either endpoint.
    pub fn touches(&self, entity_id: Uuid) -> bool {
        self.source_entity_id == entity_id || self.destination_entity_id == entity_id
    }
}

/// A fact after resolution against stored edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFact {
    #[serde(flatten)]
    pub fact: ExtractedFact,
    pub resolution: Resolution,
}

impl ResolvedFact {
    pub fn new_fact(fact: ExtractedFact) -> Self {
        Self {
            fact,
            resolution: Resolution::New,
        }
    }

    pub fn existing(fact: ExtractedFact, edge_id: Uuid) -> Self {
        Self {
            fact,
            resolution: Resolution::Existing(edge_id),
        }
    }

    pub fn is_existing(&self) -> bool {
        self.resolution.is_existing()
    }

    pub fn existing_id(&self) -> Option<Uuid> {
        self.resolution.existing_id()
    }
}

/// Validity window inferred from textual evidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<DateTime<Utc>>,
}

impl TemporalWindow {
    pub fn is_empty(&self) -> bool {
        self.valid_at.is_none() && self.invalid_at.is_none()
    }
}

/// A resolved fact with its inferred validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFact {
    #[serde(flatten)]
    pub resolved: ResolvedFact,
    #[serde(default)]
    pub temporal: TemporalWindow,
}

impl EnrichedFact {
    pub fn new(resolved: ResolvedFact, temporal: TemporalWindow) -> Self {
        Self { resolved, temporal }
    }

    pub fn fact(&self) -> &ExtractedFact {
        &self.resolved.fact
    }

    pub fn is_existing(&self) -> bool {
        self.resolved.is_existing()
    }
}

/// Normalize a relation label to UPPER_SNAKE_CASE ("works for" → "WORKS_FOR").
pub fn normalize_relation_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.extend(c.to_uppercase());
        } else {
            pending_separator = true;
        }
    }

    if out.is_empty() {
        "RELATED_TO".to_string()
    } else {
        out
    }
}
