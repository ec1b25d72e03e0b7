//! Pipeline input and output envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::Attributes;
use super::graph::{Edge, Node, Source, SourceType};
use crate::traits::llm::ChatMessage;

/// One captured piece of text to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Text to extract from
    pub content: String,

    /// Page/note title; required for persistence
    pub title: String,

    /// Page URL, empty for notes and chat
    #[serde(default)]
    pub url: String,

    /// Caller's identifier of the captured item; required for persistence
    pub page_id: String,

    /// "Now" for relative date expressions in the content
    pub reference_timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Attributes,

    /// Earlier chat turns, oldest first
    #[serde(default)]
    pub previous_messages: Vec<ChatMessage>,

    /// The chat turn being ingested, if this is a chat capture
    #[serde(default)]
    pub current_message: Option<String>,

    #[serde(default)]
    pub source_type: SourceType,
}

impl IngestRequest {
    /// Create a page ingestion request referenced at the current time.
    pub fn new(
        page_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            title: title.into(),
            url: String::new(),
            page_id: page_id.into(),
            reference_timestamp: Utc::now(),
            metadata: Attributes::new(),
            previous_messages: Vec::new(),
            current_message: None,
            source_type: SourceType::Page,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_reference_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.reference_timestamp = at;
        self
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Attach chat context: earlier turns and the turn being ingested.
    pub fn with_conversation(
        mut self,
        previous_messages: Vec<ChatMessage>,
        current_message: impl Into<String>,
    ) -> Self {
        self.previous_messages = previous_messages;
        self.current_message = Some(current_message.into());
        self
    }

    /// The text extraction runs over: the current chat turn when present,
    /// otherwise the captured content.
    pub fn extraction_text(&self) -> &str {
        match self.current_message.as_deref() {
            Some(message) if !message.trim().is_empty() && self.content.trim().is_empty() => message,
            _ => &self.content,
        }
    }
}

/// Result of one pipeline run.
///
/// Always produced, even under partial failure; `errors` lists what went
/// wrong and `actions` narrates what was done.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub created_nodes: Vec<Node>,
    pub created_edges: Vec<Edge>,
    pub created_source: Option<Source>,
    pub final_message: String,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl IngestOutcome {
    /// Check if the run finished without recorded errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }

    /// Human-readable status line.
    pub fn status_message(nodes: usize, edges: usize, errors: usize, cancelled: bool) -> String {
        let mut message = format!(
            "Created {} node{} and {} edge{}",
            nodes,
            if nodes == 1 { "" } else { "s" },
            edges,
            if edges == 1 { "" } else { "s" },
        );
        if errors > 0 {
            message.push_str(&format!(
                " ({} issue{} logged)",
                errors,
                if errors == 1 { "" } else { "s" }
            ));
        }
        if cancelled {
            message.push_str(" before cancellation");
        }
        message.push('.');
        message
    }
}
