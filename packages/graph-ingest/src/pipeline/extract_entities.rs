//! Entity extraction: raw content in, candidate entities out.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::chunk::Chunk;
use super::map_refine::{map_refine, RefineTask};
use super::parse::parse_items;
use super::prompts::{note_entity_prompt, prompt_hash, ENTITY_EXTRACTION_PROMPT};
use super::state::{PipelineState, StageContext, StagePatch};
use crate::error::ParseError;
use crate::traits::llm::{LanguageModel, Role};
use crate::types::config::PipelineConfig;
use crate::types::entity::{Attributes, ExtractedEntity};
use crate::types::ingest::IngestRequest;
use crate::utils::text::{clean_entity_name, normalize_name, truncate_with_ellipsis};

pub(crate) const FIRST_PERSON: &[&str] = &["i", "me", "my", "mine", "myself"];
const DEFAULT_NODE_TYPE: &str = "Entity";
const MAX_CONTEXT_MESSAGE_CHARS: usize = 500;

/// Entity as the model writes it.
#[derive(Debug, Clone, Deserialize)]
struct RawEntity {
    #[serde(alias = "entity", alias = "entity_name")]
    name: String,
    #[serde(default, alias = "description")]
    summary: Option<String>,
    #[serde(default, alias = "nodeType", alias = "type", alias = "entity_type")]
    node_type: Option<String>,
    #[serde(default)]
    attributes: Option<Value>,
}

/// Whether a name is a first-person pronoun.
fn is_first_person(name: &str) -> bool {
    FIRST_PERSON.contains(&name.trim().to_lowercase().as_str())
}

/// Whether the text speaks in the first person anywhere.
fn mentions_first_person(text: &str) -> bool {
    normalize_name(text)
        .split_whitespace()
        .any(|word| FIRST_PERSON.contains(&word))
}

/// Title, URL and chat history rendered ahead of the content.
pub(crate) fn render_request_context(request: &IngestRequest, config: &PipelineConfig) -> String {
    let mut context = String::new();

    if !request.title.trim().is_empty() {
        context.push_str(&format!("Title: {}\n", request.title.trim()));
    }
    if !request.url.trim().is_empty() {
        context.push_str(&format!("URL: {}\n", request.url.trim()));
    }
    context.push_str(&format!("Source type: {}\n", request.source_type.as_str()));

    let skip = request
        .previous_messages
        .len()
        .saturating_sub(config.max_context_messages);
    let history: Vec<String> = request.previous_messages[skip..]
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::User { "user" } else { "assistant" };
            format!(
                "{}: {}",
                role,
                truncate_with_ellipsis(m.content.trim(), MAX_CONTEXT_MESSAGE_CHARS)
            )
        })
        .collect();
    if !history.is_empty() {
        context.push_str("\nConversation so far (context only, do not extract from it):\n");
        context.push_str(&history.join("\n"));
        context.push('\n');
    }

    if let Some(message) = request.current_message.as_deref() {
        if !message.trim().is_empty() && message.trim() != request.extraction_text().trim() {
            context.push_str(&format!(
                "\nCurrent message: {}\n",
                truncate_with_ellipsis(message.trim(), MAX_CONTEXT_MESSAGE_CHARS)
            ));
        }
    }

    context
}

/// Entity extraction plugged into the map-refine engine.
pub struct EntityExtractionTask {
    system: String,
    context: String,
    /// Graph owner's name when extracting from personal notes
    owner: Option<String>,
}

impl EntityExtractionTask {
    pub fn new(request: &IngestRequest, config: &PipelineConfig) -> Self {
        let owner = request
            .source_type
            .is_personal_note()
            .then(|| config.owner_entity_name.clone());
        let system = match owner.as_deref() {
            Some(owner) => note_entity_prompt(owner),
            None => ENTITY_EXTRACTION_PROMPT.to_string(),
        };

        Self {
            system,
            context: render_request_context(request, config),
            owner,
        }
    }

    /// Build a clean entity from the model's proposal, or drop it.
    fn to_entity(&self, raw: RawEntity) -> Option<ExtractedEntity> {
        if let Some(owner) = self.owner.as_deref() {
            if is_first_person(&raw.name) {
                let mut entity = ExtractedEntity::new(owner, "Person");
                entity.summary = raw.summary.filter(|s| !s.trim().is_empty());
                return Some(entity);
            }
        }

        let name = clean_entity_name(&raw.name);
        if name.is_empty() || is_first_person(&name) {
            return None;
        }

        let node_type = raw
            .node_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_NODE_TYPE.to_string());

        let mut entity = ExtractedEntity::new(name, node_type);
        entity.summary = raw
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(Value::Object(attributes)) = raw.attributes {
            entity.attributes = attributes;
        }
        Some(entity)
    }
}

impl RefineTask for EntityExtractionTask {
    type Item = ExtractedEntity;

    fn name(&self) -> &str {
        "entity extraction"
    }

    fn system_prompt(&self) -> String {
        self.system.clone()
    }

    fn user_prompt(
        &self,
        chunk: &Chunk,
        previous: &[&ExtractedEntity],
        error_context: Option<&str>,
    ) -> String {
        let mut prompt = self.context.clone();

        if !previous.is_empty() {
            prompt.push_str("\nEntities found so far:\n");
            for entity in previous {
                prompt.push_str(&format!("- {} ({})\n", entity.name, entity.node_type));
            }
        }

        if let Some(error) = error_context {
            prompt.push_str(&format!("\nYour previous attempt failed: {}\n", error));
        }

        prompt.push_str("\nText:\n");
        prompt.push_str(&chunk.text);
        prompt
    }

    fn parse(&self, response: &str, _chunk: &Chunk) -> Result<Vec<ExtractedEntity>, ParseError> {
        let parsed = parse_items::<RawEntity>(response, &["entities", "results", "items"])?;
        if parsed.skipped > 0 {
            debug!(skipped = parsed.skipped, "Skipped malformed entity objects");
        }
        Ok(parsed
            .items
            .into_iter()
            .filter_map(|raw| self.to_entity(raw))
            .collect())
    }

    fn dedupe_key(&self, entity: &ExtractedEntity) -> Option<String> {
        Some(normalize_name(&entity.name))
    }

    fn merge(&self, existing: &mut ExtractedEntity, incoming: ExtractedEntity) {
        if existing.summary.is_none() {
            existing.summary = incoming.summary;
        }
        if existing.node_type == DEFAULT_NODE_TYPE {
            existing.node_type = incoming.node_type;
        }
        for (key, value) in incoming.attributes {
            existing.attributes.entry(key).or_insert(value);
        }
    }
}

/// Extract candidate entities from the request's content.
pub async fn extract_entities<L>(ctx: &StageContext<'_, L>, _state: &PipelineState) -> StagePatch
where
    L: LanguageModel + ?Sized,
{
    let note_mode = ctx.request.source_type.is_personal_note();
    let temperature = if note_mode {
        ctx.config.note_temperature
    } else {
        ctx.config.extraction_temperature
    };

    let task = EntityExtractionTask::new(ctx.request, ctx.config);
    let text = ctx.request.extraction_text();
    let outcome = map_refine(ctx.llm, &task, text, &ctx.options(temperature), ctx.cancel).await;

    let mut patch = StagePatch::new();
    patch.absorb_engine(&outcome);
    let mut entities = outcome.items;

    // The owner always appears in first-person notes, even if the model missed them
    if note_mode && !outcome.cancelled && mentions_first_person(text) {
        let owner = &ctx.config.owner_entity_name;
        let owner_key = normalize_name(owner);
        if !entities.iter().any(|e| normalize_name(&e.name) == owner_key) {
            entities.push(
                ExtractedEntity::new(owner.clone(), "Person")
                    .with_summary("The author of these notes"),
            );
        }
    }

    info!(
        entities = entities.len(),
        calls = outcome.calls,
        note_mode,
        prompt = %prompt_hash(&task.system_prompt()),
        "Entity extraction complete"
    );
    patch.action(format!(
        "Extracted {} entit{}{}",
        entities.len(),
        if entities.len() == 1 { "y" } else { "ies" },
        if note_mode { " from personal note" } else { "" }
    ));
    patch.entities = Some(entities);
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;
    use crate::traits::llm::ChatMessage;
    use crate::types::graph::SourceType;

    const NEEDLE: &str = "You extract entities";

    async fn run(llm: &MockLlm, request: &IngestRequest, config: &PipelineConfig) -> StagePatch {
        let ctx = StageContext::new(llm, config, request, None);
        extract_entities(&ctx, &PipelineState::default()).await
    }

    #[tokio::test]
    async fn test_names_are_cleaned() {
        let llm = MockLlm::new().respond_when(
            NEEDLE,
            r#"[{"name": "the company Acme Corp", "node_type": "Organization"},
                {"name": "known as Alice", "summary": "An engineer", "nodeType": "Person"},
                {"name": "https://github.com/tokio-rs/tokio", "type": "Project"}]"#,
        );
        let request = IngestRequest::new("p1", "Title", "Alice joined Acme Corp in 2020.");

        let patch = run(&llm, &request, &PipelineConfig::default()).await;
        let names: Vec<String> = patch.entities.unwrap().into_iter().map(|e| e.name).collect();

        assert_eq!(names, vec!["Acme Corp", "Alice", "tokio"]);
        assert!(patch.errors.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_names_merge() {
        let llm = MockLlm::new().respond_when(
            NEEDLE,
            r#"[{"name": "Alice"}, {"name": "alice", "summary": "Engineer", "node_type": "Person"}]"#,
        );
        let request = IngestRequest::new("p1", "Title", "Alice.");

        let patch = run(&llm, &request, &PipelineConfig::default()).await;
        let entities = patch.entities.unwrap();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Alice");
        assert_eq!(entities[0].node_type, "Person");
        assert_eq!(entities[0].summary.as_deref(), Some("Engineer"));
    }

    #[tokio::test]
    async fn test_note_mode_rewrites_pronouns_to_owner() {
        let llm = MockLlm::new().respond_when(
            "personal notes",
            r#"[{"name": "I", "summary": "Likes hiking"}, {"name": "Hiking", "node_type": "Preference"}]"#,
        );
        let request = IngestRequest::new("n1", "Weekend", "I really enjoy hiking.")
            .with_source_type(SourceType::Note);
        let config = PipelineConfig::default().with_owner_entity_name("Sam");

        let patch = run(&llm, &request, &config).await;
        let entities = patch.entities.unwrap();

        assert_eq!(entities[0].name, "Sam");
        assert_eq!(entities[0].node_type, "Person");
        assert_eq!(entities[1].name, "Hiking");

        let call = &llm.calls()[0];
        assert_eq!(call.temperature, config.note_temperature);
        assert!(call.system_prompt().unwrap().contains("the entity named Sam"));
    }

    #[tokio::test]
    async fn test_note_mode_adds_missing_owner() {
        let llm = MockLlm::new().respond_when("personal notes", r#"[{"name": "Lisbon"}]"#);
        let request = IngestRequest::new("n1", "Trip", "My trip to Lisbon was great.")
            .with_source_type(SourceType::Note);

        let patch = run(&llm, &request, &PipelineConfig::default()).await;
        let names: Vec<String> = patch.entities.unwrap().into_iter().map(|e| e.name).collect();

        assert_eq!(names, vec!["Lisbon", "Me"]);
    }

    #[tokio::test]
    async fn test_pronouns_dropped_outside_note_mode() {
        let llm = MockLlm::new().respond_when(NEEDLE, r#"[{"name": "me"}, {"name": "Berlin"}]"#);
        let request = IngestRequest::new("p1", "Title", "Take me to Berlin.");

        let patch = run(&llm, &request, &PipelineConfig::default()).await;
        assert_eq!(patch.entities.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_is_recorded_not_raised() {
        let llm = MockLlm::new().fail_when(NEEDLE, "rate limited");
        let request = IngestRequest::new("p1", "Title", "Alice.");
        let config = PipelineConfig::default().with_max_retries(2);

        let patch = run(&llm, &request, &config).await;

        assert!(patch.entities.unwrap().is_empty());
        assert_eq!(patch.errors.len(), 1);
        assert_eq!(llm.calls().len(), 2);
    }

    #[test]
    fn test_context_includes_recent_history_only() {
        let history = (0..10)
            .map(|i| ChatMessage::user(format!("message {}", i)))
            .collect();
        let request = IngestRequest::new("c1", "Chat", "")
            .with_url("https://example.com")
            .with_conversation(history, "I moved to Berlin");
        let config = PipelineConfig::default();

        let context = render_request_context(&request, &config);

        assert!(context.contains("URL: https://example.com"));
        assert!(context.contains("message 9"));
        assert!(context.contains("message 4"));
        assert!(!context.contains("message 3"));
        // The current message is the extraction text itself, so it is not repeated
        assert!(!context.contains("Current message"));
    }
}
