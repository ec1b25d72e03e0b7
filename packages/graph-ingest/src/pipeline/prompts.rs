//! LLM prompts for the ingestion pipeline.
//!
//! Every stage asks for a bare JSON array so the two-tier parser can read
//! it; stage-specific context (candidates, entity lists, reference time)
//! is appended to the system prompt by the stage itself.

use sha2::{Digest, Sha256};

/// Entity extraction from pages, selections and chat turns.
pub const ENTITY_EXTRACTION_PROMPT: &str = r#"You extract entities from text for a personal knowledge graph.

An entity is a specific, named thing worth remembering: a person, organization,
place, product, project, event, technology, work, or concept that the text says
something concrete about.

Rules:
- Use the shortest unambiguous proper name ("Acme Corp", not "the company Acme Corp").
- Do not extract pronouns, dates, numbers, or generic nouns ("the team", "a website").
- Do not repeat entities already listed under "Entities found so far".
- summary: one sentence about the entity, based only on the text.
- node_type: a short singular category such as Person, Organization, Location,
  Product, Project, Event, Technology, Concept.
- attributes: optional key/value facts about the entity itself (role, website, ...).

Output JSON array:
[
    {"name": "...", "summary": "...", "node_type": "...", "attributes": {}}
]

Return [] if nothing qualifies."#;

/// Entity extraction from the graph owner's own notes.
///
/// First person refers to the owner, and subjective content (preferences,
/// goals, experiences) counts as knowledge.
pub const NOTE_ENTITY_EXTRACTION_PROMPT: &str = r#"You extract entities from the graph owner's personal notes for their personal knowledge graph.

The notes are written in the first person. "I", "me", "my", "mine" and "myself"
always refer to the owner, who is represented by the entity named {owner}.
Include {owner} (node_type Person) whenever the note says anything about them.

Be generous: personal notes are sparse, and subjective content matters.
Besides people, organizations, places, products and projects, extract:
- Preferences (foods, tools, music, styles the owner likes or dislikes)
- Goals and plans ("learn Rust", "run a marathon")
- Experiences and events ("trip to Lisbon", "job interview at Acme")
- Habits, skills and interests

Rules:
- Use a short, reusable name for each entity ("Rust", "Lisbon trip").
- Do not repeat entities already listed under "Entities found so far".
- summary: one sentence from the owner's perspective.
- node_type: a short singular category such as Person, Organization, Location,
  Preference, Goal, Experience, Skill, Interest, Project.
- attributes: optional key/value details.

Output JSON array:
[
    {"name": "...", "summary": "...", "node_type": "...", "attributes": {}}
]

Return [] if nothing qualifies."#;

/// Entity resolution against existing nodes.
pub const ENTITY_RESOLUTION_PROMPT: &str = r#"You decide whether newly extracted entities duplicate existing graph nodes.

Each new entity is listed as "[id] name (type): summary". For every new entity,
in the order given, decide whether it refers to the same real-world thing as
one of the existing nodes below. Only mark a duplicate when you are confident:
same person, same company, same place. Similar names of different things are
not duplicates.

- id: the new entity's id, copied exactly
- is_duplicate: true or false
- existing_id: the matching existing node's id, or null
- final_name: the best canonical name (the existing node's name when duplicate)

Output JSON array, one object per new entity:
[
    {"id": 0, "is_duplicate": false, "existing_id": null, "final_name": "..."}
]

Existing nodes:
"#;

/// Fact extraction between resolved entities.
pub const FACT_EXTRACTION_PROMPT: &str = r#"You extract relationships (facts) between known entities from text.

A fact is a directed statement connecting two different entities from the
entity list below, e.g. Alice -WORKS_FOR-> Acme Corp.

Rules:
- source_entity and destination_entity must be names copied exactly from the entity list.
- relation_type: UPPER_SNAKE_CASE verb phrase (WORKS_FOR, FOUNDED, LIVES_IN, LIKES).
- fact_text: one sentence stating the fact, grounded in the text.
- attributes: optional key/value details about the relationship.
- Do not repeat facts listed under "Facts found so far".
- Never relate an entity to itself.

Output JSON array:
[
    {"source_entity": "...", "destination_entity": "...", "relation_type": "...", "fact_text": "...", "attributes": {}}
]

Return [] if the text states no relationships.

Entities:
"#;

/// Follow-up pass for entities the first fact pass left unconnected.
pub const UNCONNECTED_FACTS_PROMPT: &str = r#"You look for relationships involving entities that have no facts yet.

The entities under "Unconnected entities" were mentioned in the text, but no
relationship was found for them. Read the text again and find how each of them
relates to any entity in the full entity list: implicit relationships, shared
context, or co-occurrence in the same sentence or paragraph (use MENTIONED_WITH
when nothing more specific is supported).

Rules:
- Every fact must involve at least one unconnected entity.
- source_entity and destination_entity must be names copied exactly from the lists.
- relation_type: UPPER_SNAKE_CASE.
- fact_text: one sentence grounded in the text.

Output JSON array:
[
    {"source_entity": "...", "destination_entity": "...", "relation_type": "...", "fact_text": "...", "attributes": {}}
]
"#;

/// Fact resolution against existing edges.
pub const FACT_RESOLUTION_PROMPT: &str = r#"You decide whether newly extracted facts duplicate existing graph edges.

Each new fact is listed as "[id] SOURCE -RELATION-> DESTINATION: fact text". For
every new fact, in the order given, decide whether it states the same thing as
one of the existing edges below. A fact that adds new information, changes a
value, or relates different entities is not a duplicate.

- id: the new fact's id, copied exactly
- is_duplicate: true or false
- existing_id: the matching existing edge's id, or null

Output JSON array, one object per new fact:
[
    {"id": 0, "is_duplicate": false, "existing_id": null}
]

Existing edges:
"#;

/// Temporal enrichment of new facts.
pub const TEMPORAL_PROMPT: &str = r#"You infer when facts became true and when they stopped being true.

Each fact is listed as "[id] fact text". Use only evidence in the facts and the
source text. Resolve relative expressions ("last year", "two weeks ago")
against the reference time below.

- id: the fact's id, copied exactly
- valid_at: ISO-8601 date or datetime when the fact started being true, or null
- invalid_at: ISO-8601 date or datetime when it stopped being true, or null

If there is no temporal evidence, return null for both. Never guess.

Output JSON array, one object per fact:
[
    {"id": 0, "valid_at": "2020-01-01", "invalid_at": null}
]

Reference time: "#;

/// Render the personal-note prompt for a given owner name.
pub fn note_entity_prompt(owner: &str) -> String {
    NOTE_ENTITY_EXTRACTION_PROMPT.replace("{owner}", owner)
}

/// Hash a prompt for logging which prompt version produced a result.
pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}
