//! Reference model providers.
//!
//! These implement [`LanguageModel`](crate::traits::llm::LanguageModel) and
//! [`Embedder`](crate::traits::embedder::Embedder) over OpenAI-compatible
//! REST APIs. Applications can use them directly or bring their own.

mod openai;

pub use openai::{ApiKey, OpenAiClient, OpenAiEmbedder, OpenAiEmbedders};
