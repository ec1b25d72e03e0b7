//! OpenAI chat-completions and embeddings clients.
//!
//! # Example
//!
//! ```rust,ignore
//! use graph_ingest::ai::{OpenAiClient, OpenAiEmbedders};
//!
//! let llm = OpenAiClient::new("sk-...").with_model("gpt-4o-mini");
//! let embedders = OpenAiEmbedders::new(llm.embedder());
//! let pipeline = GraphPipeline::new(store, llm).with_embedders(Arc::new(embedders));
//! ```

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::traits::embedder::{Embedder, EmbedderRegistry};
use crate::traits::llm::{ChatMessage, ChatRequest, ChatResponse, LanguageModel};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_MAX_MODEL_TOKENS: usize = 128_000;

/// An API key that never shows up in logs or debug output.
pub struct ApiKey(SecretBox<str>);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretBox::new(Box::from(value.into().as_str())))
    }

    /// Expose the key. Only call this when building a request.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl Clone for ApiKey {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// OpenAI-compatible chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: ApiKey,
    model: String,
    base_url: String,
    max_model_tokens: usize,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: ApiKey::new(api_key),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_model_tokens: DEFAULT_MAX_MODEL_TOKENS,
        }
    }

    /// Create from environment variable `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| GraphError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set the chat model (default: gpt-4o).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set a custom base URL (for Azure, proxies, local servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model's context window.
    pub fn with_max_model_tokens(mut self, tokens: usize) -> Self {
        self.max_model_tokens = tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// An embedder sharing this client's connection pool, key and base URL.
    pub fn embedder(&self) -> OpenAiEmbedder {
        OpenAiEmbedder {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            base_url: self.base_url.clone(),
        }
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn is_ready(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn chat_completions(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = CompletionBody {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        debug!(model = %self.model, max_tokens = request.max_tokens, "Sending chat completion");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::Llm(Box::new(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(GraphError::llm(format!("OpenAI API error {}: {}", status, error_text)));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| GraphError::Llm(Box::new(e)))
    }

    fn max_model_tokens(&self) -> usize {
        self.max_model_tokens
    }
}

/// OpenAI-compatible embeddings.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    api_key: ApiKey,
    model: String,
    base_url: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: ApiKey::new(api_key),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Set the embedding model (default: text-embedding-3-small).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn is_ready(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn text_to_vector(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingBody {
            model: &self.model,
            input: text,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GraphError::Embedding(format!("OpenAI embedding error: {}", error_text)));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| GraphError::Embedding(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| GraphError::Embedding("no embedding in response".into()))
    }
}

/// Named OpenAI embedders.
#[derive(Default)]
pub struct OpenAiEmbedders {
    embedders: HashMap<String, Arc<dyn Embedder>>,
}

impl OpenAiEmbedders {
    /// Registry with `embedder` under the name "default".
    pub fn new(embedder: OpenAiEmbedder) -> Self {
        Self::default().with("default", embedder)
    }

    pub fn with(mut self, name: impl Into<String>, embedder: OpenAiEmbedder) -> Self {
        self.embedders.insert(name.into(), Arc::new(embedder));
        self
    }
}

impl EmbedderRegistry for OpenAiEmbedders {
    fn get(&self, name: &str) -> Option<Arc<dyn Embedder>> {
        self.embedders.get(name).cloned()
    }
}
