//! Language model trait.
//!
//! The pipeline is provider-agnostic: anything that can answer an
//! OpenAI-style, non-streaming chat completion request can drive it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Speaker role in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Always `false` for pipeline stages
    pub stream: bool,
}

impl ChatRequest {
    /// Build a non-streaming system + user request.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            max_tokens: 2048,
            temperature: 0.0,
            stream: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Content of the system message, if present.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Content of the last user message, if present.
    pub fn user_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// A chat completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub message: ChatResponseMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponseMessage {
    pub content: String,
}

impl ChatResponse {
    /// Wrap plain text as a single-choice response.
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ChatChoice {
                message: ChatResponseMessage {
                    content: content.into(),
                },
            }],
        }
    }

    /// Content of the first choice.
    ///
    /// An empty choice list or blank content is an LLM error, not an empty
    /// result.
    pub fn into_content(self) -> Result<String> {
        let content = self
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GraphError::llm("response contained no choices"))?;

        if content.trim().is_empty() {
            return Err(GraphError::llm("empty response from LLM"));
        }
        Ok(content)
    }
}

/// A chat-completion capable language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Whether the backend is configured and able to take requests.
    fn is_ready(&self) -> bool;

    /// Run a non-streaming chat completion.
    async fn chat_completions(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Context window size of the model, in tokens.
    fn max_model_tokens(&self) -> usize;
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for std::sync::Arc<T> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    async fn chat_completions(&self, request: ChatRequest) -> Result<ChatResponse> {
        (**self).chat_completions(request).await
    }

    fn max_model_tokens(&self) -> usize {
        (**self).max_model_tokens()
    }
}
