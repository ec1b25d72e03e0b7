//! Typed errors for the graph ingestion library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;

/// Errors that can occur during graph ingestion.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Language model unavailable or the call failed
    #[error("LLM error: {0}")]
    Llm(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Embedding backend failed
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A required identifier is missing from the ingestion request
    #[error("validation failed: missing {field}")]
    Validation { field: &'static str },

    /// LLM response could not be parsed by any strategy
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Prompt cannot be reduced to fit the token budget
    #[error("token budget exceeded: {needed} tokens needed, {budget} available")]
    Budget { needed: usize, budget: usize },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl GraphError {
    /// Wrap any displayable error as an LLM failure.
    pub fn llm(message: impl Into<String>) -> Self {
        Self::Llm(message.into().into())
    }

    /// Wrap any displayable error as a storage failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into().into())
    }
}

/// Both tiers of response parsing failed.
#[derive(Debug, Error)]
#[error("could not parse LLM response: {reason} (response starts with {excerpt:?})")]
pub struct ParseError {
    /// Why the last strategy gave up
    pub reason: String,

    /// Leading characters of the offending response
    pub excerpt: String,
}

impl ParseError {
    /// Build a parse error, keeping a short excerpt of the response.
    pub fn new(reason: impl Into<String>, response: &str) -> Self {
        Self {
            reason: reason.into(),
            excerpt: crate::utils::text::truncate_with_ellipsis(response.trim(), 120),
        }
    }
}

/// Result type alias for graph ingestion operations.
pub type Result<T> = std::result::Result<T, GraphError>;
