//! Optional embedding backends.
//!
//! Embeddings are an enhancement: nodes and edges without vectors are valid,
//! so every caller treats a missing, unready or failing embedder as "no
//! embedding" rather than an error.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;

/// Turns text into a vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Whether the model is loaded and able to embed.
    fn is_ready(&self) -> bool;

    /// Embed a single text.
    async fn text_to_vector(&self, text: &str) -> Result<Vec<f32>>;
}

/// Lookup of named embedders.
pub trait EmbedderRegistry: Send + Sync {
    /// Get the embedder registered under `name`.
    fn get(&self, name: &str) -> Option<Arc<dyn Embedder>>;
}

/// Embed `text` if an embedder is available and ready, logging and
/// swallowing failures.
pub async fn try_embed(embedder: Option<&Arc<dyn Embedder>>, text: &str) -> Option<Vec<f32>> {
    let embedder = embedder?;
    if !embedder.is_ready() || text.trim().is_empty() {
        return None;
    }

    match embedder.text_to_vector(text).await {
        Ok(vector) if !vector.is_empty() => Some(vector),
        Ok(_) => {
            warn!(text_len = text.len(), "Embedder returned an empty vector");
            None
        }
        Err(e) => {
            warn!(error = %e, text_len = text.len(), "Embedding failed, continuing without vector");
            None
        }
    }
}
