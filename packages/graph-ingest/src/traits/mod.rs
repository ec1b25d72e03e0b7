//! Core trait abstractions for the graph ingestion library.
//!
//! These traits define the collaborators that applications provide:
//! a language model, optional embedders, and graph storage.

pub mod embedder;
pub mod llm;
pub mod store;
