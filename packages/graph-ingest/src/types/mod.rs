//! Data types for the ingestion pipeline.

pub mod config;
pub mod entity;
pub mod fact;
pub mod graph;
pub mod ingest;
