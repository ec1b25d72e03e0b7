//! Storage implementations for the graph.
//!
//! Available backends:
//! - `MemoryGraphStore` - In-memory storage (always available)
//! - `SqliteGraphStore` - SQLite file-based storage (requires `sqlite` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryGraphStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteGraphStore;
