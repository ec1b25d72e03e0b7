//! Shared helpers: text cleanup, similarity measures, date parsing.

pub mod datetime;
pub mod similarity;
pub mod text;

pub use datetime::parse_flexible_datetime;
pub use similarity::{cosine_similarity, edit_distance, word_overlap_ratio};
pub use text::{clean_entity_name, extract_json_block, normalize_name, normalize_whitespace};
