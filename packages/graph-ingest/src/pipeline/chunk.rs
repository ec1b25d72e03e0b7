//! Token estimation and text chunking.
//!
//! Tokens are estimated as `ceil(chars / 4)`. Chunk windows are measured in
//! bytes (`4 * max_tokens`), which can only overestimate the character count,
//! so every chunk's estimate stays within its budget.

use serde::{Deserialize, Serialize};

/// Cheap token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// A slice of the input text handed to one model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,

    /// Byte offset of the chunk in the original text
    pub start: usize,

    /// Byte offset one past the chunk's end
    pub end: usize,

    /// Leading bytes repeated from the previous chunk
    pub overlap: usize,
}

impl Chunk {
    /// A chunk covering the whole of `text`.
    pub fn whole(text: &str) -> Self {
        Self {
            text: text.to_string(),
            start: 0,
            end: text.len(),
            overlap: 0,
        }
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }

    /// The part of the chunk not shared with its predecessor.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap.min(self.text.len())..]
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Find a natural break in `text[lo..hi]`, returning the byte offset just
/// after it. Paragraphs beat sentences beat lines beat words.
fn find_break(text: &str, lo: usize, hi: usize) -> Option<usize> {
    let window = &text[lo..hi];

    if let Some(i) = window.rfind("\n\n") {
        return Some(lo + i + 2);
    }

    let sentence = [". ", "! ", "? ", ".\n", "!\n", "?\n"]
        .iter()
        .filter_map(|sep| window.rfind(sep).map(|i| i + sep.len()))
        .max();
    if let Some(i) = sentence {
        return Some(lo + i);
    }

    if let Some(i) = window.rfind('\n') {
        return Some(lo + i + 1);
    }
    window.rfind(' ').map(|i| lo + i + 1)
}

/// Split `text` into chunks of at most `max_tokens` estimated tokens.
///
/// Consecutive chunks share up to `overlap_tokens` of text (capped at a
/// quarter of the window so the split always makes progress). Dropping each
/// chunk's overlap and concatenating reproduces `text` exactly.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let window = max_tokens.max(1) * 4;
    if text.len() <= window {
        return vec![Chunk::whole(text)];
    }

    let overlap_bytes = (overlap_tokens * 4).min(window / 4);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut overlap = 0;

    loop {
        let hard_end = floor_char_boundary(text, start + window);
        let end = if hard_end >= text.len() {
            text.len()
        } else {
            let lo = floor_char_boundary(text, start + window / 2).max(start);
            find_break(text, lo, hard_end)
                .filter(|&b| b > start)
                .unwrap_or(hard_end)
        };

        chunks.push(Chunk {
            text: text[start..end].to_string(),
            start,
            end,
            overlap,
        });

        if end >= text.len() {
            break;
        }

        let mut next = floor_char_boundary(text, end.saturating_sub(overlap_bytes));
        if next <= start {
            next = end;
        }
        overlap = end - next;
        start = next;
    }

    chunks
}

/// Split line-oriented records into chunks without breaking lines.
///
/// Lines are packed greedily; a single line larger than the budget is split
/// with [`chunk_text`]. Chunks never overlap, so each record is sent once.
pub fn chunk_lines(text: &str, max_tokens: usize) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let window = max_tokens.max(1) * 4;
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut start = 0;
    let mut end = 0;

    for line in text.split_inclusive('\n') {
        let line_start = end;
        let line_end = line_start + line.len();

        if line.len() > window {
            if end > start {
                chunks.push(Chunk {
                    text: text[start..end].to_string(),
                    start,
                    end,
                    overlap: 0,
                });
            }
            for piece in chunk_text(line, max_tokens, 0) {
                chunks.push(Chunk {
                    text: piece.text,
                    start: line_start + piece.start,
                    end: line_start + piece.end,
                    overlap: 0,
                });
            }
            start = line_end;
            end = line_end;
            continue;
        }

        if line_end - start > window {
            chunks.push(Chunk {
                text: text[start..end].to_string(),
                start,
                end,
                overlap: 0,
            });
            start = line_start;
        }
        end = line_end;
    }

    if end > start {
        chunks.push(Chunk {
            text: text[start..end].to_string(),
            start,
            end,
            overlap: 0,
        });
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reconstruct(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.fresh_text()).collect()
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunk_text("Alice joined Acme Corp in 2020.", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].overlap, 0);
    }

    #[test]
    fn test_prefers_sentence_breaks() {
        let text = "First sentence here. Second sentence follows. Third one ends it.";
        let chunks = chunk_text(text, 8, 0);
        assert!(chunks.len() > 1);
        assert!(chunks[0].text.ends_with(". "));
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_overlap_repeats_previous_tail() {
        let text = "word ".repeat(200);
        let chunks = chunk_text(&text, 50, 10);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert!(next.overlap > 0);
            assert_eq!(next.start + next.overlap, prev.end);
            assert!(prev.text.ends_with(&next.text[..next.overlap]));
        }
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_chunk_lines_keeps_records_whole() {
        let text = (0..40)
            .map(|i| format!("[{}] Entity number {} (Thing)\n", i, i))
            .collect::<String>();
        let chunks = chunk_lines(&text, 30);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.estimated_tokens() <= 30);
            assert!(chunk.text.ends_with('\n'));
            assert!(chunk.text.starts_with('['));
        }
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_chunk_lines_splits_oversize_line() {
        let text = format!("short\n{}\ntail\n", "x".repeat(100));
        let chunks = chunk_lines(&text, 10);
        assert!(chunks.iter().all(|c| c.estimated_tokens() <= 10));
        assert_eq!(reconstruct(&chunks), text);
    }

    proptest! {
        #[test]
        fn prop_chunks_fit_budget_and_reconstruct(
            text in "[a-zA-Z0-9 .,!?\n\u{e9}\u{4e2d}]{0,2000}",
            max_tokens in 4usize..200,
            overlap_tokens in 0usize..64,
        ) {
            let chunks = chunk_text(&text, max_tokens, overlap_tokens);
            for chunk in &chunks {
                prop_assert!(chunk.estimated_tokens() <= max_tokens);
                prop_assert!(!chunk.text.is_empty());
            }
            prop_assert_eq!(reconstruct(&chunks), text);
        }

        #[test]
        fn prop_line_chunks_fit_budget_and_reconstruct(
            lines in proptest::collection::vec("[a-z ]{0,120}", 0..40),
            max_tokens in 4usize..100,
        ) {
            let text: String = lines.iter().map(|l| format!("{}\n", l)).collect();
            let chunks = chunk_lines(&text, max_tokens);
            for chunk in &chunks {
                prop_assert!(chunk.estimated_tokens() <= max_tokens);
            }
            prop_assert_eq!(reconstruct(&chunks), text);
        }
    }
}
