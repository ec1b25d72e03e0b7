//! Similarity measures for vectors and names.

use std::collections::HashSet;

/// Cosine similarity between two vectors.
///
/// Returns `0.0` for empty slices, mismatched lengths, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Levenshtein edit distance over Unicode scalar values.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Share of distinct words two strings have in common (intersection over union).
///
/// Inputs are expected to be pre-normalized (see [`crate::utils::text::normalize_name`]).
pub fn word_overlap_ratio(a: &str, b: &str) -> f32 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();

    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let shared = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    shared as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_cosine_similarity() {
        let a = [1.0_f32, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < EPSILON);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < EPSILON);
        assert!((cosine_similarity(&a, &[-1.0, 0.0, 0.0]) + 1.0).abs() < EPSILON);
        assert!((cosine_similarity(&[3.0, 4.0], &[4.0, 3.0]) - 0.96).abs() < EPSILON);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", "abc"), 0);
        assert_eq!(edit_distance("Apple Inc.", "Apple, Inc"), 2);
        assert_eq!(edit_distance("café", "cafe"), 1);
    }

    #[test]
    fn test_word_overlap_ratio() {
        assert!((word_overlap_ratio("acme corp", "acme corporation") - 1.0 / 3.0).abs() < EPSILON);
        assert!((word_overlap_ratio("rust lang", "lang rust") - 1.0).abs() < EPSILON);
        assert_eq!(word_overlap_ratio("", "anything"), 0.0);
    }
}
