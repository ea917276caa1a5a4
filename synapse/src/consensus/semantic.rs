//! Lexical Semantic Comparison
//!
//! Position comparison for consensus and insight detection. Matching is
//! lexical: normalized token sets compared with Jaccard similarity. Anything
//! stronger (embeddings, vector search) is a capability of the external
//! store and deliberately out of scope here.

use std::collections::HashSet;

/// Normalize a text into its set of content tokens. Lowercased, words of
/// three or more characters, punctuation trimmed.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 2)
        .collect()
}

/// Jaccard similarity of two texts over their normalized token sets.
/// Returns 1.0 when both are empty, 0.0 when only one is.
pub fn similarity(a: &str, b: &str) -> f32 {
    let words_a = tokenize(a);
    let words_b = tokenize(b);

    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f32 / union as f32
}

/// Split a text into claims: sentence-level statements with enough content
/// to compare. Short fragments are dropped.
pub fn extract_claims(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', ';', '\n'])
        .map(str::trim)
        .filter(|s| tokenize(s).len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Topic-bearing terms of a text: the longer content tokens, used for
/// novel-connection detection
pub fn topic_terms(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().filter(|w| w.len() >= 5).collect()
}

/// Whether a claim is echoed by any claim in the slice at or above the
/// given similarity
pub fn is_echoed(claim: &str, claims: &[String], threshold: f32) -> bool {
    claims.iter().any(|c| similarity(claim, c) >= threshold)
}

/// Claims from `ours` that have an echo in `theirs` at or above the given
/// similarity. Duplicate overlaps are dropped.
pub fn overlapping_claims(ours: &[String], theirs: &[String], threshold: f32) -> Vec<String> {
    let mut seen = HashSet::new();
    ours.iter()
        .filter(|claim| is_echoed(claim, theirs, threshold))
        .filter(|claim| {
            let mut tokens: Vec<String> = tokenize(claim).into_iter().collect();
            tokens.sort_unstable();
            seen.insert(tokens.join(" "))
        })
        .cloned()
        .collect()
}
