//! Text Utilities
//!
//! Tokenization, token-count estimation, similarity, entity extraction and
//! content hashing shared by the memory selector, the quality evaluator and
//! the context compressor. Everything here is pure and deterministic.

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Average characters per token (rough estimate: 1 token ≈ 4 characters)
pub const CHARS_PER_TOKEN: usize = 4;

/// Number of normalized characters that participate in the content hash
const HASH_PREFIX_CHARS: usize = 200;

/// Minimum length for a token to be kept
const MIN_TOKEN_LEN: usize = 2;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "does", "for", "from",
    "has", "have", "how", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of",
    "on", "or", "our", "so", "that", "the", "their", "then", "there", "these", "this", "to",
    "was", "we", "were", "what", "when", "where", "which", "who", "why", "will", "with", "you",
    "your",
];

/// Split text into lowercase word tokens, dropping stop words and very short tokens.
///
/// Order and duplicates are preserved; use [`token_set`] for set semantics.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Set view over a token list
pub fn token_set(tokens: &[String]) -> HashSet<&str> {
    tokens.iter().map(String::as_str).collect()
}

/// Estimate the number of tokens in a text from its character count
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Jaccard similarity of two token lists, treated as sets.
///
/// Returns 0.0 when both are empty.
pub fn jaccard_similarity(a: &[String], b: &[String]) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / union as f64
}

static ENTITY_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Patterns for code-ish entities. When a pattern has a capture group, the
/// group is the entity; otherwise the whole match is.
fn entity_patterns() -> &'static Vec<Regex> {
    ENTITY_PATTERNS.get_or_init(|| {
        vec![
            // File paths: src/agent/core.rs, Cargo.toml
            Regex::new(
                r"(?:[A-Za-z0-9_.-]+/)*[A-Za-z0-9_-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|c|h|cpp|hpp|md|toml|json|yaml|yml|sh|txt|lock)\b",
            )
            .expect("Invalid path pattern"),
            // Inline code spans
            Regex::new(r"`([^`\n]{1,80})`").expect("Invalid code span pattern"),
            // CamelCase identifiers
            Regex::new(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+\b").expect("Invalid camel pattern"),
            // snake_case identifiers
            Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("Invalid snake pattern"),
            // Call sites: name(
            Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]{2,})\(").expect("Invalid call pattern"),
        ]
    })
}

/// Extract entity mentions (paths, code spans, identifiers) in order of first appearance.
///
/// Mentions are de-duplicated exactly; the first occurrence wins.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for pattern in entity_patterns() {
        for caps in pattern.captures_iter(text) {
            let Some(m) = caps.get(1).or_else(|| caps.get(0)) else {
                continue;
            };
            let value = m.as_str().trim();
            if value.is_empty() {
                continue;
            }
            found.push((m.start(), value.to_string()));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter_map(|(_, value)| seen.insert(value.clone()).then_some(value))
        .collect()
}

/// Normalize content for duplicate detection: case-folded, whitespace runs
/// collapsed, truncated to the hash prefix length.
pub fn normalize_content(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(HASH_PREFIX_CHARS).collect()
}

/// SHA-256 hex digest of the normalized content
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_content(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Fractional minutes from `earlier` to `later`, never negative
pub fn minutes_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let millis = later.signed_duration_since(earlier).num_milliseconds();
    (millis.max(0) as f64) / 60_000.0
}

/// Current wall-clock time; the only non-deterministic input to the layer
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Truncate to at most `max_chars` characters, on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Last `max_chars` characters of `text`, on a char boundary
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    match text.char_indices().nth(total - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
