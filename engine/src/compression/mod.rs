//! Context Compression
//!
//! Keeps the running conversation within the token budget by applying a
//! prioritized set of lossy rules. How many rules run depends on how full the
//! context is:
//!
//! - below the compress threshold: `FULL`, nothing changes
//! - at or above it: `COMPRESSED`, rules 1-3
//! - at or above the minimal threshold: `MINIMAL`, every rule
//!
//! Messages are never edited in place. Each rule produces a new buffer where a
//! message is either kept, replaced by a smaller one, or dropped. Messages on
//! the preserve list are left alone by every rule.

pub mod rules;

pub use rules::CompressionRule;

use serde::{Deserialize, Serialize};
use sdk::MessageRole;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::config::CompressionConfig;
use crate::text;

/// Flags describing how a message relates to the rest of the conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMetadata {
    /// A later assistant message made this one obsolete
    pub superseded: bool,

    /// The message is a rejected model response
    pub failed_attempt: bool,

    /// The message already is a compression summary
    pub summarized: bool,

    /// Assistant message that requested tool calls
    pub has_tool_calls: bool,

    /// Tool call this message answers, for tool results
    pub tool_call_id: Option<String>,
}

/// A conversation message that the compressor may shrink or drop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressibleMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub token_count: usize,

    /// Turns since creation
    #[serde(default)]
    pub age: u32,

    /// Never compressed when set
    #[serde(default)]
    pub preserved: bool,

    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl CompressibleMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            token_count: text::estimate_tokens(&content),
            content,
            age: 0,
            preserved: false,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn preserved(mut self) -> Self {
        self.preserved = true;
        self
    }

    /// Same message with new content and a recomputed token count
    pub fn with_content(&self, content: String) -> Self {
        Self {
            token_count: text::estimate_tokens(&content),
            content,
            ..self.clone()
        }
    }

    pub fn to_message(&self) -> sdk::Message {
        sdk::Message {
            role: self.role,
            content: self.content.clone(),
            tool_call_id: self.metadata.tool_call_id.clone(),
        }
    }
}

/// How aggressively the conversation is shrunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionLevel {
    Full,
    Compressed,
    Minimal,
}

impl CompressionLevel {
    /// Level for a usage ratio of `current_tokens / token_limit`
    pub fn for_usage(current_tokens: usize, token_limit: usize, config: &CompressionConfig) -> Self {
        if token_limit == 0 {
            return CompressionLevel::Minimal;
        }
        let usage = current_tokens as f64 / token_limit as f64;
        if usage >= config.minimal_threshold {
            CompressionLevel::Minimal
        } else if usage >= config.compress_threshold {
            CompressionLevel::Compressed
        } else {
            CompressionLevel::Full
        }
    }

    /// Rules applied at this level, in ascending priority order
    pub fn rules(self) -> &'static [CompressionRule] {
        match self {
            CompressionLevel::Full => &[],
            CompressionLevel::Compressed => &CompressionRule::ALL[..3],
            CompressionLevel::Minimal => &CompressionRule::ALL,
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressionLevel::Full => "FULL",
            CompressionLevel::Compressed => "COMPRESSED",
            CompressionLevel::Minimal => "MINIMAL",
        };
        write!(f, "{}", s)
    }
}

/// What the conversation said about one entity before it was summarized away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub mentions: usize,
    pub last_message_id: String,
}

/// Entities extracted from summarized messages
pub type EntityTable = BTreeMap<String, EntityRecord>;

/// Everything a compression pass looks at
#[derive(Debug, Clone, Default)]
pub struct CompressionInput {
    pub messages: Vec<CompressibleMessage>,
    pub pending_tool_results: Vec<CompressibleMessage>,
    pub entity_table: EntityTable,
    pub current_tokens: usize,
    pub token_limit: usize,
    pub preserve_ids: HashSet<String>,
}

/// Outcome of a compression pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionResult {
    pub level: CompressionLevel,
    pub messages: Vec<CompressibleMessage>,
    pub pending_tool_results: Vec<CompressibleMessage>,
    pub entity_table: EntityTable,
    pub tokens_saved: usize,

    /// Output tokens over input tokens, at most 1.0
    pub compression_ratio: f64,

    /// Rules that matched at least one message, in application order
    pub rules_applied: Vec<CompressionRule>,
}

/// Applies compression rules to a conversation buffer
#[derive(Debug, Clone)]
pub struct ContextCompressor {
    config: CompressionConfig,
}

impl ContextCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress the conversation according to the current usage level
    pub fn compress(&self, input: CompressionInput) -> CompressionResult {
        let level = CompressionLevel::for_usage(input.current_tokens, input.token_limit, &self.config);

        let CompressionInput {
            messages,
            pending_tool_results,
            mut entity_table,
            preserve_ids,
            ..
        } = input;

        if level == CompressionLevel::Full {
            return CompressionResult {
                level,
                messages,
                pending_tool_results,
                entity_table,
                tokens_saved: 0,
                compression_ratio: 1.0,
                rules_applied: Vec::new(),
            };
        }

        let original_tokens = total_tokens(&messages) + total_tokens(&pending_tool_results);
        let is_preserved =
            |m: &CompressibleMessage| m.preserved || preserve_ids.contains(&m.id);

        let mut current = messages;
        let mut pending = pending_tool_results;
        let mut rules_applied = Vec::new();

        for rule in level.rules() {
            let outcome = rule.apply(current, &mut entity_table, &self.config, &is_preserved);
            current = outcome.messages;
            let mut matched = outcome.matched;

            if *rule == CompressionRule::TruncateToolResults {
                let pending_outcome =
                    rule.apply(pending, &mut entity_table, &self.config, &is_preserved);
                pending = pending_outcome.messages;
                matched |= pending_outcome.matched;
            }

            if matched {
                rules_applied.push(*rule);
            }
        }

        let new_tokens = total_tokens(&current) + total_tokens(&pending);
        let tokens_saved = original_tokens.saturating_sub(new_tokens);
        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            (new_tokens as f64 / original_tokens as f64).min(1.0)
        };

        debug!(
            "Compression level {}: {} -> {} tokens, rules {:?}",
            level, original_tokens, new_tokens, rules_applied
        );

        CompressionResult {
            level,
            messages: current,
            pending_tool_results: pending,
            entity_table,
            tokens_saved,
            compression_ratio,
            rules_applied,
        }
    }
}

/// Sum of token counts
pub fn total_tokens(messages: &[CompressibleMessage]) -> usize {
    messages.iter().map(|m| m.token_count).sum()
}
