//! Memory Store
//!
//! Bounded store of memory items retained across task cycles. Each item is a
//! unit of information the agent may want to recall later (an error, a
//! decision, a tool result, file content or a conversation turn). Items are
//! immutable after creation; the store owns them exclusively.
//!
//! When an insertion takes the store over capacity, the lowest-priority items
//! are evicted. Priority is the type bonus plus recency relative to the newest
//! item, so errors and decisions outlive chatter.

pub mod selector;

pub use selector::{
    Exclusion, ExclusionReason, QueryContext, RelevanceScore, RelevanceSelector, ScoreBreakdown,
    SelectionResult,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::text;

/// Memory item type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    Conversation,
    Error,
    Decision,
    ToolResult,
    FileContent,
}

impl MemoryType {
    /// Fixed relevance bonus for the type, in [0, 1]
    pub fn type_bonus(self) -> f64 {
        match self {
            MemoryType::Error => 1.0,
            MemoryType::Decision => 0.9,
            MemoryType::ToolResult => 0.6,
            MemoryType::FileContent => 0.5,
            MemoryType::Conversation => 0.3,
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryType::Conversation => "CONVERSATION",
            MemoryType::Error => "ERROR",
            MemoryType::Decision => "DECISION",
            MemoryType::ToolResult => "TOOL_RESULT",
            MemoryType::FileContent => "FILE_CONTENT",
        };
        write!(f, "{}", s)
    }
}

/// A unit of retained information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique identifier
    pub id: String,

    /// Raw content
    pub content: String,

    /// Tokenized content
    pub tokens: Vec<String>,

    /// Extracted entities
    pub entities: Vec<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Type tag
    pub memory_type: MemoryType,

    /// Ids of the memories or active items this one was produced in response to
    #[serde(default)]
    pub causal_links: Vec<String>,

    /// Estimated token count of the content
    pub token_count: usize,

    /// Associated file paths
    #[serde(default)]
    pub file_paths: Vec<String>,
}

impl MemoryItem {
    /// Create an item, deriving tokens, entities and token count from the content
    pub fn new(memory_type: MemoryType, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4().to_string(),
            tokens: text::tokenize(&content),
            entities: text::extract_entities(&content),
            token_count: text::estimate_tokens(&content),
            content,
            created_at,
            memory_type,
            causal_links: Vec::new(),
            file_paths: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_causal_links(mut self, links: Vec<String>) -> Self {
        self.causal_links = links;
        self
    }

    pub fn with_file_paths(mut self, paths: Vec<String>) -> Self {
        self.file_paths = paths;
        self
    }

    /// Age in minutes at `now`
    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        text::minutes_between(self.created_at, now)
    }
}

/// Exponential recency decay: 1.0 for a fresh item, 0.5 after one half-life
pub fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_minutes: f64) -> f64 {
    if half_life_minutes <= 0.0 {
        return 0.0;
    }
    let age = text::minutes_between(created_at, now);
    0.5_f64.powf(age / half_life_minutes).clamp(0.0, 1.0)
}

/// Bounded, insertion-ordered collection of memory items
#[derive(Debug, Clone)]
pub struct MemoryStore {
    items: Vec<MemoryItem>,
    capacity: usize,
    half_life_minutes: f64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new(capacity: usize, half_life_minutes: f64) -> Self {
        Self {
            items: Vec::new(),
            capacity,
            half_life_minutes,
        }
    }

    /// Insert an item, evicting the lowest-priority items when over capacity.
    ///
    /// Returns the ids of evicted items (possibly including the new one).
    pub fn insert(&mut self, item: MemoryItem) -> Vec<String> {
        debug!(
            "Storing {} memory {} ({} tokens)",
            item.memory_type, item.id, item.token_count
        );
        self.items.push(item);

        let mut evicted = Vec::new();
        while self.items.len() > self.capacity {
            let Some(index) = self.lowest_priority_index() else {
                break;
            };
            let removed = self.items.remove(index);
            debug!("Evicted {} memory {}", removed.memory_type, removed.id);
            evicted.push(removed.id);
        }
        evicted
    }

    /// Index of the item with the lowest retention priority; ties go to the oldest
    fn lowest_priority_index(&self) -> Option<usize> {
        let newest = self.items.iter().map(|i| i.created_at).max()?;

        self.items
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                let pa = self.priority(a, newest);
                let pb = self.priority(b, newest);
                pa.total_cmp(&pb)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| ia.cmp(ib))
            })
            .map(|(index, _)| index)
    }

    fn priority(&self, item: &MemoryItem, newest: DateTime<Utc>) -> f64 {
        item.memory_type.type_bonus()
            + recency_score(item.created_at, newest, self.half_life_minutes)
    }

    /// All items in insertion order
    pub fn items(&self) -> &[MemoryItem] {
        &self.items
    }

    /// Look up an item by id
    pub fn get(&self, id: &str) -> Option<&MemoryItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
