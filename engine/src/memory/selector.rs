//! Memory Relevance Selector
//!
//! Scores candidate memories against a query and picks the subset to include in
//! the model context under a token budget.
//!
//! # Algorithm
//!
//! 1. Score every candidate (weighted sum of keyword, entity, recency, causal,
//!    path and type components)
//! 2. Sort by score descending, then newest first, then id
//! 3. Admit mandatory items regardless of score or budget
//! 4. Walk the rest in order, excluding duplicates (normalized content hash),
//!    low-relevance items and items that do not fit the remaining budget

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::config::MemoryConfig;
use crate::text;

use super::{recency_score, MemoryItem, MemoryType};

/// Query built per selection call
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub tokens: Vec<String>,
    pub entities: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub active_memory_ids: HashSet<String>,
    pub active_file_paths: HashSet<String>,
}

impl QueryContext {
    /// Build a query context from free text
    pub fn from_text(query: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            tokens: text::tokenize(query),
            entities: text::extract_entities(query),
            timestamp,
            active_memory_ids: HashSet::new(),
            active_file_paths: HashSet::new(),
        }
    }

    pub fn with_active_memories(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.active_memory_ids.extend(ids);
        self
    }

    pub fn with_active_files(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.active_file_paths.extend(paths);
        self
    }
}

/// Unweighted score components, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub keyword: f64,
    pub entity: f64,
    pub recency: f64,
    pub causal: f64,
    pub path: f64,
    pub type_bonus: f64,
}

/// Weighted relevance score of one memory item
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelevanceScore {
    pub total: f64,
    pub breakdown: ScoreBreakdown,
}

/// Why a candidate was left out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    LowRelevance,
    TokenBudgetExceeded,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub id: String,
    pub reason: ExclusionReason,
    pub score: f64,
}

/// Outcome of one selection call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    /// Admitted items, mandatory first, then in score order
    pub selected: Vec<MemoryItem>,

    /// Scores of the admitted items by id
    pub scores: BTreeMap<String, RelevanceScore>,

    /// Sum of token counts of the admitted items
    pub total_tokens: usize,

    /// Ids of the admitted items that were mandatory
    pub mandatory: Vec<String>,

    pub excluded: Vec<Exclusion>,
}

impl SelectionResult {
    pub fn selected_ids(&self) -> Vec<&str> {
        self.selected.iter().map(|i| i.id.as_str()).collect()
    }
}

/// Scores and selects memory items for the model context
#[derive(Debug, Clone)]
pub struct RelevanceSelector {
    config: MemoryConfig,
}

impl RelevanceSelector {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    /// Score one item against a query
    pub fn score(&self, item: &MemoryItem, query: &QueryContext) -> RelevanceScore {
        let breakdown = ScoreBreakdown {
            keyword: text::jaccard_similarity(&item.tokens, &query.tokens),
            entity: entity_overlap(&item.entities, &query.entities),
            recency: recency_score(
                item.created_at,
                query.timestamp,
                self.config.recency_half_life_minutes,
            ),
            causal: causal_match(item, &query.active_memory_ids),
            path: path_overlap(&item.file_paths, &query.active_file_paths),
            type_bonus: item.memory_type.type_bonus(),
        };

        let w = &self.config.weights;
        let total = w.keyword * breakdown.keyword
            + w.entity * breakdown.entity
            + w.recency * breakdown.recency
            + w.causal * breakdown.causal
            + w.path * breakdown.path
            + w.type_bonus * breakdown.type_bonus;

        RelevanceScore {
            total: total.clamp(0.0, 1.0),
            breakdown,
        }
    }

    /// Ids that must be included regardless of relevance:
    /// recent items, recent errors and the most recent decisions.
    ///
    /// Returned in candidate order, without duplicates.
    pub fn mandatory_ids(&self, candidates: &[MemoryItem], now: DateTime<Utc>) -> Vec<String> {
        let mut decisions: Vec<&MemoryItem> = candidates
            .iter()
            .filter(|i| i.memory_type == MemoryType::Decision)
            .collect();
        decisions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let recent_decisions: HashSet<&str> = decisions
            .iter()
            .take(self.config.mandatory_decision_count)
            .map(|i| i.id.as_str())
            .collect();

        let mut seen = HashSet::new();
        candidates
            .iter()
            .filter(|item| {
                let age = item.age_minutes(now);
                age <= self.config.mandatory_recent_minutes
                    || (item.memory_type == MemoryType::Error
                        && age <= self.config.mandatory_error_minutes)
                    || recent_decisions.contains(item.id.as_str())
            })
            .filter(|item| seen.insert(item.id.clone()))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Select items under `budget` tokens, always admitting `mandatory_ids`.
    ///
    /// Mandatory items are admitted even if they alone exceed the budget; the
    /// remaining budget for other items is then zero.
    pub fn select(
        &self,
        candidates: &[MemoryItem],
        query: &QueryContext,
        budget: usize,
        mandatory_ids: &[String],
    ) -> SelectionResult {
        let mut result = SelectionResult::default();
        if candidates.is_empty() {
            return result;
        }

        let mut scored: Vec<(&MemoryItem, RelevanceScore)> = candidates
            .iter()
            .map(|item| (item, self.score(item, query)))
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total
                .partial_cmp(&sa.total)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mandatory: HashSet<&str> = mandatory_ids.iter().map(String::as_str).collect();
        let mut admitted_ids: HashSet<&str> = HashSet::new();
        let mut seen_hashes: HashSet<String> = HashSet::new();

        // Mandatory items first, in score order
        for (item, score) in scored.iter().filter(|(i, _)| mandatory.contains(i.id.as_str())) {
            if !admitted_ids.insert(item.id.as_str()) {
                continue;
            }
            seen_hashes.insert(text::content_hash(&item.content));
            result.total_tokens += item.token_count;
            result.mandatory.push(item.id.clone());
            result.scores.insert(item.id.clone(), *score);
            result.selected.push((*item).clone());
        }

        let mandatory_tokens = result.total_tokens;
        let remaining_budget = budget.saturating_sub(mandatory_tokens);
        let mut used = 0usize;

        for (item, score) in &scored {
            if admitted_ids.contains(item.id.as_str()) {
                continue;
            }
            let hash = text::content_hash(&item.content);
            if !seen_hashes.insert(hash) {
                result.excluded.push(exclusion(item, score, ExclusionReason::Duplicate));
                continue;
            }
            if score.total < self.config.relevance_threshold {
                result.excluded.push(exclusion(item, score, ExclusionReason::LowRelevance));
                continue;
            }
            if used + item.token_count > remaining_budget {
                result
                    .excluded
                    .push(exclusion(item, score, ExclusionReason::TokenBudgetExceeded));
                continue;
            }
            used += item.token_count;
            admitted_ids.insert(item.id.as_str());
            result.scores.insert(item.id.clone(), *score);
            result.selected.push((*item).clone());
        }

        result.total_tokens = mandatory_tokens + used;

        debug!(
            "Selected {} of {} memories ({} mandatory, {} tokens, budget {})",
            result.selected.len(),
            candidates.len(),
            result.mandatory.len(),
            result.total_tokens,
            budget
        );
        if mandatory_tokens > budget {
            debug!(
                "Mandatory memories alone use {} tokens, over budget {}",
                mandatory_tokens, budget
            );
        }

        result
    }

    /// Select with the mandatory set computed by policy at the query timestamp
    pub fn select_with_policy(
        &self,
        candidates: &[MemoryItem],
        query: &QueryContext,
        budget: usize,
    ) -> SelectionResult {
        let mandatory = self.mandatory_ids(candidates, query.timestamp);
        self.select(candidates, query, budget, &mandatory)
    }
}

fn exclusion(item: &MemoryItem, score: &RelevanceScore, reason: ExclusionReason) -> Exclusion {
    Exclusion {
        id: item.id.clone(),
        reason,
        score: score.total,
    }
}

fn entity_overlap(item_entities: &[String], query_entities: &[String]) -> f64 {
    if query_entities.is_empty() {
        return 0.0;
    }
    let item: HashSet<&str> = item_entities.iter().map(String::as_str).collect();
    let query: HashSet<&str> = query_entities.iter().map(String::as_str).collect();
    item.intersection(&query).count() as f64 / query.len() as f64
}

fn causal_match(item: &MemoryItem, active_ids: &HashSet<String>) -> f64 {
    if active_ids.contains(&item.id) || item.causal_links.iter().any(|l| active_ids.contains(l)) {
        1.0
    } else {
        0.0
    }
}

fn path_overlap(item_paths: &[String], active_paths: &HashSet<String>) -> f64 {
    let paths: HashSet<&str> = item_paths.iter().map(String::as_str).collect();
    if paths.is_empty() {
        return 0.0;
    }
    let hits = paths.iter().filter(|p| active_paths.contains(**p)).count();
    hits as f64 / paths.len() as f64
}
