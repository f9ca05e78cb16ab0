//! Compression rules
//!
//! Each rule walks the buffer once and decides per message whether to keep it,
//! replace it with a smaller message, or drop it. A replacement is only used
//! when it is strictly smaller than the original.

use sdk::MessageRole;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::CompressionConfig;
use crate::text::{self, CHARS_PER_TOKEN};

use super::{CompressibleMessage, EntityRecord, EntityTable};

/// Maximum entities listed in a summary line
const MAX_SUMMARY_ENTITIES: usize = 12;

/// Maximum characters of a failed attempt kept in its one-line summary
const FAILED_ATTEMPT_PREVIEW_CHARS: usize = 80;

/// Compression rules in ascending priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionRule {
    TruncateToolResults,
    FoldCodeBlocks,
    DropSuperseded,
    SummarizeOldMessages,
    CollapseFailedAttempts,
}

impl fmt::Display for CompressionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressionRule::TruncateToolResults => "TRUNCATE_TOOL_RESULTS",
            CompressionRule::FoldCodeBlocks => "FOLD_CODE_BLOCKS",
            CompressionRule::DropSuperseded => "DROP_SUPERSEDED",
            CompressionRule::SummarizeOldMessages => "SUMMARIZE_OLD_MESSAGES",
            CompressionRule::CollapseFailedAttempts => "COLLAPSE_FAILED_ATTEMPTS",
        };
        write!(f, "{}", s)
    }
}

/// Messages after one rule plus whether anything matched
pub struct RuleOutcome {
    pub messages: Vec<CompressibleMessage>,
    pub matched: bool,
}

/// Per-message decision of a rule
enum Action {
    Keep,
    Replace(CompressibleMessage),

    /// Replacement whose entities enter the table only if it is used
    Summarize(CompressibleMessage, Vec<String>),
    Drop,
}

impl CompressionRule {
    pub const ALL: [CompressionRule; 5] = [
        CompressionRule::TruncateToolResults,
        CompressionRule::FoldCodeBlocks,
        CompressionRule::DropSuperseded,
        CompressionRule::SummarizeOldMessages,
        CompressionRule::CollapseFailedAttempts,
    ];

    /// 1-based priority; lower runs first
    pub fn priority(self) -> u8 {
        match self {
            CompressionRule::TruncateToolResults => 1,
            CompressionRule::FoldCodeBlocks => 2,
            CompressionRule::DropSuperseded => 3,
            CompressionRule::SummarizeOldMessages => 4,
            CompressionRule::CollapseFailedAttempts => 5,
        }
    }

    /// Apply the rule to every message not covered by `is_preserved`
    pub fn apply(
        self,
        messages: Vec<CompressibleMessage>,
        entity_table: &mut EntityTable,
        config: &CompressionConfig,
        is_preserved: &dyn Fn(&CompressibleMessage) -> bool,
    ) -> RuleOutcome {
        let mut matched = false;
        let mut out = Vec::with_capacity(messages.len());

        for message in messages {
            if is_preserved(&message) {
                out.push(message);
                continue;
            }

            let (hit, action) = match self {
                CompressionRule::TruncateToolResults => truncate_tool_result(&message, config),
                CompressionRule::FoldCodeBlocks => fold_code_blocks(&message, config),
                CompressionRule::DropSuperseded => drop_superseded(&message),
                CompressionRule::SummarizeOldMessages => summarize_old(&message, config),
                CompressionRule::CollapseFailedAttempts => collapse_failed_attempt(&message),
            };
            matched |= hit;

            match action {
                Action::Keep => out.push(message),
                Action::Drop => {}
                Action::Replace(replacement) => {
                    if replacement.token_count < message.token_count {
                        out.push(replacement);
                    } else {
                        out.push(message);
                    }
                }
                Action::Summarize(summary, entities) => {
                    if summary.token_count < message.token_count {
                        record_entities(entity_table, &entities, &message.id);
                        out.push(summary);
                    } else {
                        out.push(message);
                    }
                }
            }
        }

        RuleOutcome {
            messages: out,
            matched,
        }
    }
}

fn truncate_tool_result(message: &CompressibleMessage, config: &CompressionConfig) -> (bool, Action) {
    if message.role != MessageRole::Tool || message.token_count <= config.max_tool_result_tokens {
        return (false, Action::Keep);
    }

    let head = text::truncate_chars(&message.content, config.truncate_head_tokens * CHARS_PER_TOKEN);
    let tail = text::tail_chars(&message.content, config.truncate_tail_tokens * CHARS_PER_TOKEN);
    let kept = text::estimate_tokens(head) + text::estimate_tokens(tail);
    let omitted = message.token_count.saturating_sub(kept);

    let content = format!("{}\n\n[... {} tokens truncated ...]\n\n{}", head, omitted, tail);
    (true, Action::Replace(message.with_content(content)))
}

fn fold_code_blocks(message: &CompressibleMessage, config: &CompressionConfig) -> (bool, Action) {
    let lines: Vec<&str> = message.content.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut folded_any = false;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        out.push(line.to_string());
        i += 1;
        if !line.trim_start().starts_with("```") {
            continue;
        }

        // Opening fence: find its closing fence
        let Some(close) = (i..lines.len()).find(|&j| lines[j].trim_start().starts_with("```")) else {
            out.extend(lines[i..].iter().map(|l| l.to_string()));
            break;
        };

        let body = &lines[i..close];
        if body.len() > config.max_code_block_lines {
            folded_any = true;
            let omitted = body.len() - config.code_head_lines - config.code_tail_lines;
            out.extend(body[..config.code_head_lines].iter().map(|l| l.to_string()));
            out.push(format!("// ... {} lines folded ...", omitted));
            out.extend(body[body.len() - config.code_tail_lines..].iter().map(|l| l.to_string()));
        } else {
            out.extend(body.iter().map(|l| l.to_string()));
        }
        out.push(lines[close].to_string());
        i = close + 1;
    }

    if !folded_any {
        return (false, Action::Keep);
    }
    (true, Action::Replace(message.with_content(out.join("\n"))))
}

fn drop_superseded(message: &CompressibleMessage) -> (bool, Action) {
    if message.metadata.superseded && message.role != MessageRole::System {
        (true, Action::Drop)
    } else {
        (false, Action::Keep)
    }
}

fn summarize_old(message: &CompressibleMessage, config: &CompressionConfig) -> (bool, Action) {
    if message.role == MessageRole::System
        || message.metadata.summarized
        || message.age <= config.max_message_age
    {
        return (false, Action::Keep);
    }

    let entities = text::extract_entities(&message.content);
    let content = if entities.is_empty() {
        format!("[Earlier {} message omitted]", message.role)
    } else {
        let listed: Vec<&str> = entities
            .iter()
            .take(MAX_SUMMARY_ENTITIES)
            .map(String::as_str)
            .collect();
        format!(
            "[Earlier {} message mentioning: {}]",
            message.role,
            listed.join(", ")
        )
    };

    let mut summary = message.with_content(content);
    summary.metadata.summarized = true;
    (true, Action::Summarize(summary, entities))
}

fn record_entities(entity_table: &mut EntityTable, entities: &[String], message_id: &str) {
    for entity in entities {
        let record = entity_table.entry(entity.clone()).or_insert_with(|| EntityRecord {
            mentions: 0,
            last_message_id: message_id.to_string(),
        });
        record.mentions += 1;
        record.last_message_id = message_id.to_string();
    }
}

fn collapse_failed_attempt(message: &CompressibleMessage) -> (bool, Action) {
    if !message.metadata.failed_attempt || message.role == MessageRole::System {
        return (false, Action::Keep);
    }

    let first_line = message
        .content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let preview = text::truncate_chars(first_line, FAILED_ATTEMPT_PREVIEW_CHARS);
    let content = if preview.is_empty() {
        "[Failed attempt: empty response]".to_string()
    } else {
        format!("[Failed attempt: {}]", preview)
    };

    let mut collapsed = message.with_content(content);
    collapsed.metadata.summarized = true;
    (true, Action::Replace(collapsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none_preserved(_: &CompressibleMessage) -> bool {
        false
    }

    fn apply(rule: CompressionRule, messages: Vec<CompressibleMessage>) -> (RuleOutcome, EntityTable) {
        let mut table = EntityTable::new();
        let outcome = rule.apply(messages, &mut table, &CompressionConfig::default(), &none_preserved);
        (outcome, table)
    }

    #[test]
    fn test_priorities_ascend() {
        let priorities: Vec<u8> = CompressionRule::ALL.iter().map(|r| r.priority()).collect();
        assert_eq!(priorities, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_small_tool_result_untouched() {
        let message = CompressibleMessage::new(MessageRole::Tool, "short output");
        let (outcome, _) = apply(CompressionRule::TruncateToolResults, vec![message.clone()]);
        assert!(!outcome.matched);
        assert_eq!(outcome.messages, vec![message]);
    }

    #[test]
    fn test_truncation_keeps_head_and_tail() {
        let content = format!("HEAD{}TAIL", "m".repeat(20_000));
        let message = CompressibleMessage::new(MessageRole::Tool, content);
        let (outcome, _) = apply(CompressionRule::TruncateToolResults, vec![message]);
        let truncated = &outcome.messages[0].content;
        assert!(outcome.matched);
        assert!(truncated.starts_with("HEAD"));
        assert!(truncated.ends_with("TAIL"));
        assert!(truncated.contains("tokens truncated"));
    }

    #[test]
    fn test_fold_long_code_block() {
        let body: Vec<String> = (0..100).map(|i| format!("let x{} = {};", i, i)).collect();
        let content = format!("Here:\n```rust\n{}\n```\nDone.", body.join("\n"));
        let message = CompressibleMessage::new(MessageRole::Assistant, content);
        let (outcome, _) = apply(CompressionRule::FoldCodeBlocks, vec![message.clone()]);

        assert!(outcome.matched);
        let folded = &outcome.messages[0];
        assert!(folded.content.contains("// ... 70 lines folded ..."));
        assert!(folded.content.contains("let x0 = 0;"));
        assert!(folded.content.contains("let x99 = 99;"));
        assert!(!folded.content.contains("let x50 = 50;"));
        assert!(folded.content.ends_with("```\nDone."));
        assert!(folded.token_count < message.token_count);
    }

    #[test]
    fn test_short_code_block_untouched() {
        let message =
            CompressibleMessage::new(MessageRole::Assistant, "```rust\nfn main() {}\n```");
        let (outcome, _) = apply(CompressionRule::FoldCodeBlocks, vec![message]);
        assert!(!outcome.matched);
    }

    #[test]
    fn test_system_messages_never_dropped_or_summarized() {
        let mut system = CompressibleMessage::new(MessageRole::System, "system prompt ".repeat(50));
        system.metadata.superseded = true;
        system.age = 100;

        let (dropped, _) = apply(CompressionRule::DropSuperseded, vec![system.clone()]);
        assert_eq!(dropped.messages.len(), 1);
        let (summarized, _) = apply(CompressionRule::SummarizeOldMessages, vec![system.clone()]);
        assert_eq!(summarized.messages, vec![system]);
    }

    #[test]
    fn test_summary_updates_entity_table() {
        let mut first = CompressibleMessage::new(
            MessageRole::Assistant,
            format!("I changed src/lib.rs and RetryPolicy. {}", "filler ".repeat(40)),
        )
        .with_id("m1");
        first.age = 20;
        let mut second = CompressibleMessage::new(
            MessageRole::User,
            format!("Is RetryPolicy tested? {}", "filler ".repeat(40)),
        )
        .with_id("m2");
        second.age = 19;

        let (outcome, table) = apply(CompressionRule::SummarizeOldMessages, vec![first, second]);
        assert!(outcome.matched);
        assert_eq!(table["RetryPolicy"].mentions, 2);
        assert_eq!(table["RetryPolicy"].last_message_id, "m2");
        assert_eq!(table["src/lib.rs"].mentions, 1);
        assert!(outcome.messages[0].content.contains("src/lib.rs"));
    }

    #[test]
    fn test_unused_summary_leaves_entity_table_alone() {
        let mut tiny = CompressibleMessage::new(MessageRole::Assistant, "src/lib.rs").with_id("m1");
        tiny.age = 30;

        let mut table = EntityTable::new();
        let config = CompressionConfig::default();
        let mut messages = vec![tiny.clone()];
        for _ in 0..2 {
            let outcome = CompressionRule::SummarizeOldMessages.apply(
                messages,
                &mut table,
                &config,
                &none_preserved,
            );
            messages = outcome.messages;
        }

        assert_eq!(messages, vec![tiny]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_collapse_failed_attempt() {
        let mut failed = CompressibleMessage::new(
            MessageRole::Assistant,
            format!("I think the file is missing.\n{}", "more reasoning ".repeat(30)),
        );
        failed.metadata.failed_attempt = true;
        let (outcome, _) = apply(CompressionRule::CollapseFailedAttempts, vec![failed]);
        assert_eq!(
            outcome.messages[0].content,
            "[Failed attempt: I think the file is missing.]"
        );
    }
}
