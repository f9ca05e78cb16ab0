use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::HashSet;

use keel_engine::compression::{
    total_tokens, CompressibleMessage, CompressionInput, CompressionLevel, ContextCompressor,
};
use keel_engine::config::{CompressionConfig, Config, MemoryConfig, QualityConfig, TerminationConfig};
use keel_engine::memory::{MemoryItem, MemoryType, QueryContext, RelevanceSelector};
use keel_engine::quality::Verdict;
use keel_engine::termination::{TerminationDetector, TerminationState, TerminationTrigger};
use keel_engine::text;
use sdk::MessageRole;

fn memory_type() -> impl Strategy<Value = MemoryType> {
    prop_oneof![
        Just(MemoryType::Conversation),
        Just(MemoryType::Error),
        Just(MemoryType::Decision),
        Just(MemoryType::ToolResult),
        Just(MemoryType::FileContent),
    ]
}

fn role() -> impl Strategy<Value = MessageRole> {
    prop_oneof![
        Just(MessageRole::User),
        Just(MessageRole::Assistant),
        Just(MessageRole::Tool),
    ]
}

/// Memories with distinct ids, aged up to two hours
fn memories() -> impl Strategy<Value = Vec<MemoryItem>> {
    prop::collection::vec(
        (memory_type(), "[a-z ]{1,200}", 0i64..120),
        0..25,
    )
    .prop_map(|specs| {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (kind, content, age))| {
                MemoryItem::new(kind, content, now - Duration::minutes(age)).with_id(format!("m{}", i))
            })
            .collect()
    })
}

fn conversation() -> impl Strategy<Value = Vec<CompressibleMessage>> {
    prop::collection::vec((role(), "[a-z\n ]{0,3000}", 0u32..20, any::<bool>()), 0..15).prop_map(
        |specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (role, content, age, preserved))| {
                    let mut message = CompressibleMessage::new(role, content).with_id(format!("c{}", i));
                    message.age = age;
                    message.preserved = preserved;
                    message
                })
                .collect()
        },
    )
}

fn trigger() -> impl Strategy<Value = TerminationTrigger> {
    prop_oneof![
        ("[a-z ]{0,40}", any::<bool>()).prop_map(|(text, has_tool_calls)| {
            TerminationTrigger::ModelOutput {
                text,
                has_tool_calls,
            }
        }),
        Just(TerminationTrigger::ModelOutput {
            text: "The task is complete.".to_string(),
            has_tool_calls: false,
        }),
        ("[a-z_]{1,10}", any::<bool>())
            .prop_map(|(name, success)| TerminationTrigger::ToolCompleted { name, success }),
        "[a-z ]{0,20}".prop_map(|text| TerminationTrigger::UserInput {
            text,
            accepted: false,
        }),
    ]
}

proptest! {
    #[test]
    fn test_verdict_is_monotonic_in_score(a in 0.0..=1.0f64, b in 0.0..=1.0f64) {
        let config = QualityConfig::default();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(Verdict::from_score(low, &config) <= Verdict::from_score(high, &config));
    }

    #[test]
    fn test_verdict_bands(score in 0.0..=1.0f64) {
        let config = QualityConfig::default();
        let verdict = Verdict::from_score(score, &config);
        let expected = if score >= config.accept_threshold {
            Verdict::Accept
        } else if score >= config.retry_threshold {
            Verdict::Retry
        } else if score >= config.escalate_threshold {
            Verdict::Escalate
        } else {
            Verdict::Abort
        };
        prop_assert_eq!(verdict, expected);
    }

    #[test]
    fn test_estimate_tokens_is_ceiling_of_quarter(s in ".{0,400}") {
        let chars = s.chars().count();
        prop_assert_eq!(text::estimate_tokens(&s), chars.div_ceil(4));
    }

    #[test]
    fn test_selection_respects_budget(items in memories(), budget in 0usize..400) {
        let selector = RelevanceSelector::new(MemoryConfig::default());
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let query = QueryContext::from_text("parser error in src lib", now);

        let result = selector.select_with_policy(&items, &query, budget);

        let mandatory: HashSet<&String> = result.mandatory.iter().collect();
        let optional_tokens: usize = result
            .selected
            .iter()
            .filter(|i| !mandatory.contains(&i.id))
            .map(|i| i.token_count)
            .sum();
        let mandatory_tokens: usize = result
            .selected
            .iter()
            .filter(|i| mandatory.contains(&i.id))
            .map(|i| i.token_count)
            .sum();

        prop_assert!(optional_tokens <= budget.saturating_sub(mandatory_tokens));
        prop_assert_eq!(result.total_tokens, optional_tokens + mandatory_tokens);
    }

    #[test]
    fn test_mandatory_memories_always_selected(items in memories(), budget in 0usize..50) {
        let selector = RelevanceSelector::new(MemoryConfig::default());
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let query = QueryContext::from_text("anything", now);

        let mandatory = selector.mandatory_ids(&items, now);
        let result = selector.select(&items, &query, budget, &mandatory);

        let selected: HashSet<&str> = result.selected_ids().into_iter().collect();
        for id in &mandatory {
            prop_assert!(selected.contains(id.as_str()));
        }
    }

    #[test]
    fn test_selected_memories_are_unique(items in memories()) {
        let selector = RelevanceSelector::new(MemoryConfig::default());
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let query = QueryContext::from_text("parser", now);

        // Every item twice under a new id
        let mut doubled = items.clone();
        doubled.extend(
            items
                .iter()
                .map(|i| i.clone().with_id(format!("{}-copy", i.id))),
        );
        let result = selector.select(&doubled, &query, 100_000, &[]);

        let hashes: Vec<String> = result
            .selected
            .iter()
            .map(|i| text::content_hash(&i.content))
            .collect();
        let unique: HashSet<&String> = hashes.iter().collect();
        prop_assert_eq!(unique.len(), hashes.len());
    }

    #[test]
    fn test_compression_below_threshold_is_noop(messages in conversation(), limit in 1usize..100_000) {
        let config = CompressionConfig::default();
        let current = ((limit as f64) * config.compress_threshold).floor() as usize;
        let current = current.saturating_sub(1);
        let compressor = ContextCompressor::new(config);

        let result = compressor.compress(CompressionInput {
            messages: messages.clone(),
            current_tokens: current,
            token_limit: limit,
            ..Default::default()
        });

        prop_assert_eq!(result.level, CompressionLevel::Full);
        prop_assert_eq!(result.messages, messages);
        prop_assert_eq!(result.tokens_saved, 0);
    }

    #[test]
    fn test_compression_never_grows(messages in conversation(), pending in conversation(), usage in 0.0..1.5f64) {
        let limit = 10_000usize;
        let compressor = ContextCompressor::new(CompressionConfig::default());
        let before = total_tokens(&messages) + total_tokens(&pending);

        let result = compressor.compress(CompressionInput {
            messages: messages.clone(),
            pending_tool_results: pending,
            current_tokens: (limit as f64 * usage) as usize,
            token_limit: limit,
            ..Default::default()
        });

        let after = total_tokens(&result.messages) + total_tokens(&result.pending_tool_results);
        prop_assert!(after <= before);
        prop_assert_eq!(result.tokens_saved, before - after);
        prop_assert!(result.compression_ratio <= 1.0);

        // Preserved messages survive untouched
        for original in messages.iter().filter(|m| m.preserved) {
            prop_assert!(result.messages.contains(original));
        }
    }

    #[test]
    fn test_terminal_states_are_stable(triggers in prop::collection::vec(trigger(), 1..30)) {
        let detector = TerminationDetector::new(TerminationConfig::default());
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let mut state = TerminationState::new(vec![]);
        let mut terminal: Option<TerminationState> = None;
        for trigger in &triggers {
            state = detector.apply(&state, trigger, now);
            if state.status.is_terminal() {
                match &terminal {
                    Some(first) => prop_assert_eq!(first.status, state.status),
                    None => terminal = Some(state.clone()),
                }
            }
            let (next, _) = detector.request_validation(&state);
            state = next;
            prop_assert!((0.0..=1.0).contains(&state.confidence));
        }
    }

    #[test]
    fn test_default_config_round_trips(level in "error|warn|info|debug|trace", budget in 1000usize..200_000) {
        let mut config = Config::default();
        config.core.log_level = level;
        config.orchestrator.token_budget = budget;

        let toml_string = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml_str(&toml_string).unwrap();
        prop_assert_eq!(parsed, config);
    }
}
