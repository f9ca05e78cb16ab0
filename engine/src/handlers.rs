//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - evaluate: Score a response with the quality evaluator
//! - compress: Run the context compressor over a conversation file
//! - select: Run the memory relevance selector over a memory file
//! - config show/validate/path: Inspect the configuration

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sdk::{MessageRole, ModelResponse};

use crate::compression::{
    CompressibleMessage, CompressionInput, CompressionResult, ContextCompressor, MessageMetadata,
};
use crate::config::Config;
use crate::memory::{MemoryItem, MemoryType, QueryContext, RelevanceSelector, SelectionResult};
use crate::quality::{
    EvaluationInput, ExpectedResponseType, QualityEvalOutput, QualityEvaluator, TaskConstraints,
};
use crate::text;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Arguments of the evaluate command
#[derive(Debug, Clone, Default)]
pub struct EvaluateArgs {
    pub response: PathBuf,
    pub expected_type: String,
    pub query: String,
    pub constraints: TaskConstraints,
}

/// A memory as written in an input file; derived fields are computed on load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    pub memory_type: MemoryType,

    /// Defaults to now
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub causal_links: Vec<String>,

    #[serde(default)]
    pub file_paths: Vec<String>,
}

impl MemoryRecord {
    fn into_item(self, now: DateTime<Utc>) -> MemoryItem {
        let mut item = MemoryItem::new(self.memory_type, self.content, self.created_at.unwrap_or(now))
            .with_causal_links(self.causal_links)
            .with_file_paths(self.file_paths);
        if let Some(id) = self.id {
            item = item.with_id(id);
        }
        item
    }
}

/// A conversation message as written in an input file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub role: MessageRole,
    pub content: String,

    #[serde(default)]
    pub age: u32,

    #[serde(default)]
    pub preserved: bool,

    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl MessageRecord {
    fn into_message(self) -> CompressibleMessage {
        let mut message = CompressibleMessage::new(self.role, self.content);
        if let Some(id) = self.id {
            message = message.with_id(id);
        }
        message.age = self.age;
        message.preserved = self.preserved;
        message.metadata = self.metadata;
        message
    }
}

/// Read a JSON file into `T`
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Response text and tool calls from a file.
///
/// A file holding a JSON object with `text`/`tool_calls` is read as a full
/// model response; anything else is taken as plain response text.
fn read_response(path: &Path) -> Result<ModelResponse> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if contents.trim_start().starts_with('{') {
        if let Ok(response) = serde_json::from_str::<ModelResponse>(&contents) {
            return Ok(response);
        }
    }
    Ok(ModelResponse::text(contents))
}

/// Evaluate one response file
pub fn evaluate_response(args: &EvaluateArgs, config: &Config) -> Result<QualityEvalOutput> {
    let expected_type: ExpectedResponseType = args
        .expected_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let response = read_response(&args.response)?;
    let query = QueryContext::from_text(&args.query, text::now());

    let evaluator = QualityEvaluator::new(config.quality.clone());
    Ok(evaluator.evaluate(&EvaluationInput {
        text: &response.text,
        tool_calls: &response.tool_calls,
        expected_type,
        query_tokens: &query.tokens,
        query_entities: &query.entities,
        history: &[],
        constraints: &args.constraints,
    }))
}

/// Compress a conversation file
pub fn compress_conversation(
    messages: &Path,
    current_tokens: usize,
    token_limit: usize,
    preserve: &[String],
    config: &Config,
) -> Result<CompressionResult> {
    let records: Vec<MessageRecord> = read_json(messages)?;
    let compressor = ContextCompressor::new(config.compression.clone());

    Ok(compressor.compress(CompressionInput {
        messages: records.into_iter().map(MessageRecord::into_message).collect(),
        current_tokens,
        token_limit,
        preserve_ids: preserve.iter().cloned().collect::<HashSet<_>>(),
        ..Default::default()
    }))
}

/// Select memories from a memory file
pub fn select_memories(
    memories: &Path,
    query: &str,
    budget: Option<usize>,
    config: &Config,
) -> Result<SelectionResult> {
    let now = text::now();
    let records: Vec<MemoryRecord> = read_json(memories)?;
    let items: Vec<MemoryItem> = records.into_iter().map(|r| r.into_item(now)).collect();

    let budget = budget.unwrap_or_else(|| {
        (config.orchestrator.token_budget as f64 * config.orchestrator.memory_budget_share).floor()
            as usize
    });
    let selector = RelevanceSelector::new(config.memory.clone());
    Ok(selector.select_with_policy(&items, &QueryContext::from_text(query, now), budget))
}

pub fn handle_evaluate(args: EvaluateArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let output = evaluate_response(&args, config)?;

    match format {
        OutputFormat::Text => {
            println!("Verdict: {}", output.verdict);
            println!("Score:   {:.3}", output.score);
            println!();
            println!("  Structural:   {:.2}", output.metrics.structural);
            println!("  Relevance:    {:.2}", output.metrics.relevance);
            println!("  Completeness: {:.2}", output.metrics.completeness);
            println!("  Coherence:    {:.2}", output.metrics.coherence);

            if output.deficiencies.is_empty() {
                println!("\nNo deficiencies detected.");
            } else {
                println!("\nDeficiencies:");
                for deficiency in &output.deficiencies {
                    println!("  - {}", deficiency);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

pub fn handle_compress(
    messages: PathBuf,
    current_tokens: usize,
    token_limit: usize,
    preserve: Vec<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let result = compress_conversation(&messages, current_tokens, token_limit, &preserve, config)?;

    match format {
        OutputFormat::Text => {
            println!("Level: {}", result.level);
            println!(
                "Messages: {} ({} tokens saved, ratio {:.2})",
                result.messages.len(),
                result.tokens_saved,
                result.compression_ratio
            );
            if !result.rules_applied.is_empty() {
                let rules: Vec<String> = result.rules_applied.iter().map(ToString::to_string).collect();
                println!("Rules: {}", rules.join(", "));
            }
            println!();
            for message in &result.messages {
                println!(
                    "[{}] {} ({} tokens)",
                    message.role,
                    message.id,
                    message.token_count
                );
                println!("  {}", text::truncate_chars(message.content.trim(), 160));
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

pub fn handle_select(
    memories: PathBuf,
    query: String,
    budget: Option<usize>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let result = select_memories(&memories, &query, budget, config)?;

    match format {
        OutputFormat::Text => {
            if result.selected.is_empty() {
                println!("No memories selected");
            } else {
                println!(
                    "Selected {} memories ({} tokens):",
                    result.selected.len(),
                    result.total_tokens
                );
                println!();
                for item in &result.selected {
                    let score = result.scores.get(&item.id).map(|s| s.total).unwrap_or(0.0);
                    let mandatory = if result.mandatory.contains(&item.id) {
                        " [mandatory]"
                    } else {
                        ""
                    };
                    println!("{} {} score {:.3}{}", item.memory_type, item.id, score, mandatory);
                    println!("  {}", text::truncate_chars(item.content.trim(), 160));
                }
            }

            if !result.excluded.is_empty() {
                println!("\nExcluded:");
                for exclusion in &result.excluded {
                    println!(
                        "  {} ({:?}, score {:.3})",
                        exclusion.id, exclusion.reason, exclusion.score
                    );
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

/// Print the effective configuration
pub fn handle_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let toml_string =
                toml::to_string_pretty(config).context("Failed to serialize configuration")?;
            print!("{}", toml_string);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
    }
    Ok(())
}

/// Validate the configuration at `path` (or the default location)
pub fn handle_config_validate(path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let path = resolve_config_path(path)?;
    let outcome = Config::load_from_path(&path);

    match format {
        OutputFormat::Text => match &outcome {
            Ok(_) => println!("Configuration at {} is valid", path.display()),
            Err(e) => println!("Configuration at {} is invalid: {}", path.display(), e),
        },
        OutputFormat::Json => {
            let output = json!({
                "path": path,
                "valid": outcome.is_ok(),
                "error": outcome.as_ref().err().map(ToString::to_string),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    outcome
        .map(|_| ())
        .with_context(|| format!("Invalid configuration at {}", path.display()))
}

pub fn handle_config_path(path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let path = resolve_config_path(path)?;
    match format {
        OutputFormat::Text => println!("{}", path.display()),
        OutputFormat::Json => {
            let output = json!({ "path": path, "exists": path.exists() });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn resolve_config_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => Config::default_config_path().context("Failed to locate configuration file"),
    }
}
