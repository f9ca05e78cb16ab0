//! Quality Evaluator
//!
//! Scores a model response along four independent dimensions and maps the
//! weighted total to a verdict:
//!
//! - **Structural**: parses, matches the expected format, stays within the
//!   token bound, has no malformed blocks
//! - **Relevance**: token overlap with the query plus query entities mentioned
//! - **Completeness**: how many of the applicable task constraints are met
//! - **Coherence**: penalties for hallucination markers, self-contradiction,
//!   incomplete trailing statements and broken cross-references
//!
//! Deficiency tags are detected separately from the score, so a response can be
//! accepted and still carry tags.

use regex::Regex;
use sdk::ToolCall;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::config::QualityConfig;
use crate::retry::AttemptRecord;
use crate::text;

use super::{
    Deficiency, ExpectedResponseType, QualityEvalOutput, QualityMetrics, TaskConstraints, Verdict,
};

/// Code fence delimiter
const FENCE: &str = "```";

/// Ratio used to turn response characters into a token estimate
const TOKENS_PER_CHAR: f64 = 0.25;

/// Everything the evaluator looks at for one response
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub text: &'a str,
    pub tool_calls: &'a [ToolCall],
    pub expected_type: ExpectedResponseType,
    pub query_tokens: &'a [String],
    pub query_entities: &'a [String],
    pub history: &'a [AttemptRecord],
    pub constraints: &'a TaskConstraints,
}

/// A fenced code block found in a response
#[derive(Debug, Clone, PartialEq)]
struct CodeBlock {
    language: Option<String>,
    body: String,
}

/// Fence structure of a response
#[derive(Debug, Default)]
struct FenceScan {
    fence_count: usize,
    closed: Vec<CodeBlock>,
}

impl FenceScan {
    fn of(text: &str) -> Self {
        let mut scan = FenceScan::default();
        let mut open: Option<(Option<String>, Vec<&str>)> = None;

        for line in text.lines() {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix(FENCE) {
                scan.fence_count += 1;
                match open.take() {
                    Some((language, body)) => scan.closed.push(CodeBlock {
                        language,
                        body: body.join("\n"),
                    }),
                    None => {
                        let language = rest
                            .split_whitespace()
                            .next()
                            .map(|l| l.to_lowercase())
                            .filter(|l| !l.is_empty());
                        open = Some((language, Vec::new()));
                    }
                }
            } else if let Some((_, body)) = open.as_mut() {
                body.push(line);
            }
        }

        scan
    }

    fn fences_balanced(&self) -> bool {
        self.fence_count % 2 == 0
    }
}

static HALLUCINATION_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
static CONTRADICTION_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
static FORWARD_REFERENCE: OnceLock<Regex> = OnceLock::new();
static TRAILING_CONNECTIVE: OnceLock<Regex> = OnceLock::new();

fn hallucination_patterns() -> &'static Vec<Regex> {
    HALLUCINATION_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\bas an ai\b").expect("Invalid hallucination pattern"),
            Regex::new(
                r"(?i)\bi (?:don't|do not|cannot|can't) (?:have access to|access|see|view) (?:the |your )?(?:file|files|repository|codebase|code)\b",
            )
            .expect("Invalid hallucination pattern"),
            Regex::new(
                r"(?i)\bi (?:assume|imagine|would guess) (?:that )?(?:the|this|your) (?:file|function|code|module|method)\b",
            )
            .expect("Invalid hallucination pattern"),
            Regex::new(r"(?i)\b(?:presumably|hypothetically)\b")
                .expect("Invalid hallucination pattern"),
            Regex::new(r"(?i)\b(?:should|might|probably) (?:exist|be located|be defined) (?:in|at|somewhere)\b")
                .expect("Invalid hallucination pattern"),
        ]
    })
}

fn contradiction_patterns() -> &'static Vec<Regex> {
    CONTRADICTION_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\b(?:actually|wait),? (?:no\b|that'?s (?:wrong|incorrect|not right))")
                .expect("Invalid contradiction pattern"),
            Regex::new(r"(?i)\bi (?:was wrong|made a mistake)\b")
                .expect("Invalid contradiction pattern"),
            Regex::new(r"(?i)\bon second thought\b").expect("Invalid contradiction pattern"),
            Regex::new(r"(?i)\bcorrection:").expect("Invalid contradiction pattern"),
            Regex::new(r"(?i)\bignore (?:what i said|my previous)\b")
                .expect("Invalid contradiction pattern"),
        ]
    })
}

fn forward_reference() -> &'static Regex {
    FORWARD_REFERENCE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:see below|shown below|as follows|the following (?:code|snippet|changes|diff|steps|output))\b",
        )
        .expect("Invalid reference pattern")
    })
}

fn trailing_connective() -> &'static Regex {
    TRAILING_CONNECTIVE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:and|or|the|to|with|of|a|an|then|because)$")
            .expect("Invalid trailing pattern")
    })
}

/// Evaluates model responses against the task context
#[derive(Debug, Clone)]
pub struct QualityEvaluator {
    config: QualityConfig,
}

impl QualityEvaluator {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Evaluate one response
    pub fn evaluate(&self, input: &EvaluationInput<'_>) -> QualityEvalOutput {
        let text = input.text;
        let blank = text.trim().is_empty();
        let scan = FenceScan::of(text);
        let any_well_formed = input.tool_calls.iter().any(ToolCall::is_well_formed);
        let any_malformed = input.tool_calls.iter().any(|c| !c.is_well_formed());
        let incomplete_trailing = has_incomplete_trailing_statement(text);

        let structural = self.structural(input, blank, any_well_formed, &scan);
        let relevance = relevance(input);
        let (completeness, missing_tool, missing_output) = self.completeness(input, &scan);
        let coherence = self.coherence(text, incomplete_trailing, &scan);

        let w = &self.config.weights;
        let score = (w.structural * structural
            + w.relevance * relevance
            + w.completeness * completeness
            + w.coherence * coherence)
            .clamp(0.0, 1.0);
        let verdict = Verdict::from_score(score, &self.config);

        let mut deficiencies = BTreeSet::new();
        if blank && input.tool_calls.is_empty() {
            deficiencies.insert(Deficiency::EmptyResponse);
        }
        if blank && !input.tool_calls.is_empty() && !any_well_formed {
            deficiencies.insert(Deficiency::ParseFailure);
        }
        if any_malformed {
            deficiencies.insert(Deficiency::MalformedToolCall);
        }
        if missing_tool {
            deficiencies.insert(Deficiency::MissingToolCall);
        }
        if relevance < self.config.query_mismatch_threshold {
            deficiencies.insert(Deficiency::QueryMismatch);
        }
        if !scan.fences_balanced() || incomplete_trailing {
            deficiencies.insert(Deficiency::Truncated);
        }
        if hallucination_patterns().iter().any(|p| p.is_match(text)) {
            deficiencies.insert(Deficiency::HallucinationMarker);
        }
        if contradiction_patterns().iter().any(|p| p.is_match(text)) {
            deficiencies.insert(Deficiency::SelfContradiction);
        }
        let code_required =
            input.constraints.requires_code || input.expected_type == ExpectedResponseType::Code;
        if (code_required && scan.closed.is_empty())
            || scan.closed.iter().any(|b| !braces_balanced(&b.body))
        {
            deficiencies.insert(Deficiency::IncompleteCode);
        }
        if let Some(language) = &input.constraints.code_language {
            if !scan.closed.is_empty() && !scan.closed.iter().any(|b| language_matches(b, language))
            {
                deficiencies.insert(Deficiency::WrongLanguage);
            }
        }
        if missing_output {
            deficiencies.insert(Deficiency::MissingRequiredOutput);
        }

        let response_hash = response_fingerprint(text, input.tool_calls);
        let repeated_response = input
            .history
            .iter()
            .any(|record| record.response_hash == response_hash);
        if repeated_response {
            warn!(
                "Attempt {} repeated an earlier response verbatim",
                input.history.len() + 1
            );
        }

        debug!(
            "Quality score {:.3} ({}) structural={:.2} relevance={:.2} completeness={:.2} coherence={:.2} deficiencies={:?}",
            score, verdict, structural, relevance, completeness, coherence, deficiencies
        );

        QualityEvalOutput {
            score,
            verdict,
            deficiencies,
            metrics: QualityMetrics {
                structural,
                relevance,
                completeness,
                coherence,
                attempt_number: input.history.len() + 1,
                repeated_response,
            },
            response_hash,
        }
    }

    fn structural(
        &self,
        input: &EvaluationInput<'_>,
        blank: bool,
        any_well_formed: bool,
        scan: &FenceScan,
    ) -> f64 {
        let parse_ok = !blank || any_well_formed;

        let has_calls = !input.tool_calls.is_empty();
        let has_code = !scan.closed.is_empty();
        let format_ok = match input.expected_type {
            ExpectedResponseType::ToolCall => has_calls,
            ExpectedResponseType::Text => !blank,
            ExpectedResponseType::Code => has_code,
            ExpectedResponseType::Mixed => !blank && (has_calls || has_code),
        };

        let within_bound = match input.constraints.max_tokens {
            Some(max) => input.text.chars().count() as f64 * TOKENS_PER_CHAR <= max as f64,
            None => true,
        };

        let well_formed_blocks = braces_balanced(input.text) && scan.fences_balanced();

        let w = &self.config.structural_weights;
        [
            (parse_ok, w.parse),
            (format_ok, w.format),
            (within_bound, w.token_bound),
            (well_formed_blocks, w.well_formed),
        ]
        .iter()
        .filter(|(ok, _)| *ok)
        .map(|(_, weight)| weight)
        .sum()
    }

    /// Completeness score plus whether a tool call or a required output is missing
    fn completeness(&self, input: &EvaluationInput<'_>, scan: &FenceScan) -> (f64, bool, bool) {
        let constraints = input.constraints;
        let mut parts: Vec<f64> = Vec::new();

        let lower = input.text.to_lowercase();
        let mut missing_output = false;
        if !constraints.required_outputs.is_empty() {
            let present = constraints
                .required_outputs
                .iter()
                .filter(|r| lower.contains(&r.to_lowercase()))
                .count();
            missing_output = present < constraints.required_outputs.len();
            parts.push(present as f64 / constraints.required_outputs.len() as f64);
        }

        let mut missing_tool =
            input.expected_type == ExpectedResponseType::ToolCall && input.tool_calls.is_empty();
        if !constraints.expected_tools.is_empty() {
            let called = constraints
                .expected_tools
                .iter()
                .filter(|name| input.tool_calls.iter().any(|c| &c.name == *name))
                .count();
            if called < constraints.expected_tools.len() {
                missing_tool = true;
            }
            parts.push(called as f64 / constraints.expected_tools.len() as f64);
        }

        if constraints.requires_code || constraints.code_language.is_some() {
            let satisfied = match &constraints.code_language {
                Some(language) => scan.closed.iter().any(|b| language_matches(b, language)),
                None => !scan.closed.is_empty(),
            };
            parts.push(if satisfied { 1.0 } else { 0.0 });
        }

        let score = if parts.is_empty() {
            if input.text.chars().count() > self.config.substantive_response_chars {
                1.0
            } else {
                0.5
            }
        } else {
            parts.iter().sum::<f64>() / parts.len() as f64
        };

        (score, missing_tool, missing_output)
    }

    fn coherence(&self, text: &str, incomplete_trailing: bool, scan: &FenceScan) -> f64 {
        let p = &self.config.penalties;
        let mut penalty = 0.0;

        if hallucination_patterns().iter().any(|r| r.is_match(text)) {
            penalty += p.hallucination;
        }
        if contradiction_patterns().iter().any(|r| r.is_match(text)) {
            penalty += p.contradiction;
        }
        if incomplete_trailing {
            penalty += p.incomplete;
        }
        if has_broken_reference(text, scan) {
            penalty += p.broken_reference;
        }

        (1.0 - penalty).max(0.0)
    }
}

/// Stable hash over the text and the tool calls of a response
pub fn response_fingerprint(text: &str, tool_calls: &[ToolCall]) -> String {
    let mut content = text.to_string();
    for call in tool_calls {
        content.push('\n');
        content.push_str(&call.name);
        content.push(' ');
        content.push_str(&call.arguments);
    }
    text::content_hash(&content)
}

fn relevance(input: &EvaluationInput<'_>) -> f64 {
    let mut combined = input.text.to_string();
    for call in input.tool_calls {
        combined.push(' ');
        combined.push_str(&call.name);
        combined.push(' ');
        combined.push_str(&call.arguments);
    }

    let response_tokens = text::tokenize(&combined);
    let keyword = text::jaccard_similarity(&response_tokens, input.query_tokens);

    let entity = if input.query_entities.is_empty() {
        1.0
    } else {
        let lower = combined.to_lowercase();
        let present = input
            .query_entities
            .iter()
            .filter(|e| lower.contains(&e.to_lowercase()))
            .count();
        present as f64 / input.query_entities.len() as f64
    };

    0.5 * keyword + 0.5 * entity
}

/// Curly braces never close before they open and end balanced
fn braces_balanced(text: &str) -> bool {
    let mut depth: i64 = 0;
    for c in text.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn has_incomplete_trailing_statement(text: &str) -> bool {
    let Some(last) = text.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return false;
    };
    if last.starts_with(FENCE) {
        return false;
    }
    let dangling_punctuation = [',', ':', '(', '[', '{', '=', '+', '&', '|', '\\'];
    last.ends_with(|c: char| dangling_punctuation.contains(&c))
        || trailing_connective().is_match(last)
}

/// A forward reference ("see below") with nothing after it to point at
fn has_broken_reference(text: &str, scan: &FenceScan) -> bool {
    let Some(m) = forward_reference().find(text) else {
        return false;
    };
    if !scan.closed.is_empty() {
        return false;
    }
    let rest = &text[m.end()..];
    !rest.lines().skip(1).any(|line| {
        let l = line.trim_start();
        l.starts_with("- ")
            || l.starts_with("* ")
            || l.chars().next().is_some_and(|c| c.is_ascii_digit())
            || line.starts_with("    ")
    })
}

fn normalize_language(language: &str) -> String {
    match language.to_lowercase().as_str() {
        "rs" => "rust".to_string(),
        "py" => "python".to_string(),
        "js" => "javascript".to_string(),
        "ts" => "typescript".to_string(),
        "sh" | "shell" | "zsh" => "bash".to_string(),
        "yml" => "yaml".to_string(),
        other => other.to_string(),
    }
}

fn language_matches(block: &CodeBlock, language: &str) -> bool {
    block
        .language
        .as_deref()
        .is_some_and(|l| normalize_language(l) == normalize_language(language))
}
