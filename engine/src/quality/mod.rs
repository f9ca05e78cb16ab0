//! Response Quality
//!
//! Types shared by the quality evaluator and the retry policy: verdicts,
//! deficiency tags, expected response types and task constraints.

pub mod evaluator;

pub use evaluator::{EvaluationInput, QualityEvaluator};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::config::QualityConfig;

/// Categorical judgment of a response.
///
/// Ordered from worst to best: `Abort < Escalate < Retry < Accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Abort,
    Escalate,
    Retry,
    Accept,
}

impl Verdict {
    /// Map a score to its band. Lower bounds are inclusive.
    pub fn from_score(score: f64, config: &QualityConfig) -> Self {
        if score >= config.accept_threshold {
            Verdict::Accept
        } else if score >= config.retry_threshold {
            Verdict::Retry
        } else if score >= config.escalate_threshold {
            Verdict::Escalate
        } else {
            Verdict::Abort
        }
    }

    pub fn is_accept(self) -> bool {
        self == Verdict::Accept
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Abort => "ABORT",
            Verdict::Escalate => "ESCALATE",
            Verdict::Retry => "RETRY",
            Verdict::Accept => "ACCEPT",
        };
        write!(f, "{}", s)
    }
}

/// Independently detected defect in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Deficiency {
    ParseFailure,
    EmptyResponse,
    MissingToolCall,
    QueryMismatch,
    Truncated,
    HallucinationMarker,
    SelfContradiction,
    IncompleteCode,
    WrongLanguage,
    MissingRequiredOutput,
    MalformedToolCall,
}

impl fmt::Display for Deficiency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Deficiency::ParseFailure => "PARSE_FAILURE",
            Deficiency::EmptyResponse => "EMPTY_RESPONSE",
            Deficiency::MissingToolCall => "MISSING_TOOL_CALL",
            Deficiency::QueryMismatch => "QUERY_MISMATCH",
            Deficiency::Truncated => "TRUNCATED",
            Deficiency::HallucinationMarker => "HALLUCINATION_MARKER",
            Deficiency::SelfContradiction => "SELF_CONTRADICTION",
            Deficiency::IncompleteCode => "INCOMPLETE_CODE",
            Deficiency::WrongLanguage => "WRONG_LANGUAGE",
            Deficiency::MissingRequiredOutput => "MISSING_REQUIRED_OUTPUT",
            Deficiency::MalformedToolCall => "MALFORMED_TOOL_CALL",
        };
        write!(f, "{}", s)
    }
}

/// What kind of response the task step expects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedResponseType {
    ToolCall,
    #[default]
    Text,
    Code,
    Mixed,
}

impl FromStr for ExpectedResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tool_call" | "tool" => Ok(ExpectedResponseType::ToolCall),
            "text" => Ok(ExpectedResponseType::Text),
            "code" => Ok(ExpectedResponseType::Code),
            "mixed" => Ok(ExpectedResponseType::Mixed),
            other => Err(format!(
                "Unknown response type '{}'. Must be one of: tool_call, text, code, mixed",
                other
            )),
        }
    }
}

impl fmt::Display for ExpectedResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExpectedResponseType::ToolCall => "tool_call",
            ExpectedResponseType::Text => "text",
            ExpectedResponseType::Code => "code",
            ExpectedResponseType::Mixed => "mixed",
        };
        write!(f, "{}", s)
    }
}

/// Caller-supplied constraints on a task's responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConstraints {
    /// Substrings that must appear in the response (case-insensitive)
    pub required_outputs: Vec<String>,

    /// Tool names the response must call
    pub expected_tools: Vec<String>,

    /// Upper bound on response tokens
    pub max_tokens: Option<usize>,

    /// Whether the response must contain a code block
    pub requires_code: bool,

    /// Language tag the code block must carry
    pub code_language: Option<String>,
}

/// Per-dimension scores plus attempt bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub structural: f64,
    pub relevance: f64,
    pub completeness: f64,
    pub coherence: f64,

    /// 1-based number of the attempt being evaluated
    pub attempt_number: usize,

    /// Whether an earlier attempt produced the same content
    pub repeated_response: bool,
}

/// Result of evaluating one response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEvalOutput {
    pub score: f64,
    pub verdict: Verdict,
    pub deficiencies: BTreeSet<Deficiency>,
    pub metrics: QualityMetrics,

    /// Normalized content hash of the evaluated response
    pub response_hash: String,
}

impl QualityEvalOutput {
    pub fn has(&self, deficiency: Deficiency) -> bool {
        self.deficiencies.contains(&deficiency)
    }
}
