//! Configuration management
//!
//! This module handles loading, validation, and management of the Keel
//! configuration. Configuration is stored in TOML format at ~/.keel/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: log level
//! - **memory**: relevance weights, threshold, recency half-life, mandatory-age thresholds
//! - **quality**: dimension weights, verdict bands, coherence penalties
//! - **retry**: retry limits and escalation bias
//! - **compression**: level thresholds and truncation limits
//! - **termination**: confidence thresholds and per-check timeouts
//! - **orchestrator**: token budget and iteration limit
//!
//! Every field has a default, so an empty file is a valid configuration. The
//! loaded configuration is immutable; components receive the section they need
//! by value.
//!
//! # Examples
//!
//! ```no_run
//! use keel_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Token budget: {}", config.orchestrator.token_budget);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::termination::validation::CheckType;

/// Tolerance used when checking that a weight vector sums to 1
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Memory relevance selection
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Response quality evaluation
    #[serde(default)]
    pub quality: QualityConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Context compression
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Termination detection
    #[serde(default)]
    pub termination: TerminationConfig,

    /// Task cycle orchestration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Weights of the relevance score components
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryWeights {
    pub keyword: f64,
    pub entity: f64,
    pub recency: f64,
    pub causal: f64,
    pub path: f64,
    pub type_bonus: f64,
}

impl Default for MemoryWeights {
    fn default() -> Self {
        Self {
            keyword: 0.25,
            entity: 0.20,
            recency: 0.15,
            causal: 0.15,
            path: 0.15,
            type_bonus: 0.10,
        }
    }
}

impl MemoryWeights {
    fn as_vec(&self) -> Vec<f64> {
        vec![
            self.keyword,
            self.entity,
            self.recency,
            self.causal,
            self.path,
            self.type_bonus,
        ]
    }
}

/// Memory relevance selection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Items scoring below this are excluded as low relevance
    pub relevance_threshold: f64,

    /// Score component weights
    pub weights: MemoryWeights,

    /// Recency half-life in minutes
    pub recency_half_life_minutes: f64,

    /// Items at most this old are always included
    pub mandatory_recent_minutes: f64,

    /// ERROR items at most this old are always included
    pub mandatory_error_minutes: f64,

    /// Number of most recent DECISION items always included
    pub mandatory_decision_count: usize,

    /// Maximum number of items kept by the memory store
    pub store_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.20,
            weights: MemoryWeights::default(),
            recency_half_life_minutes: 30.0,
            mandatory_recent_minutes: 5.0,
            mandatory_error_minutes: 30.0,
            mandatory_decision_count: 3,
            store_capacity: 500,
        }
    }
}

/// Weights of the four quality dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityWeights {
    pub structural: f64,
    pub relevance: f64,
    pub completeness: f64,
    pub coherence: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            structural: 0.30,
            relevance: 0.20,
            completeness: 0.30,
            coherence: 0.20,
        }
    }
}

/// Weights of the four structural checks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StructuralWeights {
    pub parse: f64,
    pub format: f64,
    pub token_bound: f64,
    pub well_formed: f64,
}

impl Default for StructuralWeights {
    fn default() -> Self {
        Self {
            parse: 0.30,
            format: 0.30,
            token_bound: 0.20,
            well_formed: 0.20,
        }
    }
}

/// Coherence penalties per detected defect
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoherencePenalties {
    pub hallucination: f64,
    pub contradiction: f64,
    pub incomplete: f64,
    pub broken_reference: f64,
}

impl Default for CoherencePenalties {
    fn default() -> Self {
        Self {
            hallucination: 0.4,
            contradiction: 0.3,
            incomplete: 0.2,
            broken_reference: 0.1,
        }
    }
}

/// Quality evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    pub weights: QualityWeights,
    pub structural_weights: StructuralWeights,
    pub penalties: CoherencePenalties,

    /// Inclusive lower bound of the ACCEPT band
    pub accept_threshold: f64,

    /// Inclusive lower bound of the RETRY band
    pub retry_threshold: f64,

    /// Inclusive lower bound of the ESCALATE band
    pub escalate_threshold: f64,

    /// Relevance below this raises QUERY_MISMATCH
    pub query_mismatch_threshold: f64,

    /// Unconstrained responses longer than this count as complete
    pub substantive_response_chars: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            structural_weights: StructuralWeights::default(),
            penalties: CoherencePenalties::default(),
            accept_threshold: 0.70,
            retry_threshold: 0.40,
            escalate_threshold: 0.20,
            query_mismatch_threshold: 0.30,
            substantive_response_chars: 50,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Non-accept verdicts beyond this count force an abort
    pub max_retries: u32,

    /// Identical deficiency sets in this many consecutive attempts escalate
    pub repeat_escalation: usize,

    /// Context budgets below this bias retries toward narrowing scope
    pub tight_budget_tokens: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            repeat_escalation: 2,
            tight_budget_tokens: 2000,
        }
    }
}

/// Context compression configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressionConfig {
    /// Usage ratio at which the first three rules apply
    pub compress_threshold: f64,

    /// Usage ratio at which every rule applies
    pub minimal_threshold: f64,

    pub max_tool_result_tokens: usize,
    pub truncate_head_tokens: usize,
    pub truncate_tail_tokens: usize,
    pub max_code_block_lines: usize,
    pub code_head_lines: usize,
    pub code_tail_lines: usize,

    /// Messages older than this many turns may be summarized
    pub max_message_age: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            compress_threshold: 0.70,
            minimal_threshold: 0.90,
            max_tool_result_tokens: 2000,
            truncate_head_tokens: 500,
            truncate_tail_tokens: 300,
            max_code_block_lines: 60,
            code_head_lines: 20,
            code_tail_lines: 10,
            max_message_age: 10,
        }
    }
}

/// Timeout and required flag of one validation check type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CheckPolicy {
    pub timeout_secs: u64,
    pub required: bool,
}

impl CheckPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-type validation check policies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckPolicies {
    pub file_exists: CheckPolicy,
    pub syntax_valid: CheckPolicy,
    pub diff_nonempty: CheckPolicy,
    pub tests_pass: CheckPolicy,
    pub schema_valid: CheckPolicy,
    pub no_regressions: CheckPolicy,
}

impl Default for CheckPolicies {
    fn default() -> Self {
        Self {
            file_exists: CheckPolicy {
                timeout_secs: 5,
                required: true,
            },
            syntax_valid: CheckPolicy {
                timeout_secs: 10,
                required: true,
            },
            diff_nonempty: CheckPolicy {
                timeout_secs: 10,
                required: false,
            },
            tests_pass: CheckPolicy {
                timeout_secs: 120,
                required: true,
            },
            schema_valid: CheckPolicy {
                timeout_secs: 10,
                required: false,
            },
            no_regressions: CheckPolicy {
                timeout_secs: 180,
                required: false,
            },
        }
    }
}

impl CheckPolicies {
    /// Policy for a given check type
    pub fn for_type(&self, check_type: CheckType) -> CheckPolicy {
        match check_type {
            CheckType::FileExists => self.file_exists,
            CheckType::SyntaxValid => self.syntax_valid,
            CheckType::DiffNonempty => self.diff_nonempty,
            CheckType::TestsPass => self.tests_pass,
            CheckType::SchemaValid => self.schema_valid,
            CheckType::NoRegressions => self.no_regressions,
        }
    }
}

/// Termination detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminationConfig {
    /// Confidence needed to leave RUNNING
    pub potentially_complete_threshold: f64,

    /// Confidence needed to confirm completion after validation
    pub confirmed_threshold: f64,

    pub checks: CheckPolicies,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            potentially_complete_threshold: 0.20,
            confirmed_threshold: 0.70,
            checks: CheckPolicies::default(),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Token budget for the model input of one iteration
    pub token_budget: usize,

    /// Maximum loop iterations per task cycle
    pub max_iterations: usize,

    /// Share of the token budget reserved for recalled memories
    pub memory_budget_share: f64,

    /// System prompt placed at the top of every conversation
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token_budget: 32_000,
            max_iterations: 20,
            memory_budget_share: 0.25,
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_system_prompt() -> String {
    "You are a coding assistant. Use the available tools to inspect and change the \
     workspace, and state clearly when the task is complete."
        .to_string()
}

impl Config {
    /// Load configuration from the default location (~/.keel/config.toml)
    ///
    /// If the configuration file doesn't exist, writes and returns the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written, TOML parsing
    /// fails, or validation fails.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default();

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.keel/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".keel").join("config.toml"))
    }

    /// Validate value ranges and cross-field ordering
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        // Memory
        check_unit("memory.relevance_threshold", self.memory.relevance_threshold)?;
        check_weights("memory.weights", &self.memory.weights.as_vec())?;
        if self.memory.recency_half_life_minutes <= 0.0 {
            return Err(EngineError::Config(
                "memory.recency_half_life_minutes must be positive".to_string(),
            ));
        }
        if self.memory.mandatory_recent_minutes < 0.0 || self.memory.mandatory_error_minutes < 0.0
        {
            return Err(EngineError::Config(
                "memory mandatory-age thresholds must not be negative".to_string(),
            ));
        }
        if self.memory.store_capacity == 0 {
            return Err(EngineError::Config(
                "memory.store_capacity must be at least 1".to_string(),
            ));
        }

        // Quality
        let q = &self.quality;
        check_weights(
            "quality.weights",
            &[
                q.weights.structural,
                q.weights.relevance,
                q.weights.completeness,
                q.weights.coherence,
            ],
        )?;
        check_weights(
            "quality.structural_weights",
            &[
                q.structural_weights.parse,
                q.structural_weights.format,
                q.structural_weights.token_bound,
                q.structural_weights.well_formed,
            ],
        )?;
        for (name, value) in [
            ("quality.penalties.hallucination", q.penalties.hallucination),
            ("quality.penalties.contradiction", q.penalties.contradiction),
            ("quality.penalties.incomplete", q.penalties.incomplete),
            (
                "quality.penalties.broken_reference",
                q.penalties.broken_reference,
            ),
            ("quality.query_mismatch_threshold", q.query_mismatch_threshold),
        ] {
            check_unit(name, value)?;
        }
        check_unit("quality.accept_threshold", q.accept_threshold)?;
        if !(q.accept_threshold > q.retry_threshold
            && q.retry_threshold > q.escalate_threshold
            && q.escalate_threshold > 0.0)
        {
            return Err(EngineError::Config(
                "quality verdict bands must satisfy accept > retry > escalate > 0".to_string(),
            ));
        }

        // Retry
        if self.retry.repeat_escalation == 0 {
            return Err(EngineError::Config(
                "retry.repeat_escalation must be at least 1".to_string(),
            ));
        }

        // Compression
        let c = &self.compression;
        if !(c.compress_threshold > 0.0 && c.compress_threshold <= c.minimal_threshold) {
            return Err(EngineError::Config(
                "compression thresholds must satisfy 0 < compress <= minimal".to_string(),
            ));
        }
        if c.truncate_head_tokens + c.truncate_tail_tokens >= c.max_tool_result_tokens {
            return Err(EngineError::Config(
                "compression head + tail tokens must be below max_tool_result_tokens".to_string(),
            ));
        }
        if c.code_head_lines + c.code_tail_lines >= c.max_code_block_lines {
            return Err(EngineError::Config(
                "compression code head + tail lines must be below max_code_block_lines"
                    .to_string(),
            ));
        }

        // Termination
        let t = &self.termination;
        check_unit(
            "termination.potentially_complete_threshold",
            t.potentially_complete_threshold,
        )?;
        check_unit("termination.confirmed_threshold", t.confirmed_threshold)?;
        if t.potentially_complete_threshold >= t.confirmed_threshold {
            return Err(EngineError::Config(
                "termination thresholds must satisfy potentially_complete < confirmed".to_string(),
            ));
        }

        // Orchestrator
        let o = &self.orchestrator;
        if o.token_budget == 0 || o.max_iterations == 0 {
            return Err(EngineError::Config(
                "orchestrator token_budget and max_iterations must be positive".to_string(),
            ));
        }
        check_unit("orchestrator.memory_budget_share", o.memory_budget_share)?;

        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Config(format!(
            "{} must be between 0.0 and 1.0",
            name
        )));
    }
    Ok(())
}

fn check_weights(name: &str, weights: &[f64]) -> Result<(), EngineError> {
    for w in weights {
        check_unit(name, *w)?;
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(EngineError::Config(format!(
            "{} must sum to 1.0 (got {:.4})",
            name, sum
        )));
    }
    Ok(())
}
