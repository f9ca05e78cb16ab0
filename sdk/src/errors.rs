//! Error types and handling
//!
//! This module provides the error types used at the fallible edges of the Keel
//! engine: configuration loading, collaborator calls and CLI I/O. The analysis
//! components themselves are total and never produce these errors; business
//! outcomes (verdicts, retry actions, termination states) are plain values.
//!
//! All errors implement the `KeelErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.

use thiserror::Error;

/// Trait for Keel error extensions
///
/// Provides additional context for errors, including a user-friendly hint and
/// recoverability information.
pub trait KeelErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried by the caller. Non-recoverable errors
    /// require a configuration change or manual intervention.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, KeelErrorExt};
///
/// let error = EngineError::LLMTimeout;
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::Config("bad weights".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Model collaborator errors
    #[error("LLM provider error: {0}")]
    LLMProvider(String),

    #[error("LLM call timed out")]
    LLMTimeout,

    // Tool collaborator errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    // Validation environment errors
    #[error("Validation environment error: {0}")]
    ValidationEnvironment(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeelErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::LLMProvider(_) => "Model provider unavailable. Check your API keys and network",
            Self::LLMTimeout => "Model provider took too long to respond. Try again",
            Self::ToolNotFound(_) => "The requested tool is not available",
            Self::ToolError(_) => "Tool operation failed",
            Self::ValidationEnvironment(_) => "A validation check could not be executed",
            Self::Serialization(_) => "Input or output could not be (de)serialized",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Serialization(_) => false,
            Self::LLMProvider(_)
            | Self::LLMTimeout
            | Self::ToolNotFound(_)
            | Self::ToolError(_)
            | Self::ValidationEnvironment(_)
            | Self::Io(_) => true,
        }
    }
}
