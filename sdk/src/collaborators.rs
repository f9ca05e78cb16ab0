//! Collaborator traits
//!
//! The reasoning engine never talks to a provider, a tool registry or a shell
//! directly. It is handed implementations of these traits and calls them in a
//! strictly sequential order. Each implementation enforces its own limits
//! (timeouts, rate limits, sandboxing).

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::types::{CommandOutput, Message, ModelResponse, ToolOutcome};

/// Model-call collaborator: `(conversation) -> { text, toolCalls[] }`
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Returns the provider name, used in logs only
    fn name(&self) -> &str;

    /// Complete the given conversation
    async fn complete(&self, conversation: &[Message]) -> Result<ModelResponse, EngineError>;
}

/// Tool-execution collaborator: `(toolName, arguments) -> { success, output }`
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Names of the tools the model may call
    fn available_tools(&self) -> Vec<String>;

    /// Execute one tool call. `arguments` is the raw JSON string from the model.
    async fn execute(&self, name: &str, arguments: &str) -> Result<ToolOutcome, EngineError>;
}

/// Environment used by validation checks
///
/// Implementations decide what "syntax valid" means for a given path and
/// where commands run.
#[async_trait]
pub trait ValidationEnvironment: Send + Sync {
    async fn file_exists(&self, path: &str) -> bool;

    /// Returns `Err(detail)` when the file does not parse
    async fn validate_syntax(&self, path: &str) -> Result<(), String>;

    async fn read_file(&self, path: &str) -> Result<String, String>;

    async fn run_command(&self, command: &str) -> Result<CommandOutput, EngineError>;
}
