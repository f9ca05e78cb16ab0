//! Keel SDK
//!
//! Shared contracts between the Keel reasoning engine and the collaborators it
//! drives: the model client, the tool executor and the validation environment.
//! Nothing in this crate owns behavior; it only fixes the shapes that cross the
//! boundary.

/// Collaborator traits (model call, tool execution, validation environment)
pub mod collaborators;

/// Error types and handling
pub mod errors;

/// Conversation, tool call and tool outcome types
pub mod types;

// Re-export commonly used types
pub use collaborators::{ModelClient, ToolExecutor, ValidationEnvironment};
pub use errors::{EngineError, KeelErrorExt};
pub use types::{
    CommandOutput, Message, MessageRole, ModelResponse, TokenUsage, ToolCall, ToolOutcome,
};
