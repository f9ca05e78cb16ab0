//! Agent Loop Core
//!
//! The orchestrator that drives one task cycle through context preparation,
//! the model call, quality evaluation, retry decisions, tool execution and the
//! termination check. The analysis components it calls are pure; all I/O goes
//! through the collaborator traits from the SDK.

pub mod buffer;
pub mod core;
pub mod state;

pub use buffer::ConversationBuffer;
pub use core::{AgentCore, FailureReason, Task, TaskResult, TaskStatus};
pub use state::{CycleMetrics, ExecutionPhase, ReasoningControlState};
