//! Reasoning control state
//!
//! The aggregate threaded through one task cycle. Created fresh when a cycle
//! starts and dropped when it ends; only the memory store and the final
//! response outlive it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::compression::{CompressionLevel, EntityTable};
use crate::retry::RetryState;
use crate::termination::{TerminationState, ValidationCheck};

/// Step of the orchestrator loop currently executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    PrepareContext,
    ModelCall,
    Evaluate,
    RetryDecision,
    ToolExecution,
    TerminationCheck,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionPhase::PrepareContext => "PREPARE_CONTEXT",
            ExecutionPhase::ModelCall => "MODEL_CALL",
            ExecutionPhase::Evaluate => "EVALUATE",
            ExecutionPhase::RetryDecision => "RETRY_DECISION",
            ExecutionPhase::ToolExecution => "TOOL_EXECUTION",
            ExecutionPhase::TerminationCheck => "TERMINATION_CHECK",
        };
        write!(f, "{}", s)
    }
}

/// Cumulative counters for one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub llm_calls: u32,
    pub tool_executions: u32,
    pub retries: u32,
    pub tokens_used: usize,

    /// Iterations in which compression changed the buffer
    pub compressions: u32,

    /// Wall time spent per phase, in milliseconds
    pub phase_durations_ms: BTreeMap<ExecutionPhase, u64>,
}

impl CycleMetrics {
    pub fn record_phase(&mut self, phase: ExecutionPhase, elapsed: Duration) {
        *self.phase_durations_ms.entry(phase).or_insert(0) += elapsed.as_millis() as u64;
    }
}

/// Aggregate control state of one task cycle
#[derive(Debug, Clone)]
pub struct ReasoningControlState {
    pub retry: RetryState,
    pub termination: TerminationState,
    pub compression_level: CompressionLevel,
    pub entity_table: EntityTable,
    pub phase: ExecutionPhase,
    pub metrics: CycleMetrics,
}

impl ReasoningControlState {
    pub fn new(plan: Vec<ValidationCheck>) -> Self {
        Self {
            retry: RetryState::default(),
            termination: TerminationState::new(plan),
            compression_level: CompressionLevel::Full,
            entity_table: EntityTable::new(),
            phase: ExecutionPhase::PrepareContext,
            metrics: CycleMetrics::default(),
        }
    }

    pub fn enter(&mut self, phase: ExecutionPhase) {
        self.phase = phase;
    }
}
