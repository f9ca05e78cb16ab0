//! Agent Core
//!
//! Runs one task-execution cycle as a bounded loop around the model call.
//! Every iteration goes through the same phases:
//!
//! 1. Prepare context: select memories, compress the conversation
//! 2. Call the model
//! 3. Evaluate response quality
//! 4. Consult the retry policy when the response is not accepted
//! 5. Execute requested tools, one at a time, recording each result
//! 6. Check termination, running validation checks when completion is likely
//!
//! The cycle ends when termination is confirmed, validation fails for good, the
//! retry policy gives up, the caller cancels, or the iteration limit is hit.
//! Business outcomes come back as a `TaskResult`; only model-call faults are
//! returned as errors.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sdk::errors::EngineError;
use sdk::{Message, MessageRole, ModelClient, ModelResponse, ToolExecutor, ToolOutcome, ValidationEnvironment};

use crate::compression::{CompressionInput, ContextCompressor};
use crate::config::Config;
use crate::memory::{MemoryItem, MemoryStore, MemoryType, QueryContext, RelevanceSelector, SelectionResult};
use crate::quality::{EvaluationInput, ExpectedResponseType, QualityEvaluator, TaskConstraints};
use crate::retry::{AbortReason, AttemptRecord, RetryAction, RetryPolicy};
use crate::termination::{
    TerminationDetector, TerminationStatus, TerminationTrigger, ValidationCheck, ValidationRunner,
};
use crate::text;

use super::buffer::ConversationBuffer;
use super::state::{CycleMetrics, ExecutionPhase, ReasoningControlState};

/// Characters of a rejected response kept in its ERROR memory
const REJECTED_PREVIEW_CHARS: usize = 200;

/// Nudge sent when the model stops calling tools without finishing
const CONTINUE_PROMPT: &str = "Continue with the task. When it is finished, say so explicitly.";

/// Task input for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    /// Task input text
    pub input: String,

    #[serde(default)]
    pub expected_type: ExpectedResponseType,

    #[serde(default)]
    pub constraints: TaskConstraints,

    /// Files the task is working on
    #[serde(default)]
    pub active_files: Vec<String>,

    /// Checks that confirm completion
    #[serde(default)]
    pub validation_checks: Vec<ValidationCheck>,
}

impl Task {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input: input.into(),
            expected_type: ExpectedResponseType::default(),
            constraints: TaskConstraints::default(),
            active_files: Vec::new(),
            validation_checks: Vec::new(),
        }
    }

    pub fn with_expected_type(mut self, expected_type: ExpectedResponseType) -> Self {
        self.expected_type = expected_type;
        self
    }

    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_active_files(mut self, files: Vec<String>) -> Self {
        self.active_files = files;
        self
    }

    pub fn with_validation_checks(mut self, checks: Vec<ValidationCheck>) -> Self {
        self.validation_checks = checks;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Complete,
    Failed,
    Escalated,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Escalated => "ESCALATED",
        };
        write!(f, "{}", s)
    }
}

/// Why a cycle did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    QualityAbort,
    MaxRetriesExceeded,
    MaxIterationsExceeded,
    ValidationFailed,
    EscalatedToUser,
    Cancelled,
}

/// Result of one task cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// Human-readable explanation of the outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Termination confidence when the cycle ended
    pub confidence: f64,

    /// Last accepted response text
    pub response: String,

    pub metrics: CycleMetrics,

    /// Every rejected attempt of the cycle
    pub attempts: Vec<AttemptRecord>,

    /// Number of iterations executed
    pub iterations: usize,

    pub duration_ms: u64,
}

impl TaskResult {
    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Complete
    }
}

/// How a cycle ended, before it becomes a `TaskResult`
struct Outcome {
    status: TaskStatus,
    reason: Option<FailureReason>,
    detail: Option<String>,
}

impl Outcome {
    fn complete() -> Self {
        Self {
            status: TaskStatus::Complete,
            reason: None,
            detail: None,
        }
    }

    fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }

    fn escalated(detail: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Escalated,
            reason: Some(FailureReason::EscalatedToUser),
            detail: Some(detail.into()),
        }
    }
}

/// Per-cycle bookkeeping that is not part of the control state
struct Cycle {
    started: Instant,
    iterations: usize,
    response: String,
    query: String,
    active_memory_ids: Vec<String>,
}

/// Orchestrates the reasoning control loop
pub struct AgentCore {
    config: Config,
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    validation: Option<ValidationRunner>,

    /// Memories retained across cycles
    memory: MemoryStore,

    selector: RelevanceSelector,
    evaluator: QualityEvaluator,
    retry_policy: RetryPolicy,
    compressor: ContextCompressor,
    detector: TerminationDetector,
}

impl AgentCore {
    /// Create a new agent core
    ///
    /// Without a validation environment, planned validation checks are skipped
    /// and completion rests on completion signals alone.
    pub fn new(
        config: Config,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
        validation_env: Option<Arc<dyn ValidationEnvironment>>,
    ) -> Self {
        let validation = validation_env
            .map(|env| ValidationRunner::new(env, config.termination.checks.clone()));

        Self {
            memory: MemoryStore::new(
                config.memory.store_capacity,
                config.memory.recency_half_life_minutes,
            ),
            selector: RelevanceSelector::new(config.memory.clone()),
            evaluator: QualityEvaluator::new(config.quality.clone()),
            retry_policy: RetryPolicy::new(config.retry.clone()),
            compressor: ContextCompressor::new(config.compression.clone()),
            detector: TerminationDetector::new(config.termination.clone()),
            config,
            model,
            tools,
            validation,
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Store a memory from outside the loop (e.g. a recorded decision)
    pub fn remember(&mut self, item: MemoryItem) -> Vec<String> {
        self.memory.insert(item)
    }

    /// Run one task cycle
    ///
    /// # Errors
    ///
    /// Returns the model collaborator's error if a model call fails. Tool
    /// failures are fed back to the model as failed tool results instead.
    pub async fn run(
        &mut self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, EngineError> {
        info!("Starting task {}: {}", task.id, text::truncate_chars(&task.input, 120));

        let plan = if self.validation.is_some() {
            task.validation_checks.clone()
        } else {
            if !task.validation_checks.is_empty() {
                warn!(
                    "No validation environment; skipping {} planned checks",
                    task.validation_checks.len()
                );
            }
            Vec::new()
        };

        let mut state = ReasoningControlState::new(plan);
        let mut buffer = ConversationBuffer::new();
        buffer.push_system(&self.config.orchestrator.system_prompt);
        buffer.push_task(&task.input);

        let task_memory = MemoryItem::new(MemoryType::Conversation, &task.input, text::now())
            .with_file_paths(task.active_files.clone());
        let mut cycle = Cycle {
            started: Instant::now(),
            iterations: 0,
            response: String::new(),
            query: task.input.clone(),
            active_memory_ids: vec![task_memory.id.clone()],
        };
        self.memory.insert(task_memory);

        let available_tools = self.tools.available_tools();
        let max_iterations = self.config.orchestrator.max_iterations;

        while cycle.iterations < max_iterations {
            if cancel.is_cancelled() {
                return Ok(self.finish(
                    task,
                    &state,
                    &cycle,
                    Outcome::failed(FailureReason::Cancelled, "Cancelled by caller"),
                ));
            }
            cycle.iterations += 1;
            debug!(
                "Task {} iteration {}/{}",
                task.id, cycle.iterations, max_iterations
            );

            // Prepare context
            let phase_start = Instant::now();
            state.enter(ExecutionPhase::PrepareContext);
            let conversation = self.prepare_context(task, &mut state, &mut buffer, &cycle);
            state
                .metrics
                .record_phase(ExecutionPhase::PrepareContext, phase_start.elapsed());

            // Model call
            let phase_start = Instant::now();
            state.enter(ExecutionPhase::ModelCall);
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(self.finish(
                        task,
                        &state,
                        &cycle,
                        Outcome::failed(FailureReason::Cancelled, "Cancelled during model call"),
                    ));
                }
                response = self.model.complete(&conversation) => response?,
            };
            state.metrics.llm_calls += 1;
            state.metrics.tokens_used += tokens_used(&conversation, &response);
            state
                .metrics
                .record_phase(ExecutionPhase::ModelCall, phase_start.elapsed());

            // Evaluate
            let phase_start = Instant::now();
            state.enter(ExecutionPhase::Evaluate);
            let query = QueryContext::from_text(&cycle.query, text::now());
            let evaluation = self.evaluator.evaluate(&EvaluationInput {
                text: &response.text,
                tool_calls: &response.tool_calls,
                expected_type: task.expected_type,
                query_tokens: &query.tokens,
                query_entities: &query.entities,
                history: &state.retry.history,
                constraints: &task.constraints,
            });
            state
                .metrics
                .record_phase(ExecutionPhase::Evaluate, phase_start.elapsed());

            // Retry decision
            if evaluation.verdict.is_accept() {
                state.retry.close_streak();
            } else {
                let phase_start = Instant::now();
                state.enter(ExecutionPhase::RetryDecision);
                let decision = self.retry_policy.decide(
                    &state.retry,
                    &evaluation,
                    &available_tools,
                    remaining_budget(self.config.orchestrator.token_budget, &conversation),
                    text::now(),
                );
                state.retry = decision.state;
                state
                    .metrics
                    .record_phase(ExecutionPhase::RetryDecision, phase_start.elapsed());

                let deficiencies: Vec<String> =
                    evaluation.deficiencies.iter().map(ToString::to_string).collect();
                self.memory.insert(MemoryItem::new(
                    MemoryType::Error,
                    format!(
                        "Rejected response ({}, score {:.2}, issues: {}): {}",
                        evaluation.verdict,
                        evaluation.score,
                        if deficiencies.is_empty() {
                            "none".to_string()
                        } else {
                            deficiencies.join(", ")
                        },
                        text::truncate_chars(response.text.trim(), REJECTED_PREVIEW_CHARS)
                    ),
                    text::now(),
                ));

                match decision.action {
                    RetryAction::Retry { guidance, .. } => {
                        state.metrics.retries += 1;
                        buffer.push_assistant(&response, true);
                        buffer.push_user(&guidance);
                        buffer.advance_turn();
                        continue;
                    }
                    RetryAction::Escalate { reason } => {
                        return Ok(self.finish(
                            task,
                            &state,
                            &cycle,
                            Outcome::escalated(format!(
                                "Response needs user input ({:?}); last verdict {} at score {:.2}",
                                reason, evaluation.verdict, evaluation.score
                            )),
                        ));
                    }
                    RetryAction::Abort { reason } => {
                        let failure = match reason {
                            AbortReason::QualityAbort => FailureReason::QualityAbort,
                            AbortReason::MaxRetriesExceeded => FailureReason::MaxRetriesExceeded,
                        };
                        return Ok(self.finish(
                            task,
                            &state,
                            &cycle,
                            Outcome::failed(
                                failure,
                                format!(
                                    "Aborted after {} rejected attempts; last score {:.2}",
                                    state.retry.retry_count, evaluation.score
                                ),
                            ),
                        ));
                    }
                    RetryAction::NoRetry => {}
                }
            }

            cycle.response = response.text.clone();
            let assistant_id = buffer.push_assistant(&response, false);

            // Tool execution
            let phase_start = Instant::now();
            state.enter(ExecutionPhase::ToolExecution);
            for call in &response.tool_calls {
                let outcome = match self.tools.execute(&call.name, &call.arguments).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Tool {} failed: {}", call.name, e);
                        ToolOutcome::failure(e.to_string())
                    }
                };
                state.metrics.tool_executions += 1;
                debug!(
                    "Tool {} ({}) {}",
                    call.name,
                    call.id,
                    if outcome.success { "succeeded" } else { "failed" }
                );

                buffer.push_tool_result(&call.id, &call.name, &outcome);
                let memory_id =
                    self.record_tool_outcome(&call.name, &call.arguments, &outcome, &assistant_id);
                cycle.active_memory_ids.push(memory_id);

                state.termination = self.detector.apply(
                    &state.termination,
                    &TerminationTrigger::ToolCompleted {
                        name: call.name.clone(),
                        success: outcome.success,
                    },
                    text::now(),
                );
            }
            state
                .metrics
                .record_phase(ExecutionPhase::ToolExecution, phase_start.elapsed());

            // Termination check
            let phase_start = Instant::now();
            state.enter(ExecutionPhase::TerminationCheck);
            state.termination = self.detector.apply(
                &state.termination,
                &TerminationTrigger::ModelOutput {
                    text: response.text.clone(),
                    has_tool_calls: response.has_tool_calls(),
                },
                text::now(),
            );

            if !response.has_tool_calls()
                && matches!(
                    state.termination.status,
                    TerminationStatus::PotentiallyComplete | TerminationStatus::AwaitingValidation
                )
            {
                self.validate(&mut state).await;
            }
            state
                .metrics
                .record_phase(ExecutionPhase::TerminationCheck, phase_start.elapsed());

            match state.termination.status {
                TerminationStatus::ConfirmedComplete => {
                    self.memory.insert(MemoryItem::new(
                        MemoryType::Conversation,
                        &cycle.response,
                        text::now(),
                    ));
                    return Ok(self.finish(task, &state, &cycle, Outcome::complete()));
                }
                TerminationStatus::Failed => {
                    let detail = failing_checks(&state);
                    return Ok(self.finish(
                        task,
                        &state,
                        &cycle,
                        Outcome::failed(FailureReason::ValidationFailed, detail),
                    ));
                }
                TerminationStatus::AwaitingValidation => {
                    let failures = state.termination.failed_results();
                    if !failures.is_empty() {
                        let lines: Vec<String> = failures
                            .iter()
                            .map(|r| format!("- {} ({}): {}", r.check_type, r.check_id, r.detail))
                            .collect();
                        buffer.push_user(&format!(
                            "Validation failed:\n{}\nFix these problems, then report completion.",
                            lines.join("\n")
                        ));
                    } else if !response.has_tool_calls() {
                        buffer.push_user(CONTINUE_PROMPT);
                    }
                }
                TerminationStatus::Running | TerminationStatus::PotentiallyComplete => {
                    if !response.has_tool_calls() {
                        buffer.push_user(CONTINUE_PROMPT);
                    }
                }
            }

            buffer.advance_turn();
        }

        warn!(
            "Task {} hit the iteration limit ({})",
            task.id, max_iterations
        );
        Ok(self.finish(
            task,
            &state,
            &cycle,
            Outcome::failed(
                FailureReason::MaxIterationsExceeded,
                format!("No confirmed completion after {} iterations", max_iterations),
            ),
        ))
    }

    /// Select memories, compress the buffer and render the model input
    fn prepare_context(
        &self,
        task: &Task,
        state: &mut ReasoningControlState,
        buffer: &mut ConversationBuffer,
        cycle: &Cycle,
    ) -> Vec<Message> {
        let budget = self.config.orchestrator.token_budget;
        let memory_budget =
            (budget as f64 * self.config.orchestrator.memory_budget_share).floor() as usize;

        let query = QueryContext::from_text(&cycle.query, text::now())
            .with_active_memories(cycle.active_memory_ids.iter().cloned())
            .with_active_files(task.active_files.iter().cloned());
        let selection = self
            .selector
            .select_with_policy(self.memory.items(), &query, memory_budget);

        let pending = buffer.take_pending();
        let current_tokens = buffer.token_count()
            + crate::compression::total_tokens(&pending)
            + selection.total_tokens;
        let result = self.compressor.compress(CompressionInput {
            messages: buffer.messages().to_vec(),
            pending_tool_results: pending,
            entity_table: state.entity_table.clone(),
            current_tokens,
            token_limit: budget,
            preserve_ids: HashSet::new(),
        });

        if !result.rules_applied.is_empty() {
            state.metrics.compressions += 1;
            debug!(
                "Compressed context at level {}: saved {} tokens ({:?})",
                result.level, result.tokens_saved, result.rules_applied
            );
        }
        state.compression_level = result.level;
        state.entity_table = result.entity_table;
        buffer.commit(result.messages, result.pending_tool_results);

        render_context(buffer, &selection)
    }

    /// Run pending validation checks and fold their results into the state
    async fn validate(&self, state: &mut ReasoningControlState) {
        let (next, pending) = self.detector.request_validation(&state.termination);
        state.termination = next;

        let Some(runner) = &self.validation else {
            return;
        };
        for result in runner.run_all(&pending).await {
            state.termination = self.detector.apply(
                &state.termination,
                &TerminationTrigger::Validation(result),
                text::now(),
            );
            if state.termination.status.is_terminal() {
                break;
            }
        }
    }

    /// Store a tool outcome as TOOL_RESULT (plus ERROR on failure); returns the TOOL_RESULT id
    fn record_tool_outcome(
        &mut self,
        name: &str,
        arguments: &str,
        outcome: &ToolOutcome,
        assistant_id: &str,
    ) -> String {
        let now = text::now();
        let paths: Vec<String> = text::extract_entities(arguments)
            .into_iter()
            .filter(|e| e.contains('/') || e.contains('.'))
            .collect();

        let item = MemoryItem::new(
            MemoryType::ToolResult,
            format!("{} {} -> {}", name, arguments, outcome.output),
            now,
        )
        .with_causal_links(vec![assistant_id.to_string()])
        .with_file_paths(paths.clone());
        let id = item.id.clone();
        self.memory.insert(item);

        if !outcome.success {
            self.memory.insert(
                MemoryItem::new(
                    MemoryType::Error,
                    format!("Tool {} failed: {}", name, outcome.output),
                    now,
                )
                .with_causal_links(vec![id.clone()])
                .with_file_paths(paths),
            );
        }

        id
    }

    fn finish(
        &self,
        task: &Task,
        state: &ReasoningControlState,
        cycle: &Cycle,
        outcome: Outcome,
    ) -> TaskResult {
        let result = TaskResult {
            task_id: task.id.clone(),
            status: outcome.status,
            reason: outcome.reason,
            detail: outcome.detail,
            confidence: state.termination.confidence,
            response: cycle.response.clone(),
            metrics: state.metrics.clone(),
            attempts: state.retry.history.clone(),
            iterations: cycle.iterations,
            duration_ms: cycle.started.elapsed().as_millis() as u64,
        };

        match result.status {
            TaskStatus::Complete => info!(
                "Task {} completed in {}ms after {} iterations (confidence {:.2})",
                result.task_id, result.duration_ms, result.iterations, result.confidence
            ),
            TaskStatus::Failed | TaskStatus::Escalated => warn!(
                "Task {} ended {} after {} iterations: {:?} {}",
                result.task_id,
                result.status,
                result.iterations,
                result.reason,
                result.detail.as_deref().unwrap_or("")
            ),
        }

        result
    }
}

/// Conversation with the selected memories inserted after the system prompt
fn render_context(buffer: &ConversationBuffer, selection: &SelectionResult) -> Vec<Message> {
    let mut messages = buffer.to_messages();
    if selection.selected.is_empty() {
        return messages;
    }

    let mut block = String::from("Relevant context from earlier work:");
    for item in &selection.selected {
        block.push_str(&format!("\n- [{}] {}", item.memory_type, item.content.trim()));
    }

    let at = messages
        .iter()
        .position(|m| m.role != MessageRole::System)
        .unwrap_or(messages.len());
    messages.insert(at, Message::system(block));
    messages
}

/// Provider-reported usage, or an estimate from the text
/// Token budget left after the rendered model input
fn remaining_budget(token_budget: usize, conversation: &[Message]) -> usize {
    let input: usize = conversation
        .iter()
        .map(|m| text::estimate_tokens(&m.content))
        .sum();
    token_budget.saturating_sub(input)
}

fn tokens_used(conversation: &[Message], response: &ModelResponse) -> usize {
    match &response.usage {
        Some(usage) => usage.total(),
        None => {
            let input: usize = conversation
                .iter()
                .map(|m| text::estimate_tokens(&m.content))
                .sum();
            input + text::estimate_tokens(&response.text)
        }
    }
}

fn failing_checks(state: &ReasoningControlState) -> String {
    let failures: Vec<String> = state
        .termination
        .failed_results()
        .iter()
        .map(|r| format!("{}: {}", r.check_type, r.detail))
        .collect();
    if failures.is_empty() {
        "Validation failed".to_string()
    } else {
        failures.join("; ")
    }
}
