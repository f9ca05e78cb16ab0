//! Integration tests for the Agent Core Loop
//!
//! Drives full task cycles against scripted collaborators:
//! - Completion with and without tool use
//! - Retry, escalation and abort paths
//! - Validation checks deciding completion
//! - Iteration limit and cancellation

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use keel_engine::agent::{AgentCore, FailureReason, Task, TaskStatus};
use keel_engine::config::{CheckPolicies, Config};
use keel_engine::memory::MemoryType;
use keel_engine::termination::{CheckType, ValidationCheck};
use sdk::errors::EngineError;
use sdk::{
    CommandOutput, Message, ModelClient, ModelResponse, ToolCall, ToolExecutor, ToolOutcome,
    ValidationEnvironment,
};

const DONE: &str = "I have fixed the off-by-one error in src/parser.rs. The task is complete and the parser handles the last token now.";

/// Model that replays a script; the last entry repeats once the script runs out
struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelResponse, EngineError>>>,
    last: ModelResponse,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    fn new(script: Vec<ModelResponse>) -> Arc<Self> {
        let last = script.last().cloned().unwrap_or_default();
        Arc::new(Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            last,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(error: EngineError) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::from([Err(error)])),
            last: ModelResponse::default(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn conversation(&self, call: usize) -> Vec<Message> {
        self.seen.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, conversation: &[Message]) -> Result<ModelResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(conversation.to_vec());
        match self.script.lock().unwrap().pop_front() {
            Some(next) => next,
            None => Ok(self.last.clone()),
        }
    }
}

/// Tool executor that records calls; tools named `broken` fail
#[derive(Default)]
struct RecordingTools {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    fn available_tools(&self) -> Vec<String> {
        vec!["read_file".to_string(), "write_file".to_string(), "broken".to_string()]
    }

    async fn execute(&self, name: &str, arguments: &str) -> Result<ToolOutcome, EngineError> {
        self.calls.lock().unwrap().push(name.to_string());
        match name {
            "broken" => Err(EngineError::ToolError("disk full".to_string())),
            "read_file" => Ok(ToolOutcome::success(format!("contents of {}", arguments))),
            _ => Ok(ToolOutcome::success("ok")),
        }
    }
}

/// Validation environment with a fixed file set and a test command that
/// fails a configurable number of times before passing
struct FakeEnv {
    files: Vec<String>,
    failing_runs: AtomicUsize,
}

impl FakeEnv {
    fn new(files: &[&str], failing_runs: usize) -> Arc<Self> {
        Arc::new(Self {
            files: files.iter().map(|f| f.to_string()).collect(),
            failing_runs: AtomicUsize::new(failing_runs),
        })
    }
}

#[async_trait]
impl ValidationEnvironment for FakeEnv {
    async fn file_exists(&self, path: &str) -> bool {
        self.files.iter().any(|f| f == path)
    }

    async fn validate_syntax(&self, path: &str) -> Result<(), String> {
        if self.files.iter().any(|f| f == path) {
            Ok(())
        } else {
            Err(format!("File not found: {}", path))
        }
    }

    async fn read_file(&self, path: &str) -> Result<String, String> {
        Err(format!("File not found: {}", path))
    }

    async fn run_command(&self, _command: &str) -> Result<CommandOutput, EngineError> {
        let remaining = self.failing_runs.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_runs.store(remaining - 1, Ordering::SeqCst);
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "test parser::last_token ... FAILED".to_string(),
            });
        }
        Ok(CommandOutput {
            exit_code: 0,
            stdout: "test result: ok".to_string(),
            stderr: String::new(),
        })
    }
}

fn read_call(id: &str) -> ModelResponse {
    ModelResponse::with_tool_calls(
        "Reading the parser source to find where the last token is dropped.",
        vec![ToolCall::new(id, "read_file", r#"{"path": "src/parser.rs"}"#)],
    )
}

fn agent(model: Arc<ScriptedModel>, config: Config) -> AgentCore {
    AgentCore::new(config, model, Arc::new(RecordingTools::default()), None)
}

fn task() -> Task {
    Task::new("Fix the off-by-one error in src/parser.rs so the last token is parsed")
        .with_active_files(vec!["src/parser.rs".to_string()])
}

#[tokio::test]
async fn test_immediate_completion() {
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = agent(model.clone(), Config::default());

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, TaskStatus::Complete);
    assert_eq!(result.reason, None);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.response, DONE);
    assert!(result.confidence >= 0.7);
    assert_eq!(model.calls(), 1);
    assert_eq!(result.metrics.llm_calls, 1);
    assert!(result.attempts.is_empty());
}

#[tokio::test]
async fn test_tool_use_then_completion() {
    let model = ScriptedModel::new(vec![read_call("c1"), ModelResponse::text(DONE)]);
    let tools = Arc::new(RecordingTools::default());
    let mut core = AgentCore::new(Config::default(), model.clone(), tools.clone(), None);

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert!(result.is_complete());
    assert_eq!(result.iterations, 2);
    assert_eq!(result.metrics.tool_executions, 1);
    assert_eq!(*tools.calls.lock().unwrap(), vec!["read_file".to_string()]);

    // The second call sees the tool result linked to its call
    let second = model.conversation(1);
    assert!(second
        .iter()
        .any(|m| m.tool_call_id.as_deref() == Some("c1") && m.content.contains("read_file succeeded")));

    // Tool result and final response are remembered
    let types: Vec<MemoryType> = core.memory().items().iter().map(|i| i.memory_type).collect();
    assert!(types.contains(&MemoryType::ToolResult));
    assert!(core
        .memory()
        .items()
        .iter()
        .any(|i| i.memory_type == MemoryType::Conversation && i.content == DONE));
}

#[tokio::test]
async fn test_empty_response_is_retried_with_guidance() {
    let model = ScriptedModel::new(vec![ModelResponse::text(""), ModelResponse::text(DONE)]);
    let mut core = agent(model.clone(), Config::default());

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert!(result.is_complete());
    assert_eq!(result.metrics.retries, 1);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].attempt, 1);

    let retry_input = model.conversation(1);
    let guidance = retry_input.last().unwrap();
    assert!(guidance.content.contains("EMPTY_RESPONSE"));
    assert!(core
        .memory()
        .items()
        .iter()
        .any(|i| i.memory_type == MemoryType::Error && i.content.contains("Rejected response")));
}

#[tokio::test]
async fn test_repeated_deficiencies_escalate() {
    let model = ScriptedModel::new(vec![ModelResponse::text("")]);
    let mut core = agent(model.clone(), Config::default());

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, TaskStatus::Escalated);
    assert_eq!(result.reason, Some(FailureReason::EscalatedToUser));
    assert_eq!(model.calls(), 2);
    assert_eq!(result.attempts.len(), 2);
}

#[tokio::test]
async fn test_retry_limit_aborts() {
    let mut config = Config::default();
    config.retry.max_retries = 0;
    let model = ScriptedModel::new(vec![ModelResponse::text("")]);
    let mut core = agent(model.clone(), config);

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::MaxRetriesExceeded));
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_rejections_split_by_accepted_work_are_retried() {
    let model = ScriptedModel::new(vec![
        ModelResponse::text(""),
        read_call("c1"),
        ModelResponse::text(""),
        read_call("c2"),
        ModelResponse::text(DONE),
    ]);
    let mut core = agent(model.clone(), Config::default());

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert!(result.is_complete());
    assert_eq!(result.iterations, 5);
    assert_eq!(result.metrics.retries, 2);
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.attempts[1].attempt, 2);
}

#[tokio::test]
async fn test_question_after_tool_use_does_not_complete() {
    let reads: Vec<ToolCall> = (1..=4)
        .map(|i| ToolCall::new(format!("c{}", i), "read_file", r#"{"path": "src/parser.rs"}"#))
        .collect();
    let model = ScriptedModel::new(vec![
        ModelResponse::with_tool_calls(
            "Reading the parser sources to find where the last token is dropped.",
            reads,
        ),
        ModelResponse::text(
            "I could not locate the off-by-one error in src/parser.rs yet. \
             Which parser file should I look at next?",
        ),
        ModelResponse::text(DONE),
    ]);
    let mut core = agent(model.clone(), Config::default());

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert!(result.is_complete());
    assert_eq!(result.iterations, 3);
    assert_eq!(result.response, DONE);
    assert_eq!(result.metrics.tool_executions, 4);

    let third = model.conversation(2);
    assert!(third.last().unwrap().content.starts_with("Continue with the task"));
}

#[tokio::test]
async fn test_iteration_limit() {
    let mut config = Config::default();
    config.orchestrator.max_iterations = 3;
    let model = ScriptedModel::new(vec![read_call("c1"), read_call("c2"), read_call("c3")]);
    let mut core = agent(model.clone(), config);

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::MaxIterationsExceeded));
    assert_eq!(result.iterations, 3);
    assert_eq!(model.calls(), 3);
    assert_eq!(result.metrics.tool_executions, 3);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = agent(model.clone(), Config::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = core.run(&task(), &cancel).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::Cancelled));
    assert_eq!(result.iterations, 0);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_model_error_propagates() {
    let model = ScriptedModel::failing(EngineError::LLMProvider("connection refused".to_string()));
    let mut core = agent(model, Config::default());

    let err = core.run(&task(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::LLMProvider(_)));
}

#[tokio::test]
async fn test_tool_failure_is_fed_back() {
    let model = ScriptedModel::new(vec![
        ModelResponse::with_tool_calls(
            "Writing the fix to src/parser.rs now, using the broken tool first.",
            vec![ToolCall::new("c1", "broken", "{}")],
        ),
        ModelResponse::text(DONE),
    ]);
    let mut core = agent(model.clone(), Config::default());

    let result = core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert!(result.is_complete());
    let second = model.conversation(1);
    assert!(second
        .iter()
        .any(|m| m.content.contains("broken failed") && m.content.contains("disk full")));
    assert!(core
        .memory()
        .items()
        .iter()
        .any(|i| i.memory_type == MemoryType::Error && i.content.contains("disk full")));
}

#[tokio::test]
async fn test_validation_confirms_completion() {
    let policies = CheckPolicies::default();
    let checks = vec![
        ValidationCheck::new(CheckType::FileExists, Some("src/parser.rs".to_string()), &policies),
        ValidationCheck::new(CheckType::TestsPass, Some("cargo test".to_string()), &policies),
    ];
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = AgentCore::new(
        Config::default(),
        model,
        Arc::new(RecordingTools::default()),
        Some(FakeEnv::new(&["src/parser.rs"], 0)),
    );

    let result = core
        .run(&task().with_validation_checks(checks), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.iterations, 1);
}

#[tokio::test]
async fn test_missing_file_fails_validation() {
    let policies = CheckPolicies::default();
    let checks = vec![ValidationCheck::new(
        CheckType::FileExists,
        Some("src/lexer.rs".to_string()),
        &policies,
    )];
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = AgentCore::new(
        Config::default(),
        model,
        Arc::new(RecordingTools::default()),
        Some(FakeEnv::new(&["src/parser.rs"], 0)),
    );

    let result = core
        .run(&task().with_validation_checks(checks), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::ValidationFailed));
    assert!(result.detail.unwrap().contains("src/lexer.rs"));
}

#[tokio::test]
async fn test_failing_tests_are_reported_then_recovered() {
    let policies = CheckPolicies::default();
    let checks = vec![ValidationCheck::new(
        CheckType::TestsPass,
        Some("cargo test".to_string()),
        &policies,
    )];
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = AgentCore::new(
        Config::default(),
        model.clone(),
        Arc::new(RecordingTools::default()),
        Some(FakeEnv::new(&[], 1)),
    );

    let result = core
        .run(&task().with_validation_checks(checks), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.iterations, 2);

    let second = model.conversation(1);
    let feedback = second.last().unwrap();
    assert!(feedback.content.contains("Validation failed"));
    assert!(feedback.content.contains("TESTS_PASS"));
}

#[tokio::test]
async fn test_check_without_target_fails_validation() {
    let checks = vec![ValidationCheck::new(
        CheckType::TestsPass,
        None,
        &CheckPolicies::default(),
    )];
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = AgentCore::new(
        Config::default(),
        model.clone(),
        Arc::new(RecordingTools::default()),
        Some(FakeEnv::new(&[], 0)),
    );

    let result = core
        .run(&task().with_validation_checks(checks), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::ValidationFailed));
    assert!(result.detail.unwrap().contains("has no target"));
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_plan_skipped_without_environment() {
    let policies = CheckPolicies::default();
    let checks = vec![ValidationCheck::new(
        CheckType::FileExists,
        Some("src/lexer.rs".to_string()),
        &policies,
    )];
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = agent(model, Config::default());

    let result = core
        .run(&task().with_validation_checks(checks), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_complete());
}

#[tokio::test]
async fn test_memories_carry_over_between_cycles() {
    let model = ScriptedModel::new(vec![ModelResponse::text(DONE)]);
    let mut core = agent(model.clone(), Config::default());

    core.run(&task(), &CancellationToken::new()).await.unwrap();
    let remembered = core.memory().len();
    core.run(&task(), &CancellationToken::new()).await.unwrap();

    assert!(core.memory().len() > remembered);
    let second = model.conversation(1);
    assert!(second
        .iter()
        .any(|m| m.content.starts_with("Relevant context from earlier work:")
            && m.content.contains("[CONVERSATION] I have fixed")));
}
