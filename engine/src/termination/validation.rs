//! Validation checks
//!
//! Typed checks that confirm a task is really finished, executed against an
//! injected `ValidationEnvironment` with a per-type timeout. A failed check is
//! recoverable unless its detail says the target is missing or inaccessible.

use regex::Regex;
use sdk::{EngineError, ValidationEnvironment};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CheckPolicies;

/// Command used by DIFF_NONEMPTY when the check names none
const DEFAULT_DIFF_COMMAND: &str = "git diff --stat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    FileExists,
    SyntaxValid,
    DiffNonempty,
    TestsPass,
    SchemaValid,
    NoRegressions,
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckType::FileExists => "FILE_EXISTS",
            CheckType::SyntaxValid => "SYNTAX_VALID",
            CheckType::DiffNonempty => "DIFF_NONEMPTY",
            CheckType::TestsPass => "TESTS_PASS",
            CheckType::SchemaValid => "SCHEMA_VALID",
            CheckType::NoRegressions => "NO_REGRESSIONS",
        };
        write!(f, "{}", s)
    }
}

/// A planned validation check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub id: String,
    pub check_type: CheckType,

    /// File path for file checks, command for command checks
    #[serde(default)]
    pub target: Option<String>,

    pub required: bool,
}

impl ValidationCheck {
    /// Check with the required flag taken from the type's policy
    pub fn new(check_type: CheckType, target: Option<String>, policies: &CheckPolicies) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            check_type,
            target,
            required: policies.for_type(check_type).required,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Outcome of one validation check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub check_id: String,
    pub check_type: CheckType,
    pub required: bool,
    pub passed: bool,
    pub detail: String,
    pub recoverable: bool,
    pub duration_ms: u64,
}

impl ValidationResult {
    /// Passing result
    pub fn pass(check: &ValidationCheck, detail: impl Into<String>) -> Self {
        Self {
            check_id: check.id.clone(),
            check_type: check.check_type,
            required: check.required,
            passed: true,
            detail: detail.into(),
            recoverable: true,
            duration_ms: 0,
        }
    }

    /// Failing result; recoverability is derived from the detail text
    pub fn fail(check: &ValidationCheck, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            check_id: check.id.clone(),
            check_type: check.check_type,
            required: check.required,
            passed: false,
            recoverable: !is_non_recoverable(&detail),
            detail,
            duration_ms: 0,
        }
    }
}

static NON_RECOVERABLE: OnceLock<Regex> = OnceLock::new();

/// Whether a failure detail describes a missing or inaccessible target
pub fn is_non_recoverable(detail: &str) -> bool {
    NON_RECOVERABLE
        .get_or_init(|| {
            Regex::new(r"(?i)permission denied|access denied|not found|does not exist|no such file")
                .expect("Invalid non-recoverable pattern")
        })
        .is_match(detail)
}

/// Executes validation checks against a validation environment
pub struct ValidationRunner {
    env: Arc<dyn ValidationEnvironment>,
    policies: CheckPolicies,
}

impl ValidationRunner {
    pub fn new(env: Arc<dyn ValidationEnvironment>, policies: CheckPolicies) -> Self {
        Self { env, policies }
    }

    /// Run checks one at a time, in order
    pub async fn run_all(&self, checks: &[ValidationCheck]) -> Vec<ValidationResult> {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            results.push(self.run(check).await);
        }
        results
    }

    /// Run one check under its type's timeout
    pub async fn run(&self, check: &ValidationCheck) -> ValidationResult {
        let limit = self.policies.for_type(check.check_type).timeout();
        let start = Instant::now();

        let mut result = match timeout(limit, self.execute(check)).await {
            Ok(result) => result,
            Err(_) => {
                // Timeouts are always retryable
                let mut result = ValidationResult::fail(
                    check,
                    format!("{} timed out after {}s", check.check_type, limit.as_secs()),
                );
                result.recoverable = true;
                result
            }
        };
        result.duration_ms = start.elapsed().as_millis() as u64;

        if result.passed {
            debug!("Check {} ({}) passed", check.id, check.check_type);
        } else if result.recoverable {
            debug!(
                "Check {} ({}) failed: {}",
                check.id, check.check_type, result.detail
            );
        } else {
            warn!(
                "Check {} ({}) failed and cannot recover: {}",
                check.id, check.check_type, result.detail
            );
        }

        result
    }

    async fn execute(&self, check: &ValidationCheck) -> ValidationResult {
        let target = check.target.as_deref().map(str::trim).filter(|t| !t.is_empty());

        match check.check_type {
            CheckType::FileExists => {
                let Some(path) = target else {
                    return missing_target(check);
                };
                if self.env.file_exists(path).await {
                    ValidationResult::pass(check, format!("{} exists", path))
                } else {
                    ValidationResult::fail(check, format!("File not found: {}", path))
                }
            }
            CheckType::SyntaxValid => {
                let Some(path) = target else {
                    return missing_target(check);
                };
                match self.env.validate_syntax(path).await {
                    Ok(()) => ValidationResult::pass(check, format!("{} parses", path)),
                    Err(e) => ValidationResult::fail(check, e),
                }
            }
            CheckType::SchemaValid => {
                let Some(path) = target else {
                    return missing_target(check);
                };
                match self.env.read_file(path).await {
                    Ok(contents) => match serde_json::from_str::<serde_json::Value>(&contents) {
                        Ok(serde_json::Value::Object(_)) => {
                            ValidationResult::pass(check, format!("{} is a JSON object", path))
                        }
                        Ok(_) => ValidationResult::fail(
                            check,
                            format!("{} is valid JSON but not an object", path),
                        ),
                        Err(e) => ValidationResult::fail(check, format!("Invalid JSON: {}", e)),
                    },
                    Err(e) => ValidationResult::fail(check, e),
                }
            }
            CheckType::DiffNonempty => {
                let command = target.unwrap_or(DEFAULT_DIFF_COMMAND);
                match self.env.run_command(command).await {
                    Ok(output) if output.succeeded() && !output.stdout.trim().is_empty() => {
                        ValidationResult::pass(check, output.stdout.trim().to_string())
                    }
                    Ok(output) if output.succeeded() => {
                        ValidationResult::fail(check, "Working tree has no changes")
                    }
                    Ok(output) => ValidationResult::fail(check, command_failure(command, &output)),
                    Err(e) => ValidationResult::fail(check, collaborator_failure(&e)),
                }
            }
            CheckType::TestsPass | CheckType::NoRegressions => {
                let Some(command) = target else {
                    return missing_target(check);
                };
                match self.env.run_command(command).await {
                    Ok(output) if output.succeeded() => {
                        ValidationResult::pass(check, format!("`{}` exited 0", command))
                    }
                    Ok(output) => ValidationResult::fail(check, command_failure(command, &output)),
                    Err(e) => ValidationResult::fail(check, collaborator_failure(&e)),
                }
            }
        }
    }
}

/// A check without a target can never pass, so the failure is final
fn missing_target(check: &ValidationCheck) -> ValidationResult {
    let mut result = ValidationResult::fail(check, format!("{} check has no target", check.check_type));
    result.recoverable = false;
    result
}

fn command_failure(command: &str, output: &sdk::CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("`{}` exited with code {}", command, output.exit_code)
    } else {
        format!(
            "`{}` exited with code {}: {}",
            command,
            output.exit_code,
            crate::text::truncate_chars(stderr, 500)
        )
    }
}

fn collaborator_failure(error: &EngineError) -> String {
    error.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sdk::CommandOutput;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeEnv {
        files: HashMap<String, String>,
        commands: HashMap<String, CommandOutput>,
        slow: bool,
    }

    #[async_trait]
    impl ValidationEnvironment for FakeEnv {
        async fn file_exists(&self, path: &str) -> bool {
            self.files.contains_key(path)
        }

        async fn validate_syntax(&self, path: &str) -> Result<(), String> {
            match self.files.get(path) {
                Some(contents) if contents.contains("syntax error") => {
                    Err(format!("{}: unexpected token", path))
                }
                Some(_) => Ok(()),
                None => Err(format!("{}: no such file", path)),
            }
        }

        async fn read_file(&self, path: &str) -> Result<String, String> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| format!("{}: does not exist", path))
        }

        async fn run_command(&self, command: &str) -> Result<CommandOutput, EngineError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.commands
                .get(command)
                .cloned()
                .ok_or_else(|| EngineError::ValidationEnvironment(format!("unknown command {}", command)))
        }
    }

    fn runner(env: FakeEnv) -> ValidationRunner {
        ValidationRunner::new(Arc::new(env), CheckPolicies::default())
    }

    fn check(check_type: CheckType, target: Option<&str>) -> ValidationCheck {
        ValidationCheck::new(
            check_type,
            target.map(str::to_string),
            &CheckPolicies::default(),
        )
    }

    #[test]
    fn test_non_recoverable_patterns() {
        assert!(is_non_recoverable("Permission denied (os error 13)"));
        assert!(is_non_recoverable("File not found: a.rs"));
        assert!(is_non_recoverable("path does not exist"));
        assert!(!is_non_recoverable("3 tests failed"));
    }

    #[test]
    fn test_required_flag_from_policy() {
        assert!(check(CheckType::TestsPass, Some("cargo test")).required);
        assert!(!check(CheckType::SchemaValid, Some("a.json")).required);
    }

    #[tokio::test]
    async fn test_file_exists() {
        let mut env = FakeEnv::default();
        env.files.insert("src/lib.rs".to_string(), "fn main() {}".to_string());
        let runner = runner(env);

        let ok = runner.run(&check(CheckType::FileExists, Some("src/lib.rs"))).await;
        assert!(ok.passed);

        let missing = runner.run(&check(CheckType::FileExists, Some("src/gone.rs"))).await;
        assert!(!missing.passed);
        assert!(!missing.recoverable);
    }

    #[tokio::test]
    async fn test_syntax_failure_is_recoverable() {
        let mut env = FakeEnv::default();
        env.files
            .insert("src/lib.rs".to_string(), "syntax error here".to_string());
        let result = runner(env)
            .run(&check(CheckType::SyntaxValid, Some("src/lib.rs")))
            .await;
        assert!(!result.passed);
        assert!(result.recoverable);
    }

    #[tokio::test]
    async fn test_schema_valid() {
        let mut env = FakeEnv::default();
        env.files
            .insert("config.json".to_string(), r#"{"name": "keel"}"#.to_string());
        env.files.insert("list.json".to_string(), "[1, 2]".to_string());
        let runner = runner(env);

        assert!(runner.run(&check(CheckType::SchemaValid, Some("config.json"))).await.passed);
        assert!(!runner.run(&check(CheckType::SchemaValid, Some("list.json"))).await.passed);
    }

    #[tokio::test]
    async fn test_diff_nonempty_uses_default_command() {
        let mut env = FakeEnv::default();
        env.commands.insert(
            DEFAULT_DIFF_COMMAND.to_string(),
            CommandOutput {
                exit_code: 0,
                stdout: " src/lib.rs | 2 +-\n".to_string(),
                stderr: String::new(),
            },
        );
        let result = runner(env).run(&check(CheckType::DiffNonempty, None)).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_tests_pass_requires_exit_zero() {
        let mut env = FakeEnv::default();
        env.commands.insert(
            "cargo test".to_string(),
            CommandOutput {
                exit_code: 101,
                stdout: String::new(),
                stderr: "test result: FAILED. 1 failed".to_string(),
            },
        );
        let result = runner(env)
            .run(&check(CheckType::TestsPass, Some("cargo test")))
            .await;
        assert!(!result.passed);
        assert!(result.recoverable);
        assert!(result.detail.contains("101"));
    }

    #[tokio::test]
    async fn test_missing_target_is_not_recoverable() {
        let runner = runner(FakeEnv::default());
        for check_type in [
            CheckType::FileExists,
            CheckType::SyntaxValid,
            CheckType::SchemaValid,
            CheckType::TestsPass,
            CheckType::NoRegressions,
        ] {
            let result = runner.run(&check(check_type, None)).await;
            assert!(!result.passed);
            assert!(!result.recoverable, "{} without target", check_type);
            assert!(result.detail.contains("has no target"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_recoverable() {
        let env = FakeEnv {
            slow: true,
            ..Default::default()
        };
        let result = runner(env)
            .run(&check(CheckType::NoRegressions, Some("cargo test")))
            .await;
        assert!(!result.passed);
        assert!(result.recoverable);
        assert!(result.detail.contains("timed out"));
    }
}
