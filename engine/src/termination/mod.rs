//! Termination Detection
//!
//! Decides when a task is actually finished. Completion signals (what the model
//! says, how tools fare, what the user says) and validation results are folded
//! into one confidence score that drives a small state machine:
//!
//! ```text
//! RUNNING -> POTENTIALLY_COMPLETE -> AWAITING_VALIDATION -> CONFIRMED_COMPLETE
//!                                            |
//!                                            +-> FAILED (non-recoverable check failure)
//! ```
//!
//! Confidence = min(0.4, 0.15 * sum of signal weights)
//!            + 0.5 * required-check pass rate
//!            + 0.1 * optional-check pass rate
//!
//! CONFIRMED_COMPLETE and FAILED are absorbing, except that explicit user
//! acceptance confirms completion from any state.

pub mod validation;

pub use validation::{
    is_non_recoverable, CheckType, ValidationCheck, ValidationResult, ValidationRunner,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::config::TerminationConfig;

/// Multiplier applied to the summed signal weights
const SIGNAL_SCALE: f64 = 0.15;

/// Cap on the signal contribution to confidence
const SIGNAL_CAP: f64 = 0.4;

const REQUIRED_CHECK_WEIGHT: f64 = 0.5;
const OPTIONAL_CHECK_WEIGHT: f64 = 0.1;

/// Maximum characters of evidence kept per signal
const EVIDENCE_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationStatus {
    Running,
    PotentiallyComplete,
    AwaitingValidation,
    ConfirmedComplete,
    Failed,
}

impl TerminationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TerminationStatus::ConfirmedComplete | TerminationStatus::Failed
        )
    }
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationStatus::Running => "RUNNING",
            TerminationStatus::PotentiallyComplete => "POTENTIALLY_COMPLETE",
            TerminationStatus::AwaitingValidation => "AWAITING_VALIDATION",
            TerminationStatus::ConfirmedComplete => "CONFIRMED_COMPLETE",
            TerminationStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Where a completion signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSource {
    ExplicitCompletion,
    NoPendingActions,
    ToolSuccess,
    ToolFailure,
    ContinuedWork,
    UserAcceptance,
}

impl SignalSource {
    /// Fixed confidence weight; negative weights pull confidence down
    pub fn weight(self) -> f64 {
        match self {
            SignalSource::ExplicitCompletion => 1.0,
            SignalSource::NoPendingActions => 0.6,
            SignalSource::ToolSuccess => 0.3,
            SignalSource::ToolFailure => -0.5,
            SignalSource::ContinuedWork => -0.3,
            SignalSource::UserAcceptance => 1.0,
        }
    }
}

/// A weighted piece of evidence that the task may be finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub source: SignalSource,
    pub confidence: f64,
    pub evidence: String,
    pub timestamp: DateTime<Utc>,
}

/// Events fed into the detector
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationTrigger {
    ModelOutput { text: String, has_tool_calls: bool },
    ToolCompleted { name: String, success: bool },
    UserInput { text: String, accepted: bool },
    Validation(ValidationResult),
}

/// Detector state for one task cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationState {
    pub status: TerminationStatus,
    pub signals: Vec<CompletionSignal>,

    /// Latest result per check id
    pub validation_results: BTreeMap<String, ValidationResult>,

    pub confidence: f64,

    /// Checks requested but not yet reported
    pub pending_checks: Vec<ValidationCheck>,

    /// Checks planned for this task
    pub plan: Vec<ValidationCheck>,

    pub validation_requested: bool,
}

impl TerminationState {
    pub fn new(plan: Vec<ValidationCheck>) -> Self {
        Self {
            status: TerminationStatus::Running,
            signals: Vec::new(),
            validation_results: BTreeMap::new(),
            confidence: 0.0,
            pending_checks: Vec::new(),
            plan,
            validation_requested: false,
        }
    }

    /// Latest failing results, ordered by check id
    pub fn failed_results(&self) -> Vec<&ValidationResult> {
        self.validation_results.values().filter(|r| !r.passed).collect()
    }
}

static COMPLETION_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn completion_patterns() -> &'static Vec<Regex> {
    COMPLETION_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\b(?:the )?task (?:is |has been )?(?:now )?(?:complete|completed|done|finished)\b")
                .expect("Invalid completion pattern"),
            Regex::new(
                r"(?i)\bi(?:'ve| have) (?:now )?(?:completed|finished|implemented|fixed|updated|added|made the (?:requested )?changes)\b",
            )
            .expect("Invalid completion pattern"),
            Regex::new(r"(?i)\b(?:all )?(?:changes|tests) (?:are |have been )?(?:applied|passing|complete)\b")
                .expect("Invalid completion pattern"),
            Regex::new(r"(?i)\bsuccessfully (?:completed|implemented|fixed|updated|created|added)\b")
                .expect("Invalid completion pattern"),
            Regex::new(r"(?i)^\s*(?:done|complete|finished)[.!]?\s*$")
                .expect("Invalid completion pattern"),
        ]
    })
}

/// Whether a response announces that the work is finished
pub fn is_completion_statement(text: &str) -> bool {
    completion_patterns().iter().any(|p| p.is_match(text))
}

/// Folds triggers into termination state
#[derive(Debug, Clone)]
pub struct TerminationDetector {
    config: TerminationConfig,
}

impl TerminationDetector {
    pub fn new(config: TerminationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TerminationConfig {
        &self.config
    }

    /// Apply one trigger and return the next state
    pub fn apply(
        &self,
        state: &TerminationState,
        trigger: &TerminationTrigger,
        now: DateTime<Utc>,
    ) -> TerminationState {
        let mut next = state.clone();

        if state.status.is_terminal() {
            // Only explicit acceptance moves a terminal state
            if let TerminationTrigger::UserInput {
                text,
                accepted: true,
            } = trigger
            {
                next.signals
                    .push(signal(SignalSource::UserAcceptance, text, now));
                next.confidence = self.confidence(&next);
                next.status = TerminationStatus::ConfirmedComplete;
            }
            return next;
        }

        match trigger {
            TerminationTrigger::ModelOutput {
                text,
                has_tool_calls,
            } => {
                if *has_tool_calls {
                    next.signals.push(signal(SignalSource::ContinuedWork, text, now));
                } else {
                    next.signals
                        .push(signal(SignalSource::NoPendingActions, text, now));
                    if is_completion_statement(text) {
                        next.signals
                            .push(signal(SignalSource::ExplicitCompletion, text, now));
                    }
                }
            }
            TerminationTrigger::ToolCompleted { name, success } => {
                let source = if *success {
                    SignalSource::ToolSuccess
                } else {
                    SignalSource::ToolFailure
                };
                next.signals.push(signal(source, name, now));
            }
            TerminationTrigger::UserInput { text, accepted } => {
                if *accepted {
                    next.signals
                        .push(signal(SignalSource::UserAcceptance, text, now));
                    next.confidence = self.confidence(&next);
                    next.status = TerminationStatus::ConfirmedComplete;
                    info!("User accepted the result");
                    return next;
                }
            }
            TerminationTrigger::Validation(result) => {
                next.pending_checks.retain(|c| c.id != result.check_id);
                next.validation_results
                    .insert(result.check_id.clone(), result.clone());

                if !result.passed && !result.recoverable {
                    next.confidence = self.confidence(&next);
                    next.status = TerminationStatus::Failed;
                    warn!(
                        "Validation {} ({}) failed irrecoverably: {}",
                        result.check_id, result.check_type, result.detail
                    );
                    return next;
                }
            }
        }

        next.confidence = self.confidence(&next);
        next.status = self.transition(&next);
        if next.status != state.status {
            debug!(
                "Termination {} -> {} (confidence {:.3})",
                state.status, next.status, next.confidence
            );
        }
        if next.status == TerminationStatus::Running {
            next.pending_checks.clear();
        }
        next
    }

    /// Move POTENTIALLY_COMPLETE (or a still-unconfirmed AWAITING_VALIDATION)
    /// into AWAITING_VALIDATION and return the checks to run.
    ///
    /// Checks whose latest result passed are not re-run.
    pub fn request_validation(
        &self,
        state: &TerminationState,
    ) -> (TerminationState, Vec<ValidationCheck>) {
        if !matches!(
            state.status,
            TerminationStatus::PotentiallyComplete | TerminationStatus::AwaitingValidation
        ) {
            return (state.clone(), Vec::new());
        }

        let mut next = state.clone();
        next.validation_requested = true;
        next.pending_checks = state
            .plan
            .iter()
            .filter(|check| {
                !state
                    .validation_results
                    .get(&check.id)
                    .is_some_and(|r| r.passed)
            })
            .cloned()
            .collect();
        next.status = TerminationStatus::AwaitingValidation;
        next.confidence = self.confidence(&next);
        next.status = self.transition(&next);

        debug!(
            "Validation requested: {} checks pending, status {}",
            next.pending_checks.len(),
            next.status
        );

        let pending = next.pending_checks.clone();
        (next, pending)
    }

    /// Confidence of a state, in [0, 1]
    pub fn confidence(&self, state: &TerminationState) -> f64 {
        let signal_sum: f64 = state.signals.iter().map(|s| s.confidence).sum();
        let signal_term = (signal_sum * SIGNAL_SCALE).clamp(0.0, SIGNAL_CAP);

        let required = pass_rate(state, true);
        let optional = pass_rate(state, false);

        (signal_term + REQUIRED_CHECK_WEIGHT * required + OPTIONAL_CHECK_WEIGHT * optional)
            .clamp(0.0, 1.0)
    }

    fn transition(&self, state: &TerminationState) -> TerminationStatus {
        let pc = self.config.potentially_complete_threshold;
        let confirmed = self.config.confirmed_threshold;

        match state.status {
            TerminationStatus::Running if state.confidence >= pc => {
                TerminationStatus::PotentiallyComplete
            }
            TerminationStatus::PotentiallyComplete if state.confidence < pc => {
                TerminationStatus::Running
            }
            TerminationStatus::AwaitingValidation => {
                if state.confidence < pc {
                    TerminationStatus::Running
                } else if state.confidence >= confirmed
                    && state.pending_checks.is_empty()
                    && has_completion_evidence(state)
                {
                    TerminationStatus::ConfirmedComplete
                } else {
                    TerminationStatus::AwaitingValidation
                }
            }
            status => status,
        }
    }
}

fn signal(source: SignalSource, evidence: &str, now: DateTime<Utc>) -> CompletionSignal {
    CompletionSignal {
        source,
        confidence: source.weight(),
        evidence: crate::text::truncate_chars(evidence.trim(), EVIDENCE_CHARS).to_string(),
        timestamp: now,
    }
}

/// Without planned checks only an explicit statement or user acceptance
/// confirms completion.
fn has_completion_evidence(state: &TerminationState) -> bool {
    !state.plan.is_empty()
        || state.signals.iter().any(|s| {
            matches!(
                s.source,
                SignalSource::ExplicitCompletion | SignalSource::UserAcceptance
            )
        })
}

/// Pass rate over the known checks of one class (planned or reported).
///
/// Pending checks count as not passed. A class with no known checks counts as
/// passed once validation was requested.
fn pass_rate(state: &TerminationState, required: bool) -> f64 {
    let mut known: BTreeMap<&str, bool> = BTreeMap::new();
    for check in state.plan.iter().filter(|c| c.required == required) {
        known.insert(check.id.as_str(), false);
    }
    for result in state
        .validation_results
        .values()
        .filter(|r| r.required == required)
    {
        known.insert(result.check_id.as_str(), result.passed);
    }

    if known.is_empty() {
        return if state.validation_requested { 1.0 } else { 0.0 };
    }
    let passed = known.values().filter(|p| **p).count();
    passed as f64 / known.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckPolicies;
    use crate::text;

    fn detector() -> TerminationDetector {
        TerminationDetector::new(TerminationConfig::default())
    }

    fn model_output(text: &str, has_tool_calls: bool) -> TerminationTrigger {
        TerminationTrigger::ModelOutput {
            text: text.to_string(),
            has_tool_calls,
        }
    }

    fn tests_check() -> ValidationCheck {
        ValidationCheck::new(
            CheckType::TestsPass,
            Some("cargo test".to_string()),
            &CheckPolicies::default(),
        )
        .with_id("tests")
    }

    fn result(check: &ValidationCheck, passed: bool, detail: &str) -> ValidationResult {
        if passed {
            ValidationResult::pass(check, detail)
        } else {
            ValidationResult::fail(check, detail)
        }
    }

    #[test]
    fn test_completion_statement() {
        assert!(is_completion_statement("I've implemented the parser."));
        assert!(is_completion_statement("The task is complete."));
        assert!(is_completion_statement("Done."));
        assert!(!is_completion_statement("Let me read the file first."));
    }

    #[test]
    fn test_tool_calls_keep_running() {
        let d = detector();
        let state = d.apply(
            &TerminationState::new(vec![]),
            &model_output("Reading the file", true),
            text::now(),
        );
        assert_eq!(state.status, TerminationStatus::Running);
        assert_eq!(state.confidence, 0.0);
    }

    #[test]
    fn test_completion_without_checks_confirms_after_validation() {
        let d = detector();
        let state = d.apply(
            &TerminationState::new(vec![]),
            &model_output("I have fixed the bug. The task is complete.", false),
            text::now(),
        );
        // (1.0 + 0.6) * 0.15 = 0.24
        assert!((state.confidence - 0.24).abs() < 1e-9);
        assert_eq!(state.status, TerminationStatus::PotentiallyComplete);

        let (state, pending) = d.request_validation(&state);
        assert!(pending.is_empty());
        assert!((state.confidence - 0.84).abs() < 1e-9);
        assert_eq!(state.status, TerminationStatus::ConfirmedComplete);
    }

    #[test]
    fn test_tool_progress_without_completion_statement_is_not_confirmed() {
        let d = detector();
        let mut state = TerminationState::new(vec![]);
        for _ in 0..4 {
            state = d.apply(
                &state,
                &TerminationTrigger::ToolCompleted {
                    name: "read_file".to_string(),
                    success: true,
                },
                text::now(),
            );
        }
        let state = d.apply(
            &state,
            &model_output(
                "I could not locate the off-by-one error. Which parser file should I look at next?",
                false,
            ),
            text::now(),
        );
        assert_eq!(state.status, TerminationStatus::PotentiallyComplete);

        let (state, pending) = d.request_validation(&state);
        assert!(pending.is_empty());
        assert!(state.confidence >= 0.70);
        assert_eq!(state.status, TerminationStatus::AwaitingValidation);

        // A later completion statement confirms
        let state = d.apply(
            &state,
            &model_output("I have fixed the parser.", false),
            text::now(),
        );
        assert_eq!(state.status, TerminationStatus::ConfirmedComplete);
    }

    #[test]
    fn test_validation_flow_with_required_check() {
        let d = detector();
        let check = tests_check();
        let state = d.apply(
            &TerminationState::new(vec![check.clone()]),
            &model_output("All changes are applied. Done.", false),
            text::now(),
        );
        assert_eq!(state.status, TerminationStatus::PotentiallyComplete);

        let (state, pending) = d.request_validation(&state);
        assert_eq!(pending, vec![check.clone()]);
        assert_eq!(state.status, TerminationStatus::AwaitingValidation);

        // Recoverable failure keeps waiting
        let failed = d.apply(
            &state,
            &TerminationTrigger::Validation(result(&check, false, "2 tests failed")),
            text::now(),
        );
        assert_eq!(failed.status, TerminationStatus::AwaitingValidation);

        let passed = d.apply(
            &state,
            &TerminationTrigger::Validation(result(&check, true, "ok")),
            text::now(),
        );
        assert_eq!(passed.status, TerminationStatus::ConfirmedComplete);
    }

    #[test]
    fn test_non_recoverable_failure_fails() {
        let d = detector();
        let check = tests_check();
        let state = d.apply(
            &TerminationState::new(vec![check.clone()]),
            &model_output("The task is complete.", false),
            text::now(),
        );
        let (state, _) = d.request_validation(&state);
        let state = d.apply(
            &state,
            &TerminationTrigger::Validation(result(&check, false, "cargo: command not found")),
            text::now(),
        );
        assert_eq!(state.status, TerminationStatus::Failed);
    }

    #[test]
    fn test_regression_to_running() {
        let d = detector();
        let state = d.apply(
            &TerminationState::new(vec![]),
            &model_output("The task is complete.", false),
            text::now(),
        );
        assert_eq!(state.status, TerminationStatus::PotentiallyComplete);

        let state = d.apply(
            &state,
            &TerminationTrigger::ToolCompleted {
                name: "write".to_string(),
                success: false,
            },
            text::now(),
        );
        // (1.6 - 0.5) * 0.15 = 0.165 < 0.20
        assert_eq!(state.status, TerminationStatus::Running);
    }

    #[test]
    fn test_terminal_states_absorb_except_acceptance() {
        let d = detector();
        let mut state = TerminationState::new(vec![]);
        state.status = TerminationStatus::Failed;

        let after = d.apply(&state, &model_output("The task is complete.", false), text::now());
        assert_eq!(after.status, TerminationStatus::Failed);

        let accepted = d.apply(
            &state,
            &TerminationTrigger::UserInput {
                text: "looks good".to_string(),
                accepted: true,
            },
            text::now(),
        );
        assert_eq!(accepted.status, TerminationStatus::ConfirmedComplete);
    }

    #[test]
    fn test_user_acceptance_from_running() {
        let d = detector();
        let state = d.apply(
            &TerminationState::new(vec![]),
            &TerminationTrigger::UserInput {
                text: "ship it".to_string(),
                accepted: true,
            },
            text::now(),
        );
        assert_eq!(state.status, TerminationStatus::ConfirmedComplete);
    }

    #[test]
    fn test_latest_validation_result_replaces_prior() {
        let d = detector();
        let check = tests_check();
        let mut state = TerminationState::new(vec![check.clone()]);
        state.status = TerminationStatus::AwaitingValidation;
        state.validation_requested = true;

        let state = d.apply(
            &state,
            &TerminationTrigger::Validation(result(&check, false, "1 failed")),
            text::now(),
        );
        let state = d.apply(
            &state,
            &TerminationTrigger::Validation(result(&check, true, "ok")),
            text::now(),
        );
        assert_eq!(state.validation_results.len(), 1);
        assert!(state.validation_results["tests"].passed);
    }
}
