//! Retry Policy
//!
//! State machine that turns a quality verdict into a retry action. The state
//! tracks how many non-accepted attempts the cycle has seen and what each one
//! looked like; the count only ever grows within a cycle. A separate streak
//! counts the rejections since the last accepted response.
//!
//! # Transitions
//!
//! | Verdict  | Condition                                   | Action                          |
//! |----------|---------------------------------------------|---------------------------------|
//! | ACCEPT   |                                             | no retry, streak closed         |
//! | any      | retries exceed `max_retries`                | abort (MAX_RETRIES_EXCEEDED)    |
//! | ABORT    | previous attempt in the streak also ABORT   | abort (QUALITY_ABORT)           |
//! | ABORT    | otherwise                                   | retry (FIX_FORMAT or RESTATE)   |
//! | ESCALATE |                                             | escalate (LOW_QUALITY)          |
//! | RETRY    | MISSING_TOOL_CALL and no tools available    | escalate (NO_TOOLS_AVAILABLE)   |
//! | RETRY    | same deficiencies across the streak window  | escalate (REPEATED_DEFICIENCIES)|
//! | RETRY    | otherwise                                   | retry with a reframing strategy |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::quality::{Deficiency, QualityEvalOutput, Verdict};

/// One non-accepted attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub verdict: Verdict,
    pub deficiencies: BTreeSet<Deficiency>,
    pub score: f64,
    pub timestamp: DateTime<Utc>,

    /// Normalized content hash of the rejected response
    pub response_hash: String,
}

/// Retry bookkeeping for one task cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub history: Vec<AttemptRecord>,

    /// Rejections since the last accepted response
    #[serde(default)]
    pub streak: u32,
}

impl RetryState {
    /// Attempts of the current rejection streak, oldest first
    pub fn streak_attempts(&self) -> &[AttemptRecord] {
        let len = (self.streak as usize).min(self.history.len());
        &self.history[self.history.len() - len..]
    }

    /// Close the rejection streak after an accepted response
    pub fn close_streak(&mut self) {
        self.streak = 0;
    }
}

/// How the next attempt is reframed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    FixFormat,
    RequestToolCall,
    GroundInEvidence,
    CompleteOutput,
    RestateConstraints,
    NarrowScope,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryStrategy::FixFormat => "FIX_FORMAT",
            RetryStrategy::RequestToolCall => "REQUEST_TOOL_CALL",
            RetryStrategy::GroundInEvidence => "GROUND_IN_EVIDENCE",
            RetryStrategy::CompleteOutput => "COMPLETE_OUTPUT",
            RetryStrategy::RestateConstraints => "RESTATE_CONSTRAINTS",
            RetryStrategy::NarrowScope => "NARROW_SCOPE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    /// The verdict itself was ESCALATE
    LowQuality,
    RepeatedDeficiencies,
    NoToolsAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbortReason {
    QualityAbort,
    MaxRetriesExceeded,
}

/// What the orchestrator should do with the evaluated response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryAction {
    NoRetry,
    Retry {
        strategy: RetryStrategy,
        guidance: String,
    },
    Escalate {
        reason: EscalationReason,
    },
    Abort {
        reason: AbortReason,
    },
}

/// Action plus the state to carry forward
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub state: RetryState,
}

/// Decides between retrying, escalating and aborting
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide the next action for an evaluated response.
    ///
    /// `context_budget` is the token budget of the next model input; tight
    /// budgets bias the strategy toward narrowing scope.
    pub fn decide(
        &self,
        state: &RetryState,
        evaluation: &QualityEvalOutput,
        available_tools: &[String],
        context_budget: usize,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if evaluation.verdict.is_accept() {
            let mut next = state.clone();
            next.close_streak();
            return RetryDecision {
                action: RetryAction::NoRetry,
                state: next,
            };
        }

        let mut next = state.clone();
        next.retry_count += 1;
        next.streak += 1;
        next.history.push(AttemptRecord {
            attempt: next.retry_count,
            verdict: evaluation.verdict,
            deficiencies: evaluation.deficiencies.clone(),
            score: evaluation.score,
            timestamp: now,
            response_hash: evaluation.response_hash.clone(),
        });

        let action = self.action_for(&next, evaluation, available_tools, context_budget);

        match &action {
            RetryAction::Retry { strategy, .. } => debug!(
                "Attempt {} scored {:.3} ({}), retrying with {}",
                next.retry_count, evaluation.score, evaluation.verdict, strategy
            ),
            RetryAction::Escalate { reason } => warn!(
                "Attempt {} scored {:.3} ({}), escalating: {:?}",
                next.retry_count, evaluation.score, evaluation.verdict, reason
            ),
            RetryAction::Abort { reason } => warn!(
                "Attempt {} scored {:.3} ({}), aborting: {:?}",
                next.retry_count, evaluation.score, evaluation.verdict, reason
            ),
            RetryAction::NoRetry => {}
        }

        RetryDecision {
            action,
            state: next,
        }
    }

    fn action_for(
        &self,
        state: &RetryState,
        evaluation: &QualityEvalOutput,
        available_tools: &[String],
        context_budget: usize,
    ) -> RetryAction {
        if state.retry_count > self.config.max_retries {
            return RetryAction::Abort {
                reason: AbortReason::MaxRetriesExceeded,
            };
        }

        match evaluation.verdict {
            Verdict::Accept => RetryAction::NoRetry,
            Verdict::Abort => {
                if self.abort_persisted(state) {
                    return RetryAction::Abort {
                        reason: AbortReason::QualityAbort,
                    };
                }
                let strategy = recovery_strategy(&evaluation.deficiencies);
                RetryAction::Retry {
                    strategy,
                    guidance: guidance(strategy, &evaluation.deficiencies, available_tools),
                }
            }
            Verdict::Escalate => RetryAction::Escalate {
                reason: EscalationReason::LowQuality,
            },
            Verdict::Retry => {
                if evaluation.has(Deficiency::MissingToolCall) && available_tools.is_empty() {
                    return RetryAction::Escalate {
                        reason: EscalationReason::NoToolsAvailable,
                    };
                }
                if self.deficiencies_repeating(state) {
                    return RetryAction::Escalate {
                        reason: EscalationReason::RepeatedDeficiencies,
                    };
                }
                let strategy = select_strategy(&evaluation.deficiencies, context_budget, &self.config);
                RetryAction::Retry {
                    strategy,
                    guidance: guidance(strategy, &evaluation.deficiencies, available_tools),
                }
            }
        }
    }

    /// The latest `repeat_escalation` attempts of the streak share one
    /// non-empty deficiency set
    fn deficiencies_repeating(&self, state: &RetryState) -> bool {
        let window = self.config.repeat_escalation;
        let streak = state.streak_attempts();
        if window < 2 || streak.len() < window {
            return false;
        }
        let recent = &streak[streak.len() - window..];
        let first = &recent[0].deficiencies;
        !first.is_empty() && recent.iter().all(|r| &r.deficiencies == first)
    }

    /// The attempt before the latest one in this streak was also ABORT-band
    fn abort_persisted(&self, state: &RetryState) -> bool {
        let streak = state.streak_attempts();
        streak.len() >= 2 && streak[streak.len() - 2].verdict == Verdict::Abort
    }
}

/// Strategy for the single retry granted to an ABORT-band response
fn recovery_strategy(deficiencies: &BTreeSet<Deficiency>) -> RetryStrategy {
    let format_broken = [
        Deficiency::EmptyResponse,
        Deficiency::ParseFailure,
        Deficiency::MalformedToolCall,
    ]
    .iter()
    .any(|d| deficiencies.contains(d));
    if format_broken {
        RetryStrategy::FixFormat
    } else {
        RetryStrategy::RestateConstraints
    }
}

/// First matching strategy for a deficiency set
pub fn select_strategy(
    deficiencies: &BTreeSet<Deficiency>,
    context_budget: usize,
    config: &RetryConfig,
) -> RetryStrategy {
    let has = |d: Deficiency| deficiencies.contains(&d);

    if has(Deficiency::EmptyResponse)
        || has(Deficiency::ParseFailure)
        || has(Deficiency::MalformedToolCall)
    {
        RetryStrategy::FixFormat
    } else if has(Deficiency::MissingToolCall) {
        RetryStrategy::RequestToolCall
    } else if has(Deficiency::HallucinationMarker) || has(Deficiency::SelfContradiction) {
        RetryStrategy::GroundInEvidence
    } else if has(Deficiency::Truncated) || has(Deficiency::IncompleteCode) {
        RetryStrategy::CompleteOutput
    } else if has(Deficiency::MissingRequiredOutput) || has(Deficiency::WrongLanguage) {
        RetryStrategy::RestateConstraints
    } else if has(Deficiency::QueryMismatch) || context_budget < config.tight_budget_tokens {
        RetryStrategy::NarrowScope
    } else {
        RetryStrategy::RestateConstraints
    }
}

/// Reframing message sent to the model before the next attempt
pub fn guidance(
    strategy: RetryStrategy,
    deficiencies: &BTreeSet<Deficiency>,
    available_tools: &[String],
) -> String {
    let body = match strategy {
        RetryStrategy::FixFormat => "Your previous response could not be used because it was \
             empty or its tool calls were malformed. Respond with content, and make sure every \
             tool call names a tool and passes a JSON object as arguments."
            .to_string(),
        RetryStrategy::RequestToolCall => format!(
            "Your previous response did not call the tool this step needs. Call one of the \
             available tools: {}.",
            available_tools.join(", ")
        ),
        RetryStrategy::GroundInEvidence => "Your previous response made unsupported assumptions \
             or contradicted itself. Only state what you have verified, and read files before \
             describing them."
            .to_string(),
        RetryStrategy::CompleteOutput => "Your previous response was cut off or contained \
             incomplete code. Give the complete answer and close every code block."
            .to_string(),
        RetryStrategy::RestateConstraints => "Your previous response did not meet the task \
             requirements. Re-read the task and address every requirement explicitly."
            .to_string(),
        RetryStrategy::NarrowScope => "Your previous response drifted from the request. Focus \
             only on the current task and keep the answer short."
            .to_string(),
    };

    if deficiencies.is_empty() {
        return body;
    }
    let issues: Vec<String> = deficiencies.iter().map(ToString::to_string).collect();
    format!("{} Detected issues: {}.", body, issues.join(", "))
}
