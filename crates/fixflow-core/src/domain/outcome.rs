//! Stage results: the common result format every capability returns.
//!
//! The orchestrator reads only two things off a result: its tag
//! ([`OutcomeKind`]) and, for successes, the payload's [`Gate`]. Everything
//! else in a payload is for the next capability, not for the state machine.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A unified classification of a stage attempt.
///
/// Serialized as SCREAMING_SNAKE_CASE so the audit trail reads
/// SUCCESS / TRANSIENT_FAILURE / PERMANENT_FAILURE / ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    TransientFailure,
    PermanentFailure,
    /// Not a capability result: the task was cancelled.
    Cancelled,
    /// Not a capability result: an unexpected fault or workspace failure.
    Fault,
}

/// Coarse class of a transient failure. Retry budgets may cap each class
/// independently of the stage's overall attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The stage deadline elapsed before the capability answered.
    Timeout,
    RateLimited,
    Unavailable,
    /// Rejected by the capability's circuit breaker without being called.
    CircuitOpen,
    Other,
}

/// A failure reason as reported by a capability (or synthesized by the orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub class: FailureClass,
    pub message: String,
}

impl Failure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Other, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)
    }
}

/// Outcome of one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageResult<T> {
    Success(T),
    TransientFailure(Failure),
    /// The capability asserts that retrying cannot help. Never retried.
    PermanentFailure(String),
}

impl<T> StageResult<T> {
    pub fn transient(class: FailureClass, message: impl Into<String>) -> Self {
        StageResult::TransientFailure(Failure::new(class, message))
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        StageResult::PermanentFailure(reason.into())
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            StageResult::Success(_) => OutcomeKind::Success,
            StageResult::TransientFailure(_) => OutcomeKind::TransientFailure,
            StageResult::PermanentFailure(_) => OutcomeKind::PermanentFailure,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageResult<U> {
        match self {
            StageResult::Success(value) => StageResult::Success(f(value)),
            StageResult::TransientFailure(failure) => StageResult::TransientFailure(failure),
            StageResult::PermanentFailure(reason) => StageResult::PermanentFailure(reason),
        }
    }
}

/// Whether a successful payload lets the pipeline move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Halt(String),
}

/// Implemented by every stage payload. This is the only view the
/// orchestrator has into a payload.
pub trait Gated {
    fn gate(&self) -> Gate;
}

// ========================================
// Stage payloads
// ========================================

/// Result of analysis: is this issue something the resolver should attempt?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub feasibility: Feasibility,
    pub summary: String,
    /// Free-form notes handed to the resolver.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Feasibility {
    Feasible,
    Infeasible { reason: String },
}

impl AnalysisOutcome {
    pub fn feasible(summary: impl Into<String>) -> Self {
        Self {
            feasibility: Feasibility::Feasible,
            summary: summary.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn infeasible(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            feasibility: Feasibility::Infeasible {
                reason: reason.clone(),
            },
            summary: reason,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl Gated for AnalysisOutcome {
    fn gate(&self) -> Gate {
        match &self.feasibility {
            Feasibility::Feasible => Gate::Proceed,
            Feasibility::Infeasible { reason } => Gate::Halt(format!("infeasible: {reason}")),
        }
    }
}

/// A candidate modification produced inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,
    /// Commit on the workspace branch holding the change, if committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl ChangeSet {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            files: Vec::new(),
            commit: None,
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }
}

impl Gated for ChangeSet {
    fn gate(&self) -> Gate {
        Gate::Proceed
    }
}

/// Review judgement of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        notes: Vec<String>,
    },
    Blocking { issues: Vec<String> },
}

impl ReviewVerdict {
    pub fn approved() -> Self {
        ReviewVerdict::Approved { notes: Vec::new() }
    }

    pub fn blocking(issues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ReviewVerdict::Blocking {
            issues: issues.into_iter().map(Into::into).collect(),
        }
    }
}

impl Gated for ReviewVerdict {
    fn gate(&self) -> Gate {
        match self {
            ReviewVerdict::Approved { .. } => Gate::Proceed,
            ReviewVerdict::Blocking { issues } => {
                Gate::Halt(format!("review blocked: {}", issues.join("; ")))
            }
        }
    }
}

/// Reference to the published integration request (e.g. a pull request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationReference {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
}

impl IntegrationReference {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            number: None,
        }
    }

    pub fn with_number(mut self, number: u64) -> Self {
        self.number = Some(number);
        self
    }
}

impl Gated for IntegrationReference {
    fn gate(&self) -> Gate {
        Gate::Proceed
    }
}
