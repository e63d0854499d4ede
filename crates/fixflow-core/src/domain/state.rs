//! Pipeline state machine.
//!
//! State transitions (initial `Queued`, terminals `Completed` / `Escalated` / `Aborted`):
//! - Queued -> Analyzing -> Resolving -> Reviewing -> Integrating -> Completed
//! - Analyzing / Resolving / Reviewing / Integrating -> (same state) on retry
//! - Reviewing -> Resolving when the review blocks and revision rounds remain
//! - any stage -> Escalated on infeasible / permanent failure / exhausted budget / deadline
//! - any non-terminal -> Aborted on cancel, workspace failure or fault
//!
//! The table lives in [`next_state`]; nothing else decides a successor state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, waiting for admission by the scheduler.
    Queued,
    Analyzing,
    Resolving,
    Reviewing,
    Integrating,
    /// Integration request created, workspace destroyed.
    Completed,
    /// Routed to a human (not a system failure).
    Escalated,
    /// Cancelled, or stopped by an operational fault.
    Aborted,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Escalated | TaskState::Aborted
        )
    }

    /// The pipeline stage executed while in this state, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            TaskState::Analyzing => Some(Stage::Analyze),
            TaskState::Resolving => Some(Stage::Resolve),
            TaskState::Reviewing => Some(Stage::Review),
            TaskState::Integrating => Some(Stage::Integrate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Analyzing => "analyzing",
            TaskState::Resolving => "resolving",
            TaskState::Reviewing => "reviewing",
            TaskState::Integrating => "integrating",
            TaskState::Completed => "completed",
            TaskState::Escalated => "escalated",
            TaskState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four fixed pipeline stages. Each stage is served by exactly one
/// capability and guarded by that capability's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyze,
    Resolve,
    Review,
    Integrate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Analyze, Stage::Resolve, Stage::Review, Stage::Integrate];

    /// The state a task is in while this stage runs.
    pub fn state(self) -> TaskState {
        match self {
            Stage::Analyze => TaskState::Analyzing,
            Stage::Resolve => TaskState::Resolving,
            Stage::Review => TaskState::Reviewing,
            Stage::Integrate => TaskState::Integrating,
        }
    }

    /// Name of the capability serving this stage.
    pub fn capability(self) -> &'static str {
        match self {
            Stage::Analyze => "analyzer",
            Stage::Resolve => "resolver",
            Stage::Review => "reviewer",
            Stage::Integrate => "integrator",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analyze => "analyze",
            Stage::Resolve => "resolve",
            Stage::Review => "review",
            Stage::Integrate => "integrate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened, as far as the state machine is concerned.
///
/// Events carry no payload: the machine only sees outcome tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Scheduler admitted the task and a workspace was acquired.
    Admitted,
    /// Stage succeeded and its payload lets the pipeline proceed.
    Advanced,
    /// Stage succeeded but its payload stops the pipeline (infeasible, blocking review).
    Halted,
    /// Review blocked and another resolve round is allowed.
    RevisionRequested,
    /// Transient failure with retry budget left.
    RetryScheduled,
    /// Transient failure with no retry budget left.
    RetriesExhausted,
    /// Capability asserted the failure is not retriable.
    PermanentFailure,
    /// Task wall-clock deadline passed.
    DeadlineExceeded,
    /// Workspace creation failed at admission.
    WorkspaceFailed,
    /// Cancel requested.
    Cancelled,
    /// Unexpected fault (panic) inside the pipeline.
    Fault,
}

/// Illegal transition request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("no transition from {from} on {event:?}")]
    Illegal { from: TaskState, event: PipelineEvent },

    #[error("history is inconsistent at entry {index}: expected from={expected}, found {found}")]
    BrokenChain {
        index: usize,
        expected: TaskState,
        found: TaskState,
    },
}

/// The transition table.
pub fn next_state(from: TaskState, event: PipelineEvent) -> Result<TaskState, TransitionError> {
    use PipelineEvent as E;
    use TaskState as S;

    let illegal = Err(TransitionError::Illegal { from, event });
    if from.is_terminal() {
        return illegal;
    }

    let to = match (from, event) {
        (S::Queued, E::Admitted) => S::Analyzing,
        (S::Queued, E::WorkspaceFailed) => S::Aborted,

        (S::Analyzing, E::Advanced) => S::Resolving,
        (S::Resolving, E::Advanced) => S::Reviewing,
        (S::Reviewing, E::Advanced) => S::Integrating,
        (S::Integrating, E::Advanced) => S::Completed,

        (S::Reviewing, E::RevisionRequested) => S::Resolving,

        (s, E::RetryScheduled) if s.stage().is_some() => s,
        (s, E::Halted | E::RetriesExhausted | E::PermanentFailure | E::DeadlineExceeded)
            if s.stage().is_some() =>
        {
            S::Escalated
        }

        (_, E::Cancelled | E::Fault) => S::Aborted,

        _ => return illegal,
    };
    Ok(to)
}
