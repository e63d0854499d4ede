//! Task record: spec + state + append-only stage history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::TaskId;
use super::outcome::{IntegrationReference, OutcomeKind};
use super::spec::TaskSpec;
use super::state::{PipelineEvent, Stage, TaskState, TransitionError, next_state};
use super::workspace::Workspace;

/// One immutable entry of the stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub from: TaskState,
    pub to: TaskState,
    /// Stage whose outcome produced this entry (`None` for queue-side entries).
    pub stage: Option<Stage>,
    pub event: PipelineEvent,
    pub outcome: OutcomeKind,
    /// Attempt number of the stage when the entry was written (1-indexed, 0 if no call).
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl StageEntry {
    /// Operational classification of this entry, `None` for forward progress.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.event {
            PipelineEvent::Admitted | PipelineEvent::Advanced => None,
            PipelineEvent::RetryScheduled => Some(ErrorKind::Transient),
            PipelineEvent::Halted
            | PipelineEvent::RevisionRequested
            | PipelineEvent::RetriesExhausted
            | PipelineEvent::PermanentFailure
            | PipelineEvent::DeadlineExceeded
            | PipelineEvent::Cancelled => Some(ErrorKind::PermanentRecoverable),
            PipelineEvent::WorkspaceFailed | PipelineEvent::Fault => {
                Some(ErrorKind::PermanentFatal)
            }
        }
    }
}

/// A transition request: everything needed to write one history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: PipelineEvent,
    pub outcome: OutcomeKind,
    pub attempt: u32,
    pub reason: Option<String>,
}

impl Transition {
    pub fn new(event: PipelineEvent, outcome: OutcomeKind, attempt: u32) -> Self {
        Self {
            event,
            outcome,
            attempt,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResult {
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        integration: Option<IntegrationReference>,
    },
    Escalated {
        reason: String,
    },
    Aborted {
        reason: String,
    },
}

/// Metadata + history for one task.
///
/// Design:
/// - This is the single source of truth for a task's state.
/// - All state transitions happen through [`TaskRecord::admit`] and [`TaskRecord::apply`],
///   which consult the transition table.
/// - `history` is append-only; [`TaskRecord::replay`] rebuilds `state` from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub history: Vec<StageEntry>,

    /// Workspace currently (or last) leased to this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,

    /// Set once the integrator has returned a reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    pub created_at: DateTime<Utc>,

    /// Admission marker: `Queued -> Analyzing` is recorded here, not in `history`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admitted_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            spec,
            state: TaskState::Queued,
            history: Vec::new(),
            workspace: None,
            integration: None,
            result: None,
            created_at: now,
            admitted_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Queued -> Analyzing, binding the workspace lease.
    pub fn admit(&mut self, workspace: Workspace, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.state = next_state(self.state, PipelineEvent::Admitted)?;
        self.workspace = Some(workspace);
        self.admitted_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn record_integration(&mut self, reference: IntegrationReference) {
        self.integration = Some(reference);
    }

    /// Apply a transition and append its history entry.
    pub fn apply(
        &mut self,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<&StageEntry, TransitionError> {
        let from = self.state;
        let to = next_state(from, transition.event)?;

        if to.is_terminal() {
            self.result = Some(match to {
                TaskState::Completed => TaskResult::Completed {
                    integration: self.integration.clone(),
                },
                TaskState::Escalated => TaskResult::Escalated {
                    reason: transition
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("{:?}", transition.event)),
                },
                _ => TaskResult::Aborted {
                    reason: transition
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("{:?}", transition.event)),
                },
            });
        }

        self.state = to;
        self.updated_at = now;
        self.history.push(StageEntry {
            from,
            to,
            stage: from.stage(),
            event: transition.event,
            outcome: transition.outcome,
            attempt: transition.attempt,
            reason: transition.reason,
            at: now,
        });
        Ok(&self.history[self.history.len() - 1])
    }

    /// Rebuild the current state from the admission marker and the history.
    pub fn replay(&self) -> Result<TaskState, TransitionError> {
        let mut state = TaskState::Queued;
        if self.admitted_at.is_some() {
            state = next_state(state, PipelineEvent::Admitted)?;
        }
        for (index, entry) in self.history.iter().enumerate() {
            if entry.from != state {
                return Err(TransitionError::BrokenChain {
                    index,
                    expected: state,
                    found: entry.from,
                });
            }
            let to = next_state(state, entry.event)?;
            if to != entry.to {
                return Err(TransitionError::BrokenChain {
                    index,
                    expected: to,
                    found: entry.to,
                });
            }
            state = to;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{LeaseId, TaskId};
    use crate::domain::spec::SourceRef;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskSpec::new(SourceRef::new("acme/widgets", 7), "panic in parser"),
            Utc::now(),
        )
    }

    fn workspace(task_id: TaskId) -> Workspace {
        Workspace {
            lease_id: LeaseId::from_ulid(Ulid::new()),
            task_id,
            root: "/tmp/ws".into(),
            branch: "fixflow/x-a1".to_string(),
            base_ref: "HEAD".to_string(),
            attempt: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn new_record_starts_queued_with_empty_history() {
        let r = record();
        assert_eq!(r.state, TaskState::Queued);
        assert!(r.history.is_empty());
        assert_eq!(r.replay(), Ok(TaskState::Queued));
    }

    #[test]
    fn admission_is_a_marker_not_an_entry() {
        let mut r = record();
        let ws = workspace(r.task_id);
        r.admit(ws, Utc::now()).unwrap();
        assert_eq!(r.state, TaskState::Analyzing);
        assert!(r.history.is_empty());
        assert_eq!(r.replay(), Ok(TaskState::Analyzing));
    }

    #[test]
    fn apply_appends_entries_and_replay_matches() {
        let mut r = record();
        r.admit(workspace(r.task_id), Utc::now()).unwrap();

        r.apply(
            Transition::new(PipelineEvent::Advanced, OutcomeKind::Success, 1),
            Utc::now(),
        )
        .unwrap();
        r.apply(
            Transition::new(PipelineEvent::RetryScheduled, OutcomeKind::TransientFailure, 1)
                .with_reason("rate limited"),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(r.state, TaskState::Resolving);
        assert_eq!(r.history.len(), 2);
        assert_eq!(r.history[1].from, TaskState::Resolving);
        assert_eq!(r.history[1].stage, Some(Stage::Resolve));
        assert_eq!(r.history[1].error_kind(), Some(ErrorKind::Transient));
        assert_eq!(r.replay(), Ok(r.state));
    }

    #[test]
    fn terminal_transition_sets_result_and_blocks_further_transitions() {
        let mut r = record();
        r.admit(workspace(r.task_id), Utc::now()).unwrap();
        r.apply(
            Transition::new(PipelineEvent::Halted, OutcomeKind::Success, 1)
                .with_reason("infeasible: duplicate"),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(
            r.result,
            Some(TaskResult::Escalated {
                reason: "infeasible: duplicate".to_string()
            })
        );
        let before = r.history.len();
        let err = r
            .apply(
                Transition::new(PipelineEvent::Cancelled, OutcomeKind::Cancelled, 0),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { .. }));
        assert_eq!(r.history.len(), before);
    }

    #[test]
    fn replay_detects_tampered_history() {
        let mut r = record();
        r.admit(workspace(r.task_id), Utc::now()).unwrap();
        r.apply(
            Transition::new(PipelineEvent::Advanced, OutcomeKind::Success, 1),
            Utc::now(),
        )
        .unwrap();
        r.history[0].to = TaskState::Integrating;
        assert!(matches!(
            r.replay(),
            Err(TransitionError::BrokenChain { index: 0, .. })
        ));
    }

    #[test]
    fn record_survives_json_roundtrip() {
        let mut r = record();
        r.admit(workspace(r.task_id), Utc::now()).unwrap();
        let s = serde_json::to_string(&r).unwrap();
        let back: TaskRecord = serde_json::from_str(&s).unwrap();
        assert_eq!(back, r);
    }
}
