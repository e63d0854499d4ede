//! Status - タスクの状態と履歴のビュー
//!
//! `status()` は常に完全な履歴（リトライを含む）と最終状態の理由を返します。
//! ワークスペースを覗かなくても escalated / aborted の経緯が追えること。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    IntegrationReference, SourceRef, StageEntry, TaskId, TaskRecord, TaskResult, TaskState,
    Workspace,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub source: SourceRef,
    pub title: String,
    pub state: TaskState,
    pub history: Vec<StageEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Reason of the terminal state, if terminal.
    pub fn reason(&self) -> Option<&str> {
        match self.result.as_ref()? {
            TaskResult::Completed { .. } => None,
            TaskResult::Escalated { reason } | TaskResult::Aborted { reason } => Some(reason),
        }
    }

    /// Number of history entries written from `state`.
    pub fn entries_from(&self, state: TaskState) -> usize {
        self.history.iter().filter(|e| e.from == state).count()
    }
}

impl From<TaskRecord> for TaskStatus {
    fn from(record: TaskRecord) -> Self {
        Self {
            task_id: record.task_id,
            source: record.spec.source,
            title: record.spec.title,
            state: record.state,
            history: record.history,
            workspace: record.workspace,
            integration: record.integration,
            result: record.result,
            created_at: record.created_at,
            admitted_at: record.admitted_at,
            updated_at: record.updated_at,
        }
    }
}

/// Task counts by state group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    /// Admitted and not yet terminal.
    pub running: usize,
    pub completed: usize,
    pub escalated: usize,
    pub aborted: usize,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Queued => self.queued += 1,
            TaskState::Analyzing
            | TaskState::Resolving
            | TaskState::Reviewing
            | TaskState::Integrating => self.running += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Escalated => self.escalated += 1,
            TaskState::Aborted => self.aborted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.escalated + self.aborted
    }
}

impl FromIterator<TaskState> for TaskCounts {
    fn from_iter<I: IntoIterator<Item = TaskState>>(iter: I) -> Self {
        let mut counts = TaskCounts::default();
        for state in iter {
            counts.add(state);
        }
        counts
    }
}
