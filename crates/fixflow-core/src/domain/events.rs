//! Events - 遷移イベント
//!
//! EventSink に流すレコード。履歴エントリと違い、admission（Queued -> Analyzing）も含みます。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::{PipelineEvent, TaskState};
use super::task::StageEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
    pub event: PipelineEvent,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransitionRecord {
    pub fn from_entry(task_id: TaskId, entry: &StageEntry) -> Self {
        Self {
            task_id,
            from: entry.from,
            to: entry.to,
            event: entry.event,
            at: entry.at,
            reason: entry.reason.clone(),
        }
    }

    pub fn admission(task_id: TaskId, at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            from: TaskState::Queued,
            to: TaskState::Analyzing,
            event: PipelineEvent::Admitted,
            at,
            reason: None,
        }
    }
}
