//! Errors - エラー型と分類
//!
//! Capability failures are never Rust errors: they travel as `StageResult`
//! values and end up classified in the stage history with [`ErrorKind`].
//! The error enums here are for the orchestrator's own API.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::state::{TaskState, TransitionError};
use crate::ports::task_store::StoreError;
use crate::workspace::WorkspaceError;

/// ErrorKind は失敗の運用分類
///
/// - Transient: 一時的なエラー（RetryPolicy に従ってリトライ）
/// - PermanentRecoverable: 人間に回す（Escalated、システム障害ではない）
/// - PermanentFatal: 運用障害（Aborted、リトライなし）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    PermanentRecoverable,
    PermanentFatal,
}

/// Errors returned by `WorkflowOrchestrator` operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} is {state}, expected {expected}")]
    UnexpectedState {
        task_id: TaskId,
        state: TaskState,
        expected: TaskState,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}
