//! TaskStore port - タスク記録の正本（source of truth）
//!
//! 1 タスク = 1 レコード（状態 + 全履歴）、TaskId がキー。
//! 履歴を replay すると現在の状態が決定的に再構築できること（`TaskRecord::replay`）。
//!
//! # 実装
//! - **InMemoryTaskStore**: プロセス内（デフォルト）
//! - **JsonFileTaskStore**: `<dir>/<task-id>.json`（再起動をまたぐ監査用）

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{TaskId, TaskRecord, TransitionError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record for {task_id} does not replay: {source}")]
    Inconsistent {
        task_id: TaskId,
        #[source]
        source: TransitionError,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Codec {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// TaskStore はタスク記録を保存
///
/// # 設計原則
/// - 書き手は常に 1 つ（キュー上のタスクは orchestrator、実行中は自分の pipeline driver）
/// - `put` はレコード全体を置き換える（履歴は append-only なので常に前の版の拡張）
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError>;
}

/// Refuse to store a record whose history does not replay to its state.
pub(crate) fn ensure_consistent(record: &TaskRecord) -> Result<(), StoreError> {
    match record.replay() {
        Ok(state) if state == record.state => Ok(()),
        Ok(state) => Err(StoreError::Inconsistent {
            task_id: record.task_id,
            source: TransitionError::BrokenChain {
                index: record.history.len(),
                expected: state,
                found: record.state,
            },
        }),
        Err(source) => Err(StoreError::Inconsistent {
            task_id: record.task_id,
            source,
        }),
    }
}
