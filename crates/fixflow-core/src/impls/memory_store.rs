//! InMemoryTaskStore - プロセス内のタスク記録
//!
//! HashMap<TaskId, TaskRecord> を tokio Mutex で守るだけの実装です。
//! put のたびに replay 整合性を検査します。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{TaskId, TaskRecord};
use crate::ports::task_store::{StoreError, TaskStore, ensure_consistent};

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError> {
        ensure_consistent(record)?;
        self.records
            .lock()
            .await
            .insert(record.task_id, record.clone());
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.lock().await.get(&task_id).cloned())
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.task_id);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SourceRef, TaskSpec, TaskState};
    use chrono::Utc;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskSpec::new(SourceRef::new("acme/api", 12), "timeout on login"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = InMemoryTaskStore::new();
        let r = record();
        store.put(&r).await.unwrap();
        assert_eq!(store.get(r.task_id).await.unwrap(), Some(r));
        assert!(store.get(TaskId::from_ulid(Ulid::new())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_records_that_do_not_replay() {
        let store = InMemoryTaskStore::new();
        let mut r = record();
        r.state = TaskState::Reviewing;
        let err = store.put(&r).await.unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent { .. }));
        assert!(store.list().await.unwrap().is_empty());
    }
}
