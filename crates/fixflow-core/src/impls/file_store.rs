//! JsonFileTaskStore - `<dir>/<task-id>.json` per task.
//!
//! Records are written atomically (temp file + rename), so a crash mid-write
//! leaves the previous version in place. A record that does not replay is
//! never written.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::domain::{TaskId, TaskRecord};
use crate::ports::task_store::{StoreError, TaskStore, ensure_consistent};

#[derive(Debug, Clone)]
pub struct JsonFileTaskStore {
    dir: PathBuf,
}

impl JsonFileTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    async fn read(&self, path: &Path) -> Result<TaskRecord, StoreError> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|source| io_error(format!("read {}", path.display()), source))?;
        serde_json::from_str(&contents).map_err(|source| StoreError::Codec {
            context: format!("parse {}", path.display()),
            source,
        })
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError> {
        ensure_consistent(record)?;

        let path = self.path_for(record.task_id);
        debug!(path = %path.display(), state = %record.state, "writing task record");

        let mut buf = serde_json::to_string_pretty(record).map_err(|source| StoreError::Codec {
            context: format!("serialize {}", record.task_id),
            source,
        })?;
        buf.push('\n');

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| io_error(format!("create directory {}", self.dir.display()), source))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .await
            .map_err(|source| io_error(format!("write temp record {}", tmp_path.display()), source))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| io_error(format!("replace record {}", path.display()), source))?;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let path = self.path_for(task_id);
        match fs::try_exists(&path).await {
            Ok(true) => self.read(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(source) => Err(io_error(format!("stat {}", path.display()), source)),
        }
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(io_error(format!("list {}", self.dir.display()), source));
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(format!("list {}", self.dir.display()), source))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                records.push(self.read(&path).await?);
            }
        }
        records.sort_by_key(|r| r.task_id);
        Ok(records)
    }
}

fn io_error(context: String, source: std::io::Error) -> StoreError {
    StoreError::Io { context, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        LeaseId, OutcomeKind, PipelineEvent, SourceRef, TaskSpec, TaskState, Transition,
        Workspace,
    };
    use chrono::Utc;
    use ulid::Ulid;

    fn admitted_record() -> TaskRecord {
        let task_id = TaskId::from_ulid(Ulid::new());
        let mut record = TaskRecord::new(
            task_id,
            TaskSpec::new(SourceRef::new("acme/cli", 3), "flag ignored"),
            Utc::now(),
        );
        record
            .admit(
                Workspace {
                    lease_id: LeaseId::from_ulid(Ulid::new()),
                    task_id,
                    root: "/tmp/ws".into(),
                    branch: "fixflow/t-a1".to_string(),
                    base_ref: "HEAD".to_string(),
                    attempt: 1,
                    created_at: Utc::now(),
                },
                Utc::now(),
            )
            .unwrap();
        record
            .apply(
                Transition::new(PipelineEvent::Advanced, OutcomeKind::Success, 1),
                Utc::now(),
            )
            .unwrap();
        record
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileTaskStore::new(temp.path().join("tasks"));
        let record = admitted_record();

        store.put(&record).await.expect("put");
        let loaded = store.get(record.task_id).await.expect("get").expect("present");
        assert_eq!(loaded, record);
        assert_eq!(loaded.replay(), Ok(TaskState::Resolving));
        assert!(!store.dir().join(format!("{}.json.tmp", record.task_id)).exists());
    }

    #[tokio::test]
    async fn missing_dir_lists_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileTaskStore::new(temp.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.get(TaskId::from_ulid(Ulid::new())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_every_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileTaskStore::new(temp.path());
        let a = admitted_record();
        let b = admitted_record();
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.task_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.task_id) && ids.contains(&b.task_id));
    }
}
