//! WorkspaceManager - タスクごとの隔離ワークスペース
//!
//! lease table と同時オープン数の上限だけを管理し、ツリー操作は
//! [`WorkspaceBackend`] に委譲します。
//!
//! # 設計原則
//! - `acquire` はブロックしない: 上限に達していれば即 `ResourceExhausted`
//! - 上限は厳密: スロットは backend 呼び出しの前に lock の中で予約する
//! - 1 タスク = 最大 1 lease
//! - 作成失敗はリトライしない（名前の衝突だけは attempt を進めて再試行）
//! - `release` は冪等で、決してエラーを返さない

pub mod naming;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, info, warn};

use crate::domain::{Disposition, TaskId, Workspace};
use crate::ports::{BackendError, Clock, IdGenerator, WorkspaceBackend, WorkspaceRequest};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace limit reached ({open}/{max} open)")]
    ResourceExhausted { open: usize, max: usize },

    #[error("task {0} already holds a workspace")]
    AlreadyLeased(TaskId),

    #[error("failed to create workspace for {task_id}: {source}")]
    CreationFailed {
        task_id: TaskId,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The lease was already released (or never existed). Not an error.
    NotLeased,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSettings {
    /// Maximum concurrently open workspaces.
    pub max_open: usize,
    pub branch_prefix: String,
    pub base_ref: String,
    /// How many names to try when the backend reports collisions.
    pub max_name_attempts: u32,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            max_open: 4,
            branch_prefix: "fixflow".to_string(),
            base_ref: "HEAD".to_string(),
            max_name_attempts: 16,
        }
    }
}

#[derive(Debug)]
enum Slot {
    /// Counted against the cap while the backend creates the tree.
    Reserved,
    Leased(Workspace),
    /// Counted against the cap until the backend has destroyed the tree.
    Releasing,
}

#[derive(Debug, Default)]
struct LeaseTable {
    slots: HashMap<TaskId, Slot>,
    /// Last naming attempt per task, dropped with the task's slot.
    attempts: HashMap<TaskId, u32>,
}

impl LeaseTable {
    fn forget(&mut self, task_id: TaskId) {
        self.slots.remove(&task_id);
        self.attempts.remove(&task_id);
    }
}

pub struct WorkspaceManager {
    backend: Arc<dyn WorkspaceBackend>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    settings: WorkspaceSettings,
    table: Mutex<LeaseTable>,
    released: Notify,
}

impl WorkspaceManager {
    pub fn new(
        backend: Arc<dyn WorkspaceBackend>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        settings: WorkspaceSettings,
    ) -> Self {
        Self {
            backend,
            ids,
            clock,
            settings,
            table: Mutex::new(LeaseTable::default()),
            released: Notify::new(),
        }
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    /// Workspaces currently counted against the cap.
    pub fn open_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn lease_of(&self, task_id: TaskId) -> Option<Workspace> {
        match self.lock().slots.get(&task_id) {
            Some(Slot::Leased(ws)) => Some(ws.clone()),
            _ => None,
        }
    }

    /// Resolves after the next release frees a slot.
    ///
    /// Call [`Notified::enable`] before retrying `acquire` to not miss a
    /// release that lands in between.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub async fn acquire(&self, task_id: TaskId) -> Result<Workspace, WorkspaceError> {
        let reservation = self.reserve(task_id)?;

        let mut last_error = None;
        for _ in 0..self.settings.max_name_attempts.max(1) {
            let attempt = self.next_attempt(task_id);
            let request = WorkspaceRequest {
                task_id,
                branch: naming::branch_name(&self.settings.branch_prefix, task_id, attempt),
                dir_name: naming::dir_name(task_id, attempt),
                base_ref: self.settings.base_ref.clone(),
            };

            match self.backend.create(&request).await {
                Ok(root) => {
                    let workspace = Workspace {
                        lease_id: self.ids.generate_lease_id(),
                        task_id,
                        root,
                        branch: request.branch,
                        base_ref: request.base_ref,
                        attempt,
                        created_at: self.clock.now(),
                    };
                    reservation.commit(workspace.clone());
                    info!(
                        task_id = %task_id,
                        branch = %workspace.branch,
                        root = %workspace.root.display(),
                        "workspace acquired"
                    );
                    return Ok(workspace);
                }
                Err(BackendError::AlreadyExists(name)) => {
                    debug!(task_id = %task_id, name = %name, "workspace name taken, trying next attempt");
                    last_error = Some(BackendError::AlreadyExists(name));
                }
                Err(source) => {
                    return Err(WorkspaceError::CreationFailed { task_id, source });
                }
            }
        }

        Err(WorkspaceError::CreationFailed {
            task_id,
            source: last_error.unwrap_or_else(|| {
                BackendError::AlreadyExists(naming::dir_name(task_id, 0))
            }),
        })
    }

    /// Release a lease. Idempotent: a second release, or a release of a lease
    /// that is not current, is a silent no-op.
    pub async fn release(&self, workspace: &Workspace, disposition: Disposition) -> ReleaseOutcome {
        {
            let mut table = self.lock();
            match table.slots.get(&workspace.task_id) {
                Some(Slot::Leased(current)) if current.lease_id == workspace.lease_id => {
                    table.slots.insert(workspace.task_id, Slot::Releasing);
                }
                _ => {
                    debug!(
                        task_id = %workspace.task_id,
                        lease_id = %workspace.lease_id,
                        "release of a workspace that is not leased, ignoring"
                    );
                    return ReleaseOutcome::NotLeased;
                }
            }
        }

        if disposition == Disposition::Destroy {
            if let Err(err) = self.backend.destroy(workspace).await {
                warn!(
                    task_id = %workspace.task_id,
                    root = %workspace.root.display(),
                    error = %err,
                    "workspace cleanup failed, leaving it behind"
                );
            }
        }

        self.lock().forget(workspace.task_id);
        self.released.notify_waiters();
        info!(
            task_id = %workspace.task_id,
            branch = %workspace.branch,
            disposition = ?disposition,
            "workspace released"
        );
        ReleaseOutcome::Released
    }

    fn reserve(&self, task_id: TaskId) -> Result<Reservation<'_>, WorkspaceError> {
        let mut table = self.lock();
        if table.slots.contains_key(&task_id) {
            return Err(WorkspaceError::AlreadyLeased(task_id));
        }
        let open = table.slots.len();
        if open >= self.settings.max_open {
            return Err(WorkspaceError::ResourceExhausted {
                open,
                max: self.settings.max_open,
            });
        }
        table.slots.insert(task_id, Slot::Reserved);
        Ok(Reservation {
            manager: self,
            task_id,
            committed: false,
        })
    }

    fn next_attempt(&self, task_id: TaskId) -> u32 {
        let mut table = self.lock();
        let attempt = table.attempts.entry(task_id).or_insert(0);
        *attempt += 1;
        *attempt
    }

    #[cfg(test)]
    fn tracked_tasks(&self) -> usize {
        self.lock().attempts.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LeaseTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved slot. Dropped without `commit` (creation failed, or the
/// acquiring future was cancelled) it frees the slot again.
struct Reservation<'a> {
    manager: &'a WorkspaceManager,
    task_id: TaskId,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, workspace: Workspace) {
        self.committed = true;
        self.manager
            .lock()
            .slots
            .insert(self.task_id, Slot::Leased(workspace));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut table = self.manager.lock();
        if matches!(table.slots.get(&self.task_id), Some(Slot::Reserved)) {
            table.forget(self.task_id);
        }
        drop(table);
        self.manager.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    #[derive(Default)]
    struct FakeBackend {
        taken: Mutex<HashSet<String>>,
        fail_with_io: bool,
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl WorkspaceBackend for FakeBackend {
        async fn create(&self, request: &WorkspaceRequest) -> Result<PathBuf, BackendError> {
            if self.fail_with_io {
                return Err(BackendError::io(
                    "create worktree",
                    std::io::Error::other("disk full"),
                ));
            }
            let mut taken = self.taken.lock().unwrap();
            if !taken.insert(request.branch.clone()) {
                return Err(BackendError::AlreadyExists(request.branch.clone()));
            }
            Ok(PathBuf::from("/ws").join(&request.dir_name))
        }

        async fn destroy(&self, workspace: &Workspace) -> Result<(), BackendError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            self.taken.lock().unwrap().remove(&workspace.branch);
            Ok(())
        }
    }

    fn manager(backend: Arc<FakeBackend>, max_open: usize) -> WorkspaceManager {
        let clock = Arc::new(SystemClock);
        WorkspaceManager::new(
            backend,
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            WorkspaceSettings {
                max_open,
                ..WorkspaceSettings::default()
            },
        )
    }

    fn task() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn acquire_fails_fast_at_the_cap() {
        let mgr = manager(Arc::new(FakeBackend::default()), 2);
        let a = mgr.acquire(task()).await.unwrap();
        let _b = mgr.acquire(task()).await.unwrap();

        let err = mgr.acquire(task()).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::ResourceExhausted { open: 2, max: 2 }));

        mgr.release(&a, Disposition::Destroy).await;
        assert!(mgr.acquire(task()).await.is_ok());
    }

    #[tokio::test]
    async fn at_most_one_lease_per_task() {
        let mgr = manager(Arc::new(FakeBackend::default()), 4);
        let id = task();
        mgr.acquire(id).await.unwrap();
        assert!(matches!(
            mgr.acquire(id).await.unwrap_err(),
            WorkspaceError::AlreadyLeased(t) if t == id
        ));
        assert_eq!(mgr.open_count(), 1);
    }

    #[tokio::test]
    async fn abandoned_names_bump_the_attempt() {
        let backend = Arc::new(FakeBackend::default());
        let id = task();
        let prefix = WorkspaceSettings::default().branch_prefix;
        backend
            .taken
            .lock()
            .unwrap()
            .insert(naming::branch_name(&prefix, id, 1));

        let mgr = manager(backend, 1);
        let ws = mgr.acquire(id).await.unwrap();
        assert_eq!(ws.attempt, 2);
        assert!(ws.branch.ends_with("-a2"));
    }

    #[tokio::test]
    async fn creation_failure_is_not_retried_and_frees_the_slot() {
        let backend = Arc::new(FakeBackend {
            fail_with_io: true,
            ..FakeBackend::default()
        });
        let mgr = manager(backend, 1);
        let err = mgr.acquire(task()).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::CreationFailed {
                source: BackendError::Io { .. },
                ..
            }
        ));
        assert_eq!(mgr.open_count(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_isolated() {
        let backend = Arc::new(FakeBackend::default());
        let mgr = manager(backend.clone(), 4);
        let a = mgr.acquire(task()).await.unwrap();
        let b = mgr.acquire(task()).await.unwrap();

        assert_eq!(mgr.release(&a, Disposition::Destroy).await, ReleaseOutcome::Released);
        assert_eq!(mgr.release(&a, Disposition::Destroy).await, ReleaseOutcome::NotLeased);
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);

        assert_eq!(mgr.lease_of(b.task_id), Some(b.clone()));
        assert_eq!(mgr.open_count(), 1);
    }

    #[tokio::test]
    async fn keep_disposition_leaves_the_tree() {
        let backend = Arc::new(FakeBackend::default());
        let mgr = manager(backend.clone(), 4);
        let ws = mgr.acquire(task()).await.unwrap();
        mgr.release(&ws, Disposition::Keep).await;
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.open_count(), 0);
    }

    #[tokio::test]
    async fn lease_table_empties_after_many_tasks() {
        let mgr = manager(Arc::new(FakeBackend::default()), 2);
        for round in 0..50 {
            let ws = mgr.acquire(task()).await.unwrap();
            let disposition = if round % 2 == 0 {
                Disposition::Destroy
            } else {
                Disposition::Keep
            };
            mgr.release(&ws, disposition).await;
        }
        assert_eq!(mgr.open_count(), 0);
        assert_eq!(mgr.tracked_tasks(), 0);

        let failing = manager(
            Arc::new(FakeBackend {
                fail_with_io: true,
                ..FakeBackend::default()
            }),
            2,
        );
        for _ in 0..10 {
            assert!(failing.acquire(task()).await.is_err());
        }
        assert_eq!(failing.open_count(), 0);
        assert_eq!(failing.tracked_tasks(), 0);
    }

    #[tokio::test]
    async fn cap_is_exact_under_concurrency() {
        let mgr = Arc::new(manager(Arc::new(FakeBackend::default()), 3));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.acquire(task()).await })
            })
            .collect();

        let mut ok = 0;
        let mut exhausted = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(WorkspaceError::ResourceExhausted { .. }) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 3);
        assert_eq!(exhausted, 7);
    }
}
