//! WorkflowOrchestrator - タスクの受付・状態遷移・終了の管理
//!
//! # 責務
//! - `submit` / `status` / `cancel` / `wait`: 外部（ingestion 層）向けの API
//! - `admit`: scheduler から呼ばれ、workspace を取得して pipeline を起動する
//! - すべての遷移を「履歴に追記 → 永続化 → イベント送信」の順で 1 か所で行う
//!
//! # 書き手は常に 1 つ
//! - キュー上のタスク: orchestrator（cancel と admit は queue からの remove/pop で排他）
//! - 実行中のタスク: そのタスクの pipeline driver
//! - driver が panic した後: supervisor

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::Config;
use super::pipeline;
use super::scheduler::{AdmissionQueue, SchedulerHandle, TaskScheduler};
use super::status::{TaskCounts, TaskStatus};
use crate::domain::{
    Decider, Disposition, ErrorKind, OrchestratorError, OutcomeKind, PipelineEvent, StageEntry,
    TaskId, TaskRecord, TaskSpec, TaskState, Transition, TransitionRecord, Workspace,
};
use crate::ports::{
    Analyzer, Clock, EventSink, IdGenerator, Integrator, MetricsSink, Resolver, Reviewer,
    TaskStore,
};
use crate::recovery::{BreakerSet, CircuitSnapshot};
use crate::workspace::{WorkspaceError, WorkspaceManager};

/// The four capability implementations.
#[derive(Clone)]
pub struct Capabilities {
    pub analyzer: Arc<dyn Analyzer>,
    pub resolver: Arc<dyn Resolver>,
    pub reviewer: Arc<dyn Reviewer>,
    pub integrator: Arc<dyn Integrator>,
}

/// Answer to `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAck {
    pub task_id: TaskId,
    pub submitted_at: DateTime<Utc>,
    /// Tasks waiting for admission, this one included.
    pub queue_depth: usize,
}

/// Answer to `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The task had not started and is now `Aborted`.
    Aborted,
    /// The task is running; it aborts once its in-flight call returns.
    Requested,
    /// Nothing to cancel.
    AlreadyTerminal(TaskState),
}

/// What `admit` did with a queued task.
#[derive(Debug)]
pub enum AdmitOutcome {
    /// A pipeline is running; the handle resolves to its terminal state.
    Started(tokio::task::JoinHandle<TaskState>),
    /// Workspace limit reached. The task is still `Queued`.
    Backpressure,
    /// The task reached a terminal state without running (cancelled, workspace failure).
    Finished(TaskState),
}

struct TaskHandle {
    cancel: CancellationToken,
    state: watch::Sender<TaskState>,
}

impl TaskHandle {
    fn new(state: TaskState) -> Self {
        Self {
            cancel: CancellationToken::new(),
            state: watch::Sender::new(state),
        }
    }
}

pub(super) struct OrchestratorParts {
    pub config: Config,
    pub capabilities: Capabilities,
    pub workspaces: WorkspaceManager,
    pub store: Arc<dyn TaskStore>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<dyn MetricsSink>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub decider: Arc<dyn Decider>,
}

/// One instance per process, built by [`OrchestratorBuilder`](super::OrchestratorBuilder)
/// and shared as `Arc` with the scheduler.
pub struct WorkflowOrchestrator {
    config: Config,
    capabilities: Capabilities,
    breakers: BreakerSet,
    workspaces: WorkspaceManager,
    store: Arc<dyn TaskStore>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    queue: Arc<AdmissionQueue>,
    tasks: Mutex<HashMap<TaskId, TaskHandle>>,
}

impl WorkflowOrchestrator {
    pub(super) fn from_parts(parts: OrchestratorParts) -> Self {
        Self {
            breakers: BreakerSet::new(parts.config.breaker_settings()),
            config: parts.config,
            capabilities: parts.capabilities,
            workspaces: parts.workspaces,
            store: parts.store,
            events: parts.events,
            metrics: parts.metrics,
            clock: parts.clock,
            ids: parts.ids,
            decider: parts.decider,
            queue: Arc::new(AdmissionQueue::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn breakers(&self) -> &BreakerSet {
        &self.breakers
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots()
    }

    pub fn admission_queue(&self) -> Arc<AdmissionQueue> {
        Arc::clone(&self.queue)
    }

    pub(crate) fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn decider(&self) -> &dyn Decider {
        self.decider.as_ref()
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Start admitting queued tasks.
    pub fn start_scheduler(self: &Arc<Self>) -> SchedulerHandle {
        TaskScheduler::spawn(Arc::clone(self))
    }

    // ========================================
    // External API
    // ========================================

    /// Record a new task as `Queued` and put it in the admission queue.
    pub async fn submit(&self, spec: TaskSpec) -> Result<SubmitAck, OrchestratorError> {
        let task_id = self.ids.generate_task_id();
        let now = self.clock.now();
        let priority = spec.effective_priority();
        let record = TaskRecord::new(task_id, spec, now);
        self.store.put(&record).await?;

        self.lock_tasks()
            .insert(task_id, TaskHandle::new(TaskState::Queued));
        self.queue.push(task_id, priority);
        self.metrics.increment("tasks_submitted", &[]);
        info!(
            task_id = %task_id,
            source = %record.spec.source,
            priority = ?priority,
            "task submitted"
        );

        Ok(SubmitAck {
            task_id,
            submitted_at: now,
            queue_depth: self.queue.len(),
        })
    }

    /// Current state and full history.
    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatus, OrchestratorError> {
        self.store
            .get(task_id)
            .await?
            .map(TaskStatus::from)
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    pub async fn list(&self) -> Result<Vec<TaskStatus>, OrchestratorError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(TaskStatus::from)
            .collect())
    }

    pub async fn counts(&self) -> Result<TaskCounts, OrchestratorError> {
        Ok(self.store.list().await?.into_iter().map(|r| r.state).collect())
    }

    /// Best-effort abort.
    ///
    /// A queued task is aborted on the spot. A running task has its
    /// cancellation token fired; its pipeline writes the `Aborted` entry after
    /// the in-flight capability call returns, then releases the workspace.
    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelAck, OrchestratorError> {
        let token = self.lock_tasks().get(&task_id).map(|h| h.cancel.clone());

        let Some(token) = token else {
            let mut record = self.load(task_id).await?;
            if record.is_terminal() {
                return Ok(CancelAck::AlreadyTerminal(record.state));
            }
            // Not driven by this process (e.g. left over from a previous run).
            self.transition(&mut record, cancelled("cancelled while not running", 0))
                .await?;
            return Ok(CancelAck::Aborted);
        };

        token.cancel();
        info!(task_id = %task_id, "cancel requested");

        if self.queue.remove(task_id) {
            let mut record = self.load(task_id).await?;
            self.transition(&mut record, cancelled("cancelled while queued", 0))
                .await?;
            return Ok(CancelAck::Aborted);
        }
        Ok(CancelAck::Requested)
    }

    /// Resolves once the task is terminal.
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskStatus, OrchestratorError> {
        let rx = self.lock_tasks().get(&task_id).map(|h| h.state.subscribe());
        if let Some(mut rx) = rx {
            // Err means the handle was dropped, which only happens on terminal states.
            let _ = rx.wait_for(|state| state.is_terminal()).await;
        }
        self.status(task_id).await
    }

    // ========================================
    // Scheduler-facing
    // ========================================

    /// Queued -> Analyzing: acquire a workspace and start the pipeline.
    pub async fn admit(self: &Arc<Self>, task_id: TaskId) -> Result<AdmitOutcome, OrchestratorError> {
        let mut record = self.load(task_id).await?;
        if record.is_terminal() {
            return Ok(AdmitOutcome::Finished(record.state));
        }
        if record.state != TaskState::Queued {
            return Err(OrchestratorError::UnexpectedState {
                task_id,
                state: record.state,
                expected: TaskState::Queued,
            });
        }

        let cancel = self.cancel_token(task_id);
        if cancel.is_cancelled() {
            let state = self
                .transition(&mut record, cancelled("cancelled before admission", 0))
                .await?;
            return Ok(AdmitOutcome::Finished(state));
        }

        let workspace = match self.workspaces.acquire(task_id).await {
            Ok(workspace) => workspace,
            Err(WorkspaceError::ResourceExhausted { .. }) => {
                self.metrics.increment("admission_backpressure", &[]);
                return Ok(AdmitOutcome::Backpressure);
            }
            Err(WorkspaceError::CreationFailed { source, .. }) => {
                self.metrics.increment("workspace_failures", &[]);
                let transition = Transition::new(
                    PipelineEvent::WorkspaceFailed,
                    OutcomeKind::PermanentFailure,
                    0,
                )
                .with_reason(format!("workspace creation failed: {source}"));
                let state = self.transition(&mut record, transition).await?;
                return Ok(AdmitOutcome::Finished(state));
            }
            Err(err) => return Err(err.into()),
        };

        let now = self.clock.now();
        let admitted = match record.admit(workspace.clone(), now) {
            Ok(()) => {
                self.commit(&record, TransitionRecord::admission(task_id, now))
                    .await
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = admitted {
            self.workspaces.release(&workspace, Disposition::Keep).await;
            return Err(err);
        }

        self.metrics.increment("tasks_admitted", &[]);
        info!(
            task_id = %task_id,
            branch = %workspace.branch,
            "task admitted"
        );
        Ok(AdmitOutcome::Started(pipeline::spawn(
            Arc::clone(self),
            record,
            workspace,
            cancel,
        )))
    }

    // ========================================
    // Transition plumbing
    // ========================================

    /// Apply a transition, then persist, emit, and publish it.
    pub(crate) async fn transition(
        &self,
        record: &mut TaskRecord,
        transition: Transition,
    ) -> Result<TaskState, OrchestratorError> {
        let entry = record.apply(transition, self.clock.now())?.clone();
        log_entry(record.task_id, &entry);
        self.commit(record, TransitionRecord::from_entry(record.task_id, &entry))
            .await?;
        Ok(record.state)
    }

    async fn commit(
        &self,
        record: &TaskRecord,
        event: TransitionRecord,
    ) -> Result<(), OrchestratorError> {
        self.store.put(record).await?;
        self.events.emit(&event);
        if record.is_terminal() {
            self.metrics
                .increment("tasks_finished", &[("state", record.state.as_str())]);
            if let Ok(elapsed) = (record.updated_at - record.created_at).to_std() {
                self.metrics
                    .record_duration("task_duration", &[("state", record.state.as_str())], elapsed);
            }
        }
        self.publish(record.task_id, record.state);
        Ok(())
    }

    /// Terminate a task whose pipeline died (panic or unrecoverable error).
    ///
    /// Reloads the persisted record, so whatever the driver had in memory
    /// but could not persist is dropped. Releases the workspace (kept for
    /// inspection); a no-op if the driver already released it.
    pub(crate) async fn record_fault(
        &self,
        task_id: TaskId,
        workspace: &Workspace,
        reason: String,
    ) -> TaskState {
        error!(task_id = %task_id, reason = %reason, "pipeline fault");

        let state = match self.store.get(task_id).await {
            Ok(Some(mut record)) if !record.is_terminal() => {
                let attempt = record.history.last().map_or(0, |e| e.attempt);
                let transition = Transition::new(PipelineEvent::Fault, OutcomeKind::Fault, attempt)
                    .with_reason(format!("fault: {reason}"));
                match self.transition(&mut record, transition).await {
                    Ok(state) => state,
                    Err(err) => {
                        error!(task_id = %task_id, error = %err, "could not record fault");
                        TaskState::Aborted
                    }
                }
            }
            Ok(Some(record)) => record.state,
            Ok(None) => TaskState::Aborted,
            Err(err) => {
                error!(task_id = %task_id, error = %err, "could not reload faulted task");
                TaskState::Aborted
            }
        };

        self.workspaces.release(workspace, Disposition::Keep).await;
        self.publish(task_id, state);
        state
    }

    async fn load(&self, task_id: TaskId) -> Result<TaskRecord, OrchestratorError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    fn cancel_token(&self, task_id: TaskId) -> CancellationToken {
        self.lock_tasks()
            .entry(task_id)
            .or_insert_with(|| TaskHandle::new(TaskState::Queued))
            .cancel
            .clone()
    }

    fn publish(&self, task_id: TaskId, state: TaskState) {
        let mut tasks = self.lock_tasks();
        if let Some(handle) = tasks.get(&task_id) {
            handle.state.send_replace(state);
        }
        if state.is_terminal() {
            tasks.remove(&task_id);
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cancelled(reason: &str, attempt: u32) -> Transition {
    Transition::new(PipelineEvent::Cancelled, OutcomeKind::Cancelled, attempt).with_reason(reason)
}

fn log_entry(task_id: TaskId, entry: &StageEntry) {
    let reason = entry.reason.as_deref().unwrap_or("");
    match entry.error_kind() {
        None => info!(
            task_id = %task_id,
            from = %entry.from,
            to = %entry.to,
            attempt = entry.attempt,
            "stage advanced"
        ),
        Some(ErrorKind::Transient) => info!(
            task_id = %task_id,
            state = %entry.from,
            attempt = entry.attempt,
            reason,
            "retry scheduled"
        ),
        Some(ErrorKind::PermanentRecoverable) if entry.to == TaskState::Resolving => info!(
            task_id = %task_id,
            attempt = entry.attempt,
            reason,
            "revision requested"
        ),
        Some(ErrorKind::PermanentRecoverable) if entry.to == TaskState::Aborted => warn!(
            task_id = %task_id,
            from = %entry.from,
            reason,
            "task aborted"
        ),
        Some(ErrorKind::PermanentRecoverable) => warn!(
            task_id = %task_id,
            from = %entry.from,
            to = %entry.to,
            event = ?entry.event,
            reason,
            "task escalated"
        ),
        Some(ErrorKind::PermanentFatal) => error!(
            task_id = %task_id,
            from = %entry.from,
            to = %entry.to,
            event = ?entry.event,
            reason,
            "task aborted by operational fault"
        ),
    }
}
