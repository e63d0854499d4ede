//! TaskScheduler - admission の流量制御
//!
//! # フロー
//! 1. concurrency permit（Semaphore）を取る
//! 2. AdmissionQueue から 1 件 pop（priority 降順、同順位は FIFO）
//! 3. `WorkflowOrchestrator::admit` を呼ぶ
//!    - Started: permit を pipeline の終了まで保持
//!    - Backpressure（workspace 上限）: 元の順番のまま再投入し、
//!      workspace の release 通知か `admission_retry` の経過を待つ（busy-wait しない）
//! 4. shutdown（watch channel）で admission を止め、実行中の pipeline を待つ

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::orchestrator::{AdmitOutcome, WorkflowOrchestrator};
use crate::domain::{Priority, TaskId};

/// One queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: Priority,
    /// Submission order. Kept across re-queues so a backpressured task keeps its place.
    pub seq: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower seq first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// Tasks waiting for admission.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task_id: TaskId, priority: Priority) -> QueueEntry {
        let entry = {
            let mut state = self.lock();
            let entry = QueueEntry {
                task_id,
                priority,
                seq: state.next_seq,
            };
            state.next_seq += 1;
            state.heap.push(entry);
            entry
        };
        self.notify.notify_one();
        entry
    }

    /// Put a popped entry back with its original position.
    pub fn requeue(&self, entry: QueueEntry) {
        self.lock().heap.push(entry);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        self.lock().heap.pop()
    }

    /// Remove a task that has not been popped yet.
    pub fn remove(&self, task_id: TaskId) -> bool {
        let mut state = self.lock();
        let before = state.heap.len();
        state.heap.retain(|e| e.task_id != task_id);
        state.heap.len() != before
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.lock().heap.iter().any(|e| e.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next push.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scheduler handle.
/// - `shutdown_tx` を drop しても admission は止まる
/// - `request_shutdown()` で admission を止める（実行中の pipeline は止めない）
/// - `shutdown_and_join()` で実行中の pipeline の終了まで待つ
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop admitting and wait for every running pipeline to finish.
    /// Tasks still queued stay `Queued`.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            error!(error = %err, "scheduler loop ended abnormally");
        }
    }
}

pub struct TaskScheduler;

impl TaskScheduler {
    pub fn spawn(orchestrator: Arc<WorkflowOrchestrator>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(scheduler_loop(orchestrator, shutdown_rx));
        SchedulerHandle { shutdown_tx, join }
    }
}

async fn scheduler_loop(orch: Arc<WorkflowOrchestrator>, mut shutdown_rx: watch::Receiver<bool>) {
    let limit = orch.config().orchestrator.max_concurrent_tasks;
    let admission_retry = orch.config().admission_retry();
    let slots = Arc::new(Semaphore::new(limit));
    let queue = orch.admission_queue();
    let mut running: Vec<JoinHandle<()>> = Vec::new();

    info!(max_concurrent_tasks = limit, "scheduler started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        running.retain(|h| !h.is_finished());

        let permit = tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                // sender dropped: the handle is gone, stop like an explicit shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let entry = loop {
            // Register interest before looking, so a push in between is not lost.
            let pushed = queue.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(entry) = queue.pop() {
                break Some(entry);
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break None,
                _ = &mut pushed => {}
            }
        };
        let Some(entry) = entry else {
            continue;
        };

        let released = orch.workspaces().released();
        tokio::pin!(released);
        released.as_mut().enable();

        match orch.admit(entry.task_id).await {
            Ok(AdmitOutcome::Started(pipeline)) => {
                running.push(tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = pipeline.await {
                        error!(error = %err, "pipeline supervisor failed");
                    }
                }));
            }
            Ok(AdmitOutcome::Backpressure) => {
                debug!(task_id = %entry.task_id, "workspace limit reached, requeueing");
                queue.requeue(entry);
                drop(permit);
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = &mut released => {}
                    _ = tokio::time::sleep(admission_retry) => {}
                }
            }
            Ok(AdmitOutcome::Finished(state)) => {
                debug!(task_id = %entry.task_id, state = %state, "task finished at admission");
            }
            Err(err) => {
                error!(task_id = %entry.task_id, error = %err, "admission failed");
            }
        }
    }

    info!(in_flight = running.len(), "scheduler stopping, waiting for running pipelines");
    for handle in running {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[test]
    fn fifo_within_equal_priority() {
        let q = AdmissionQueue::new();
        let ids: Vec<_> = (0..4).map(|_| id()).collect();
        for &t in &ids {
            q.push(t, Priority::Normal);
        }
        let popped: Vec<_> = std::iter::from_fn(|| q.pop()).map(|e| e.task_id).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let q = AdmissionQueue::new();
        let (low, n1, urgent, n2) = (id(), id(), id(), id());
        q.push(low, Priority::Low);
        q.push(n1, Priority::Normal);
        q.push(urgent, Priority::Urgent);
        q.push(n2, Priority::Normal);

        let popped: Vec<_> = std::iter::from_fn(|| q.pop()).map(|e| e.task_id).collect();
        assert_eq!(popped, vec![urgent, n1, n2, low]);
    }

    #[test]
    fn requeue_keeps_original_position() {
        let q = AdmissionQueue::new();
        let (a, b) = (id(), id());
        q.push(a, Priority::Normal);
        q.push(b, Priority::Normal);

        let first = q.pop().unwrap();
        assert_eq!(first.task_id, a);
        q.requeue(first);
        assert_eq!(q.pop().unwrap().task_id, a);
    }

    #[test]
    fn remove_only_hits_queued_tasks() {
        let q = AdmissionQueue::new();
        let (a, b) = (id(), id());
        q.push(a, Priority::Normal);
        q.push(b, Priority::High);

        assert!(q.remove(a));
        assert!(!q.remove(a));
        assert!(!q.contains(a));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn push_wakes_a_waiter() {
        let q = Arc::new(AdmissionQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.notified().await;
                q.pop()
            })
        };
        tokio::task::yield_now().await;
        let t = id();
        q.push(t, Priority::Normal);
        assert_eq!(waiter.await.unwrap().map(|e| e.task_id), Some(t));
    }
}
