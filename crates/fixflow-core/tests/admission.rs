mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{Harness, fast_config, issue};
use fixflow_core::app::{CancelAck, OrchestratorBuilder};
use fixflow_core::domain::{
    AnalysisOutcome, OrchestratorError, OutcomeKind, PipelineEvent, Priority, StageResult,
    TaskId, TaskState,
};
use fixflow_core::impls::JsonFileTaskStore;
use fixflow_core::ports::TaskStore;
use fixflow_core::testing::{ScriptedCapabilities, Step};

async fn wait_for_state(h: &Harness, task_id: TaskId, state: TaskState) {
    for _ in 0..1000 {
        if h.orch.status(task_id).await.unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task never reached {state}");
}

#[tokio::test(start_paused = true)]
async fn open_workspaces_never_exceed_the_cap() {
    let mut config = fast_config();
    config.orchestrator.max_concurrent_tasks = 8;
    config.workspace.max_open = 2;
    let caps = ScriptedCapabilities::happy();
    for _ in 0..6 {
        caps.analyzer.0.push(Step::After(
            Duration::from_secs(1),
            StageResult::Success(AnalysisOutcome::feasible("ok")),
        ));
    }
    let h = Harness::new(config, caps);
    let scheduler = h.orch.start_scheduler();

    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(h.orch.submit(issue(n)).await.unwrap().task_id);
    }
    for id in ids {
        assert_eq!(h.orch.wait(id).await.unwrap().state, TaskState::Completed);
    }

    assert!(h.backend.peak() <= 2);
    assert!(h.metrics.counter_total("admission_backpressure") >= 1);
    assert_eq!(h.backend.destroyed(), 6);

    scheduler.shutdown_and_join().await;
}

#[tokio::test(start_paused = true)]
async fn higher_priority_is_admitted_first() {
    let mut config = fast_config();
    config.orchestrator.max_concurrent_tasks = 1;
    let h = Harness::new(config, ScriptedCapabilities::happy());

    let low = h
        .orch
        .submit(issue(1).with_priority(Priority::Low))
        .await
        .unwrap();
    let normal = h.orch.submit(issue(2)).await.unwrap();
    let urgent = h
        .orch
        .submit(issue(3).with_priority(Priority::Urgent))
        .await
        .unwrap();
    assert_eq!(urgent.queue_depth, 3);

    let scheduler = h.orch.start_scheduler();
    for id in [low.task_id, normal.task_id, urgent.task_id] {
        h.orch.wait(id).await.unwrap();
    }
    scheduler.shutdown_and_join().await;

    let admitted: Vec<_> = h
        .events
        .records()
        .into_iter()
        .filter(|r| r.event == PipelineEvent::Admitted)
        .map(|r| r.task_id)
        .collect();
    assert_eq!(admitted, vec![urgent.task_id, normal.task_id, low.task_id]);
}

#[tokio::test(start_paused = true)]
async fn workspace_failure_aborts_without_calling_capabilities() {
    let h = Harness::new(fast_config(), ScriptedCapabilities::happy());
    h.backend.fail_create.store(true, Ordering::SeqCst);
    let scheduler = h.orch.start_scheduler();

    let ack = h.orch.submit(issue(9)).await.unwrap();
    let status = h.orch.wait(ack.task_id).await.unwrap();

    assert_eq!(status.state, TaskState::Aborted);
    assert_eq!(status.history.len(), 1);
    let entry = &status.history[0];
    assert_eq!(entry.from, TaskState::Queued);
    assert_eq!(entry.event, PipelineEvent::WorkspaceFailed);
    assert_eq!(entry.outcome, OutcomeKind::PermanentFailure);
    assert!(status.reason().unwrap().contains("workspace creation failed"));
    assert!(status.admitted_at.is_none());
    assert_eq!(h.caps.analyzer.0.calls(), 0);
    assert_eq!(h.orch.workspaces().open_count(), 0);

    scheduler.shutdown_and_join().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_queued_task_aborts_it_immediately() {
    let h = Harness::new(fast_config(), ScriptedCapabilities::happy());

    let ack = h.orch.submit(issue(10)).await.unwrap();
    assert_eq!(h.orch.cancel(ack.task_id).await.unwrap(), CancelAck::Aborted);

    let status = h.orch.status(ack.task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Aborted);
    assert_eq!(status.history.len(), 1);
    assert_eq!(status.history[0].event, PipelineEvent::Cancelled);
    assert_eq!(status.history[0].outcome, OutcomeKind::Cancelled);
    assert!(h.orch.admission_queue().is_empty());

    assert_eq!(
        h.orch.cancel(ack.task_id).await.unwrap(),
        CancelAck::AlreadyTerminal(TaskState::Aborted)
    );

    // Nothing left for the scheduler to pick up.
    let scheduler = h.orch.start_scheduler();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.shutdown_and_join().await;
    assert_eq!(h.caps.analyzer.0.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_running_task_aborts_after_the_call_returns() {
    let caps = ScriptedCapabilities::happy();
    caps.analyzer.0.push(Step::UntilCancelled);
    let h = Harness::new(fast_config(), caps);
    let scheduler = h.orch.start_scheduler();

    let ack = h.orch.submit(issue(11)).await.unwrap();
    wait_for_state(&h, ack.task_id, TaskState::Analyzing).await;

    assert_eq!(h.orch.cancel(ack.task_id).await.unwrap(), CancelAck::Requested);
    let status = h.orch.wait(ack.task_id).await.unwrap();

    assert_eq!(status.state, TaskState::Aborted);
    assert_eq!(status.history.len(), 1);
    let entry = &status.history[0];
    assert_eq!(entry.from, TaskState::Analyzing);
    assert_eq!(entry.event, PipelineEvent::Cancelled);
    assert_eq!(entry.outcome, OutcomeKind::Cancelled);
    assert_eq!(h.orch.workspaces().open_count(), 0);
    assert_eq!(h.caps.resolver.0.calls(), 0);

    scheduler.shutdown_and_join().await;
}

#[tokio::test]
async fn unknown_task_is_reported() {
    let h = Harness::new(fast_config(), ScriptedCapabilities::happy());
    let id = TaskId::from_ulid(ulid::Ulid::new());

    assert!(matches!(
        h.orch.status(id).await,
        Err(OrchestratorError::TaskNotFound(missing)) if missing == id
    ));
    assert!(matches!(
        h.orch.cancel(id).await,
        Err(OrchestratorError::TaskNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_running_pipelines() {
    let caps = ScriptedCapabilities::happy();
    caps.analyzer.0.push(Step::After(
        Duration::from_secs(2),
        StageResult::Success(AnalysisOutcome::feasible("ok")),
    ));
    let h = Harness::new(fast_config(), caps);
    let scheduler = h.orch.start_scheduler();

    let ack = h.orch.submit(issue(12)).await.unwrap();
    wait_for_state(&h, ack.task_id, TaskState::Analyzing).await;
    scheduler.shutdown_and_join().await;

    assert_eq!(
        h.orch.status(ack.task_id).await.unwrap().state,
        TaskState::Completed
    );
}

#[tokio::test]
async fn file_store_keeps_a_replayable_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileTaskStore::new(dir.path()));
    let caps = ScriptedCapabilities::happy();
    let orch = OrchestratorBuilder::new(fast_config())
        .capabilities(caps.into_capabilities())
        .workspace_backend(Arc::new(common::MemoryBackend::default()))
        .task_store(store.clone())
        .build()
        .unwrap();
    let scheduler = orch.start_scheduler();

    let ack = orch.submit(issue(13)).await.unwrap();
    let status = orch.wait(ack.task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Completed);
    scheduler.shutdown_and_join().await;

    // A fresh store over the same directory sees the same record.
    let reopened = JsonFileTaskStore::new(dir.path());
    let record = reopened.get(ack.task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.history, status.history);
    assert_eq!(record.replay().unwrap(), TaskState::Completed);
    assert_eq!(reopened.list().await.unwrap().len(), 1);
}
