//! Per-task pipeline driver.
//!
//! One driver per admitted task, running the stages strictly in sequence.
//! Every capability call goes through the same path:
//!
//! 1. breaker check (rejection = synthetic `TransientFailure(CircuitOpen)`, no call)
//! 2. call under the stage timeout, clamped to what is left of the task deadline
//! 3. breaker + retry budget updated from the outcome tag
//! 4. the decider picks the next action
//! 5. one history entry is appended and persisted before anything else runs
//!
//! The driver is supervised: if it panics (or cannot persist), the
//! supervisor records an `Aborted` fault entry and releases the workspace.

use std::any::Any;
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use super::orchestrator::WorkflowOrchestrator;
use crate::domain::{
    AnalysisOutcome, ChangeSet, DecisionContext, Decision, Disposition, FailureClass, Gate, Gated,
    IntegrationReference, Observation, OrchestratorError, OutcomeKind, PipelineEvent,
    ReviewVerdict, Stage, StageResult, TaskRecord, TaskState, Transition, Workspace,
};
use crate::ports::StageContext;
use crate::recovery::{CallHealth, RetryBudget, instant_after};

/// Spawn the driver for an admitted task under a supervisor. The returned
/// handle resolves to the task's terminal state.
pub(crate) fn spawn(
    orch: Arc<WorkflowOrchestrator>,
    record: TaskRecord,
    workspace: Workspace,
    cancel: CancellationToken,
) -> JoinHandle<TaskState> {
    let task_id = record.task_id;
    let span = info_span!("pipeline", task_id = %task_id);
    let driver = tokio::spawn(
        Pipeline::new(Arc::clone(&orch), record, workspace.clone(), cancel)
            .run()
            .instrument(span),
    );

    tokio::spawn(async move {
        match driver.await {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                orch.record_fault(task_id, &workspace, format!("pipeline error: {err}"))
                    .await
            }
            Err(join_err) => {
                orch.record_fault(task_id, &workspace, panic_message(join_err))
                    .await
            }
        }
    })
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "pipeline task was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}

/// Payload of a successful call, whichever stage produced it.
#[derive(Debug, Clone)]
enum StagePayload {
    Analysis(AnalysisOutcome),
    Change(ChangeSet),
    Verdict(ReviewVerdict),
    Integration(IntegrationReference),
}

impl Gated for StagePayload {
    fn gate(&self) -> Gate {
        match self {
            StagePayload::Analysis(p) => p.gate(),
            StagePayload::Change(p) => p.gate(),
            StagePayload::Verdict(p) => p.gate(),
            StagePayload::Integration(p) => p.gate(),
        }
    }
}

struct Pipeline {
    orch: Arc<WorkflowOrchestrator>,
    record: TaskRecord,
    workspace: Workspace,
    cancel: CancellationToken,
    deadline: Instant,
    /// Budget of the stage currently running. Reset when the state changes.
    budget: Option<RetryBudget>,
    analysis: Option<AnalysisOutcome>,
    change_set: Option<ChangeSet>,
    revisions_used: u32,
    round: u32,
}

impl Pipeline {
    fn new(
        orch: Arc<WorkflowOrchestrator>,
        record: TaskRecord,
        workspace: Workspace,
        cancel: CancellationToken,
    ) -> Self {
        let deadline = instant_after(Instant::now(), orch.config().task_deadline());
        Self {
            orch,
            record,
            workspace,
            cancel,
            deadline,
            budget: None,
            analysis: None,
            change_set: None,
            revisions_used: 0,
            round: 1,
        }
    }

    async fn run(mut self) -> Result<TaskState, OrchestratorError> {
        let state = self.drive().await?;
        let disposition = match state {
            TaskState::Completed => Disposition::Destroy,
            _ => Disposition::Keep,
        };
        self.orch
            .workspaces()
            .release(&self.workspace, disposition)
            .await;
        Ok(state)
    }

    async fn drive(&mut self) -> Result<TaskState, OrchestratorError> {
        while !self.record.is_terminal() {
            let Some(stage) = self.record.state.stage() else {
                return Err(OrchestratorError::UnexpectedState {
                    task_id: self.record.task_id,
                    state: self.record.state,
                    expected: TaskState::Analyzing,
                });
            };

            let attempts = self.budget.as_ref().map_or(0, RetryBudget::attempts);
            if self.cancel.is_cancelled() {
                self.abort_cancelled(attempts).await?;
                break;
            }
            if Instant::now() >= self.deadline {
                self.exceed_deadline(OutcomeKind::TransientFailure, attempts, None)
                    .await?;
                break;
            }

            self.step(stage).await?;
        }
        Ok(self.record.state)
    }

    /// One attempt of `stage` and the single history entry it produces.
    async fn step(&mut self, stage: Stage) -> Result<(), OrchestratorError> {
        let mut budget = match self.budget.take() {
            Some(budget) if budget.stage() == stage => budget,
            _ => RetryBudget::new(stage, self.orch.config().budget_limits(stage)),
        };
        let attempt = budget.start_attempt();
        let ctx = StageContext {
            task_id: self.record.task_id,
            spec: self.record.spec.clone(),
            attempt,
            round: self.round,
            cancel: self.cancel.clone(),
        };

        debug!(stage = %stage, attempt, round = self.round, "invoking capability");
        let result = self.call(stage, &ctx).await;
        let kind = result.kind();
        self.orch.metrics().increment(
            "stage_attempts",
            &[("stage", stage.as_str()), ("outcome", outcome_label(kind))],
        );

        let observation = match result {
            StageResult::Success(payload) => {
                let gate = payload.gate();
                self.keep(payload);
                match gate {
                    Gate::Proceed => Observation::Passed,
                    Gate::Halt(reason) => Observation::Halted(reason),
                }
            }
            StageResult::TransientFailure(failure) => {
                budget.record_failure(failure.class);
                Observation::Transient(failure)
            }
            StageResult::PermanentFailure(reason) => Observation::Permanent(reason),
        };

        if self.cancel.is_cancelled() {
            return self.abort_cancelled(attempt).await;
        }

        let decision = {
            let ctx = DecisionContext {
                stage,
                budget: &budget,
                revisions_left: self
                    .orch
                    .config()
                    .orchestrator
                    .max_revision_rounds
                    .saturating_sub(self.revisions_used),
                breaker_open_for: self.orch.breakers().get(stage).open_for(),
            };
            self.orch.decider().decide(&ctx, &observation)
        };

        match decision {
            Decision::Retry { delay, reason } => {
                if delay >= self.deadline.saturating_duration_since(Instant::now()) {
                    return self.exceed_deadline(kind, attempt, Some(reason)).await;
                }
                if let Some(at) = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| self.orch.clock().now().checked_add_signed(d))
                {
                    budget.schedule(at);
                }
                self.apply(Transition::new(PipelineEvent::RetryScheduled, kind, attempt).with_reason(reason))
                    .await?;
                self.budget = Some(budget);

                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                Ok(())
            }
            Decision::Revise { reason } => {
                self.apply(
                    Transition::new(PipelineEvent::RevisionRequested, kind, attempt)
                        .with_reason(reason),
                )
                .await?;
                self.revisions_used += 1;
                self.round += 1;
                self.change_set = None;
                Ok(())
            }
            other => {
                let mut transition = Transition::new(other.event(), kind, attempt);
                if let Some(reason) = other.reason() {
                    transition = transition.with_reason(reason);
                }
                self.apply(transition).await?;
                Ok(())
            }
        }
    }

    /// Breaker, timeout, and the call itself.
    async fn call(&self, stage: Stage, ctx: &StageContext) -> StageResult<StagePayload> {
        let capability = stage.capability();
        let breaker = self.orch.breakers().get(stage);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejected) => {
                self.orch
                    .metrics()
                    .increment("circuit_rejections", &[("capability", capability)]);
                debug!(capability, state = ?rejected.state, "call rejected by circuit breaker");
                return StageResult::transient(
                    FailureClass::CircuitOpen,
                    format!("{capability} circuit is open, call not attempted"),
                );
            }
        };

        let timeout = self
            .orch
            .config()
            .stage_timeout(stage)
            .min(self.deadline.saturating_duration_since(Instant::now()));
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.invoke(stage, ctx)).await {
            Ok(result) => result,
            Err(_) => StageResult::transient(
                FailureClass::Timeout,
                format!("{capability} did not answer within {timeout:?}"),
            ),
        };
        self.orch
            .metrics()
            .record_duration("stage_latency", &[("stage", stage.as_str())], started.elapsed());

        permit.record(match result {
            StageResult::TransientFailure(_) => CallHealth::Failed,
            StageResult::Success(_) | StageResult::PermanentFailure(_) => CallHealth::Healthy,
        });
        result
    }

    async fn invoke(&self, stage: Stage, ctx: &StageContext) -> StageResult<StagePayload> {
        let caps = self.orch.capabilities();
        let ws = &self.workspace;
        match stage {
            Stage::Analyze => caps
                .analyzer
                .analyze(ctx, ws)
                .await
                .map(StagePayload::Analysis),
            Stage::Resolve => match &self.analysis {
                Some(analysis) => caps
                    .resolver
                    .resolve(ctx, ws, analysis)
                    .await
                    .map(StagePayload::Change),
                None => StageResult::permanent("no analysis to resolve from"),
            },
            Stage::Review => match &self.change_set {
                Some(change_set) => caps
                    .reviewer
                    .review(ctx, ws, change_set)
                    .await
                    .map(StagePayload::Verdict),
                None => StageResult::permanent("no change set to review"),
            },
            Stage::Integrate => match &self.change_set {
                Some(change_set) => caps
                    .integrator
                    .integrate(ctx, ws, change_set)
                    .await
                    .map(StagePayload::Integration),
                None => StageResult::permanent("no change set to integrate"),
            },
        }
    }

    fn keep(&mut self, payload: StagePayload) {
        match payload {
            StagePayload::Analysis(analysis) => self.analysis = Some(analysis),
            StagePayload::Change(change_set) => self.change_set = Some(change_set),
            StagePayload::Verdict(_) => {}
            StagePayload::Integration(reference) => self.record.record_integration(reference),
        }
    }

    async fn apply(&mut self, transition: Transition) -> Result<TaskState, OrchestratorError> {
        self.orch.transition(&mut self.record, transition).await
    }

    async fn abort_cancelled(&mut self, attempt: u32) -> Result<(), OrchestratorError> {
        self.apply(
            Transition::new(PipelineEvent::Cancelled, OutcomeKind::Cancelled, attempt)
                .with_reason("cancel requested"),
        )
        .await?;
        Ok(())
    }

    async fn exceed_deadline(
        &mut self,
        outcome: OutcomeKind,
        attempt: u32,
        detail: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let limit = self.orch.config().task_deadline();
        let reason = match detail {
            Some(detail) => format!("task deadline of {limit:?} exceeded ({detail})"),
            None => format!("task deadline of {limit:?} exceeded"),
        };
        self.apply(Transition::new(PipelineEvent::DeadlineExceeded, outcome, attempt).with_reason(reason))
            .await?;
        Ok(())
    }
}

fn outcome_label(kind: OutcomeKind) -> &'static str {
    match kind {
        OutcomeKind::Success => "success",
        OutcomeKind::TransientFailure => "transient_failure",
        OutcomeKind::PermanentFailure => "permanent_failure",
        OutcomeKind::Cancelled => "cancelled",
        OutcomeKind::Fault => "fault",
    }
}
