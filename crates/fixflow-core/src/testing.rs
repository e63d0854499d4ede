//! Scripted capabilities and recorders for tests and demos.
//!
//! Each scripted capability plays a queue of [`Step`]s, one per call, then
//! falls back to a fixed result. Clones share the script, so a test can keep
//! a clone to count calls after handing the other to the builder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::app::Capabilities;
use crate::domain::{
    AnalysisOutcome, ChangeSet, FailureClass, IntegrationReference, ReviewVerdict, StageResult,
    TransitionRecord, Workspace,
};
use crate::ports::{Analyzer, EventSink, Integrator, Resolver, Reviewer, StageContext};

/// One scripted call.
#[derive(Debug, Clone)]
pub enum Step<T> {
    Respond(StageResult<T>),
    /// Sleep, then respond. Honors the task's cancel token.
    After(Duration, StageResult<T>),
    /// Block until the task is cancelled.
    UntilCancelled,
    Panic(String),
}

#[derive(Debug)]
struct ScriptInner<T> {
    steps: Mutex<VecDeque<Step<T>>>,
    fallback: StageResult<T>,
    calls: AtomicU32,
}

#[derive(Debug)]
pub struct Script<T> {
    inner: Arc<ScriptInner<T>>,
}

impl<T> Clone for Script<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync> Script<T> {
    /// Answers every call with `fallback` once the steps run out.
    pub fn new(fallback: StageResult<T>) -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                steps: Mutex::new(VecDeque::new()),
                fallback,
                calls: AtomicU32::new(0),
            }),
        }
    }

    pub fn then(self, step: Step<T>) -> Self {
        self.push(step);
        self
    }

    pub fn then_respond(self, result: StageResult<T>) -> Self {
        self.then(Step::Respond(result))
    }

    pub fn push(&self, step: Step<T>) {
        self.lock().push_back(step);
    }

    pub fn calls(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    async fn play(&self, ctx: &StageContext) -> StageResult<T> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.lock().pop_front();
        match step {
            None => self.inner.fallback.clone(),
            Some(Step::Respond(result)) => result,
            Some(Step::After(delay, result)) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => interrupted(),
                    _ = tokio::time::sleep(delay) => result,
                }
            }
            Some(Step::UntilCancelled) => {
                ctx.cancel.cancelled().await;
                interrupted()
            }
            Some(Step::Panic(message)) => panic!("{message}"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Step<T>>> {
        self.inner.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn interrupted<T>() -> StageResult<T> {
    StageResult::transient(FailureClass::Other, "interrupted by cancellation")
}

#[derive(Debug, Clone)]
pub struct ScriptedAnalyzer(pub Script<AnalysisOutcome>);

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        ctx: &StageContext,
        _workspace: &Workspace,
    ) -> StageResult<AnalysisOutcome> {
        self.0.play(ctx).await
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedResolver(pub Script<ChangeSet>);

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(
        &self,
        ctx: &StageContext,
        _workspace: &Workspace,
        _analysis: &AnalysisOutcome,
    ) -> StageResult<ChangeSet> {
        self.0.play(ctx).await
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedReviewer(pub Script<ReviewVerdict>);

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn review(
        &self,
        ctx: &StageContext,
        _workspace: &Workspace,
        _change_set: &ChangeSet,
    ) -> StageResult<ReviewVerdict> {
        self.0.play(ctx).await
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedIntegrator(pub Script<IntegrationReference>);

#[async_trait]
impl Integrator for ScriptedIntegrator {
    async fn integrate(
        &self,
        ctx: &StageContext,
        workspace: &Workspace,
        _change_set: &ChangeSet,
    ) -> StageResult<IntegrationReference> {
        match self.0.play(ctx).await {
            // Stamp the branch so each task gets its own reference.
            StageResult::Success(mut reference) if reference.url.is_empty() => {
                reference.url = format!("pr://{}", workspace.branch);
                StageResult::Success(reference)
            }
            other => other,
        }
    }
}

/// The four scripted capabilities, all succeeding by default.
#[derive(Debug, Clone)]
pub struct ScriptedCapabilities {
    pub analyzer: ScriptedAnalyzer,
    pub resolver: ScriptedResolver,
    pub reviewer: ScriptedReviewer,
    pub integrator: ScriptedIntegrator,
}

impl ScriptedCapabilities {
    /// Feasible analysis, a one-file change, approval, and an integration
    /// reference named after the workspace branch.
    pub fn happy() -> Self {
        Self {
            analyzer: ScriptedAnalyzer(Script::new(StageResult::Success(
                AnalysisOutcome::feasible("looks fixable"),
            ))),
            resolver: ScriptedResolver(Script::new(StageResult::Success(
                ChangeSet::new("patched").with_file("src/lib.rs"),
            ))),
            reviewer: ScriptedReviewer(Script::new(StageResult::Success(ReviewVerdict::approved()))),
            integrator: ScriptedIntegrator(Script::new(StageResult::Success(
                IntegrationReference::new(""),
            ))),
        }
    }

    pub fn into_capabilities(self) -> Capabilities {
        Capabilities {
            analyzer: Arc::new(self.analyzer),
            resolver: Arc::new(self.resolver),
            reviewer: Arc::new(self.reviewer),
            integrator: Arc::new(self.integrator),
        }
    }
}

/// Keeps every emitted transition.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    records: Mutex<Vec<TransitionRecord>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TransitionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, record: &TransitionRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
