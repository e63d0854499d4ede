//! Offline capabilities for `fixflow demo`.
//!
//! They steer on issue labels so one run shows every outcome:
//! - `question`: analysis says infeasible (Escalated)
//! - `flaky`: the resolver fails transiently on its first attempt
//! - `needs-revision`: review blocks the first round
//! - `archived`: integration fails permanently
//!
//! The resolver writes a `FIX.md` into the workspace, so kept workspaces
//! show what was attempted.

use async_trait::async_trait;
use tokio::fs;

use fixflow_core::domain::{
    AnalysisOutcome, ChangeSet, FailureClass, IntegrationReference, ReviewVerdict, SourceRef,
    StageResult, TaskSpec, Workspace,
};
use fixflow_core::ports::{Analyzer, Integrator, Resolver, Reviewer, StageContext};

fn has_label(ctx: &StageContext, label: &str) -> bool {
    ctx.spec.labels.iter().any(|l| l == label)
}

pub struct LabelAnalyzer;

#[async_trait]
impl Analyzer for LabelAnalyzer {
    async fn analyze(
        &self,
        ctx: &StageContext,
        _workspace: &Workspace,
    ) -> StageResult<AnalysisOutcome> {
        if has_label(ctx, "question") {
            return StageResult::Success(AnalysisOutcome::infeasible(
                "not a defect: needs an answer, not a patch",
            ));
        }
        StageResult::Success(AnalysisOutcome::feasible(format!(
            "patch candidate for {}",
            ctx.spec.source
        )))
    }
}

pub struct NoteResolver;

#[async_trait]
impl Resolver for NoteResolver {
    async fn resolve(
        &self,
        ctx: &StageContext,
        workspace: &Workspace,
        analysis: &AnalysisOutcome,
    ) -> StageResult<ChangeSet> {
        if has_label(ctx, "flaky") && ctx.attempt == 1 {
            return StageResult::transient(FailureClass::RateLimited, "model rate limited");
        }

        let path = workspace.root.join("FIX.md");
        let note = format!(
            "# {}\n\nround {}, attempt {}\n\n{}\n",
            ctx.spec.title, ctx.round, ctx.attempt, analysis.summary
        );
        match fs::write(&path, note).await {
            Ok(()) => StageResult::Success(
                ChangeSet::new(format!("round {} fix note", ctx.round)).with_file("FIX.md"),
            ),
            Err(err) => StageResult::transient(
                FailureClass::Unavailable,
                format!("write {}: {err}", path.display()),
            ),
        }
    }
}

pub struct RoundReviewer;

#[async_trait]
impl Reviewer for RoundReviewer {
    async fn review(
        &self,
        ctx: &StageContext,
        _workspace: &Workspace,
        change_set: &ChangeSet,
    ) -> StageResult<ReviewVerdict> {
        if has_label(ctx, "needs-revision") && ctx.round == 1 {
            return StageResult::Success(ReviewVerdict::blocking([format!(
                "{} lacks a regression test",
                change_set.summary
            )]));
        }
        StageResult::Success(ReviewVerdict::approved())
    }
}

pub struct LocalIntegrator;

#[async_trait]
impl Integrator for LocalIntegrator {
    async fn integrate(
        &self,
        ctx: &StageContext,
        workspace: &Workspace,
        _change_set: &ChangeSet,
    ) -> StageResult<IntegrationReference> {
        if has_label(ctx, "archived") {
            return StageResult::permanent(format!("{} is archived", ctx.spec.source.repository));
        }
        StageResult::Success(
            IntegrationReference::new(format!("local://{}", workspace.branch))
                .with_number(ctx.spec.source.number),
        )
    }
}

/// A fixed batch of issues covering every outcome.
pub fn issues(repository: &str) -> Vec<TaskSpec> {
    let issue = |number: u64, title: &str| TaskSpec::new(SourceRef::new(repository, number), title);
    vec![
        issue(101, "Crash on empty config file"),
        issue(102, "How do I enable verbose logging?").with_label("question"),
        issue(103, "Off-by-one in pagination").with_label("flaky"),
        issue(104, "Panic when path contains unicode").with_label("needs-revision"),
        issue(105, "Typo in error message").with_label("archived"),
    ]
}
