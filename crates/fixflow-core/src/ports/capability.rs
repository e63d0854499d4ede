//! Capability ports - パイプラインの各ステージを実行する外部コンポーネント
//!
//! 1 trait = 1 メソッド。orchestrator はこの trait だけに依存し、具体的な実装
//! （LLM、静的解析、PR 作成 API など）を知りません。
//!
//! # 設計原則
//! - 失敗は `StageResult` で返す（panic / Err は使わない）
//! - リトライ可否は capability 自身が tag で宣言する（Transient / Permanent）
//! - キャンセル対応は任意: `StageContext::cancel` を監視して早期 return してよい

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    AnalysisOutcome, ChangeSet, IntegrationReference, ReviewVerdict, StageResult, TaskId,
    TaskSpec, Workspace,
};

/// Per-call context handed to a capability.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: TaskId,
    pub spec: TaskSpec,
    /// 1-indexed attempt of the current stage.
    pub attempt: u32,
    /// 1-indexed resolve round (increments on every review-requested revision).
    pub round: u32,
    /// Fired when the task is cancelled.
    pub cancel: CancellationToken,
}

/// Classifies an issue's feasibility.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        ctx: &StageContext,
        workspace: &Workspace,
    ) -> StageResult<AnalysisOutcome>;
}

/// Produces a candidate modification inside the workspace.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        ctx: &StageContext,
        workspace: &Workspace,
        analysis: &AnalysisOutcome,
    ) -> StageResult<ChangeSet>;
}

/// Judges a candidate change.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        ctx: &StageContext,
        workspace: &Workspace,
        change_set: &ChangeSet,
    ) -> StageResult<ReviewVerdict>;
}

/// Publishes an integration request referencing the workspace branch.
#[async_trait]
pub trait Integrator: Send + Sync {
    async fn integrate(
        &self,
        ctx: &StageContext,
        workspace: &Workspace,
        change_set: &ChangeSet,
    ) -> StageResult<IntegrationReference>;
}
