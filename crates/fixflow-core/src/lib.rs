//! fixflow-core
//!
//! Orchestrates automated issue resolution: each submitted issue becomes a
//! task that runs analyze → resolve → review → integrate in its own
//! workspace, with retry budgets, circuit breakers, and a full audit trail.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, spec, state, outcome, task, decision, events, errors）
//! - **ports**: 抽象化レイヤー（capability, TaskStore, WorkspaceBackend, EventSink, MetricsSink, Clock）
//! - **recovery**: リトライ方針と予算、capability ごとの circuit breaker
//! - **workspace**: workspace の lease 管理（上限、命名、解放）
//! - **app**: builder, orchestrator, scheduler, pipeline, config, status
//! - **impls**: ports の実装（in-memory / JSON ファイル store、directory / git worktree backend など）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod recovery;
pub mod workspace;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use app::{Config, OrchestratorBuilder, TaskStatus, WorkflowOrchestrator};
pub use domain::{TaskId, TaskSpec, TaskState};
