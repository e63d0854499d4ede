//! App - アプリケーション層
//!
//! ports を組み合わせて、タスクの受付から終了までを実装します。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: 構築とワイヤリング（起動時検証）
//! - **WorkflowOrchestrator**: submit / status / cancel / wait と遷移の記録
//! - **TaskScheduler**: admission の流量制御（並行数と workspace 上限）
//! - **pipeline**: タスクごとの driver（analyze → resolve → review → integrate）
//! - **Config**: TOML 設定

pub mod builder;
pub mod config;
pub mod orchestrator;
mod pipeline;
pub mod scheduler;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::config::{Config, ConfigError, load_config, write_config};
pub use self::orchestrator::{
    AdmitOutcome, CancelAck, Capabilities, SubmitAck, WorkflowOrchestrator,
};
pub use self::scheduler::{AdmissionQueue, QueueEntry, SchedulerHandle, TaskScheduler};
pub use self::status::{TaskCounts, TaskStatus};
