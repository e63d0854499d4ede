//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / JsonFileTaskStore**: タスク記録の正本
//! - **NoopEventSink / TracingEventSink / BroadcastEventSink**: 遷移イベント
//! - **NoopMetricsSink / InMemoryMetricsSink**: メトリクス
//! - **DirectoryBackend / GitWorktreeBackend**: workspace の実体
//!
//! capability（Analyzer など）の本番実装はこのクレートには含めません。

pub mod directory;
pub mod events;
pub mod file_store;
pub mod git_worktree;
pub mod memory_store;
pub mod metrics;

pub use self::directory::DirectoryBackend;
pub use self::events::{BroadcastEventSink, NoopEventSink, TracingEventSink};
pub use self::file_store::JsonFileTaskStore;
pub use self::git_worktree::GitWorktreeBackend;
pub use self::memory_store::InMemoryTaskStore;
pub use self::metrics::{InMemoryMetricsSink, NoopMetricsSink};
