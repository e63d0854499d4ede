//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! orchestrator は trait だけに依存し、外部システム（AI capability、VCS、
//! 永続化、メトリクス）の実装詳細を知りません。

pub mod capability;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod metrics;
pub mod task_store;
pub mod workspace_backend;

// 主要な trait を再エクスポート
pub use self::capability::{Analyzer, Integrator, Resolver, Reviewer, StageContext};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::metrics::MetricsSink;
pub use self::task_store::{StoreError, TaskStore};
pub use self::workspace_backend::{BackendError, WorkspaceBackend, WorkspaceRequest};
