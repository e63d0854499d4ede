//! OrchestratorBuilder - orchestrator の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定の検証と capability の揃い具合を build() で確認
//! - 既定の実装（in-memory store、tracing event sink など）で最小構成がすぐ動く

use std::sync::Arc;

use super::config::{BackendKind, Config, ConfigError};
use super::orchestrator::{Capabilities, OrchestratorParts, WorkflowOrchestrator};
use crate::domain::{Decider, DefaultDecider};
use crate::impls::{
    DirectoryBackend, GitWorktreeBackend, InMemoryTaskStore, NoopMetricsSink, TracingEventSink,
};
use crate::ports::{
    Analyzer, Clock, EventSink, IdGenerator, Integrator, MetricsSink, Resolver, Reviewer,
    SystemClock, TaskStore, UlidGenerator, WorkspaceBackend,
};
use crate::workspace::WorkspaceManager;

/// Builds a [`WorkflowOrchestrator`].
///
/// # 使用例
/// ```ignore
/// let orch = OrchestratorBuilder::new(config)
///     .analyzer(MyAnalyzer)
///     .resolver(MyResolver)
///     .reviewer(MyReviewer)
///     .integrator(MyIntegrator)
///     .build()?;
/// let scheduler = orch.start_scheduler();
/// ```
///
/// # Fail-fast 設計
/// - 4 つの capability がすべて揃っていなければ `BuildError::MissingCapabilities`
/// - 設定が不正なら `BuildError::InvalidConfig`
pub struct OrchestratorBuilder {
    config: Config,
    analyzer: Option<Arc<dyn Analyzer>>,
    resolver: Option<Arc<dyn Resolver>>,
    reviewer: Option<Arc<dyn Reviewer>>,
    integrator: Option<Arc<dyn Integrator>>,
    backend: Option<Arc<dyn WorkspaceBackend>>,
    store: Option<Arc<dyn TaskStore>>,
    events: Option<Arc<dyn EventSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing capabilities: {0:?}. Every stage needs an implementation.")]
    MissingCapabilities(Vec<&'static str>),

    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl OrchestratorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            analyzer: None,
            resolver: None,
            reviewer: None,
            integrator: None,
            backend: None,
            store: None,
            events: None,
            metrics: None,
            clock: None,
            ids: None,
            decider: None,
        }
    }

    pub fn analyzer(mut self, analyzer: impl Analyzer + 'static) -> Self {
        self.analyzer = Some(Arc::new(analyzer));
        self
    }

    pub fn resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn reviewer(mut self, reviewer: impl Reviewer + 'static) -> Self {
        self.reviewer = Some(Arc::new(reviewer));
        self
    }

    pub fn integrator(mut self, integrator: impl Integrator + 'static) -> Self {
        self.integrator = Some(Arc::new(integrator));
        self
    }

    /// Set all four capabilities at once.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.analyzer = Some(capabilities.analyzer);
        self.resolver = Some(capabilities.resolver);
        self.reviewer = Some(capabilities.reviewer);
        self.integrator = Some(capabilities.integrator);
        self
    }

    /// Overrides the backend selected by `workspace.backend`.
    pub fn workspace_backend(mut self, backend: Arc<dyn WorkspaceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Validate and wire everything together.
    pub fn build(self) -> Result<Arc<WorkflowOrchestrator>, BuildError> {
        self.config.validate()?;

        let mut missing = Vec::new();
        if self.analyzer.is_none() {
            missing.push("analyzer");
        }
        if self.resolver.is_none() {
            missing.push("resolver");
        }
        if self.reviewer.is_none() {
            missing.push("reviewer");
        }
        if self.integrator.is_none() {
            missing.push("integrator");
        }
        let (Some(analyzer), Some(resolver), Some(reviewer), Some(integrator)) =
            (self.analyzer, self.resolver, self.reviewer, self.integrator)
        else {
            return Err(BuildError::MissingCapabilities(missing));
        };

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let backend = self.backend.unwrap_or_else(|| default_backend(&config));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(config.retry_policy())));

        let workspaces = WorkspaceManager::new(
            backend,
            Arc::clone(&ids),
            Arc::clone(&clock),
            config.workspace_settings(),
        );

        Ok(Arc::new(WorkflowOrchestrator::from_parts(OrchestratorParts {
            capabilities: Capabilities {
                analyzer,
                resolver,
                reviewer,
                integrator,
            },
            workspaces,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetricsSink)),
            clock,
            ids,
            decider,
            config,
        })))
    }
}

fn default_backend(config: &Config) -> Arc<dyn WorkspaceBackend> {
    let ws = &config.workspace;
    match ws.backend {
        BackendKind::Directory => Arc::new(DirectoryBackend::new(&ws.root)),
        BackendKind::Git => Arc::new(GitWorktreeBackend::new(&ws.repository, &ws.root)),
    }
}
