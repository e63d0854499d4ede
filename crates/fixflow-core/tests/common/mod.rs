#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fixflow_core::app::{Config, OrchestratorBuilder, WorkflowOrchestrator};
use fixflow_core::domain::{SourceRef, TaskSpec, Workspace};
use fixflow_core::impls::{InMemoryMetricsSink, InMemoryTaskStore};
use fixflow_core::ports::{BackendError, TaskStore, WorkspaceBackend, WorkspaceRequest};
use fixflow_core::testing::{RecordingEventSink, ScriptedCapabilities};

/// Workspaces that only exist in a set.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    live: Mutex<HashSet<String>>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    /// Most workspaces ever live at once.
    pub peak: AtomicUsize,
    pub fail_create: AtomicBool,
}

impl MemoryBackend {
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceBackend for MemoryBackend {
    async fn create(&self, request: &WorkspaceRequest) -> Result<PathBuf, BackendError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::Command {
                command: "git worktree add".to_string(),
                stderr: "fatal: not a git repository".to_string(),
            });
        }
        {
            let mut live = self.live.lock().unwrap();
            if !live.insert(request.branch.clone()) {
                return Err(BackendError::AlreadyExists(request.branch.clone()));
            }
            self.peak.fetch_max(live.len(), Ordering::SeqCst);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from("/mem").join(&request.dir_name))
    }

    async fn destroy(&self, workspace: &Workspace) -> Result<(), BackendError> {
        if self.live.lock().unwrap().remove(&workspace.branch) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Fast retries, no jitter, generous stage timeouts.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config.retry.jitter = 0.0;
    config.orchestrator.admission_retry_ms = 20;
    config
}

pub struct Harness {
    pub orch: Arc<WorkflowOrchestrator>,
    pub caps: ScriptedCapabilities,
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<InMemoryTaskStore>,
    pub events: Arc<RecordingEventSink>,
    pub metrics: Arc<InMemoryMetricsSink>,
}

impl Harness {
    pub fn new(config: Config, caps: ScriptedCapabilities) -> Self {
        Self::with_store(config, caps, Arc::new(InMemoryTaskStore::new()))
    }

    pub fn with_store(
        config: Config,
        caps: ScriptedCapabilities,
        store: Arc<InMemoryTaskStore>,
    ) -> Self {
        let backend = Arc::new(MemoryBackend::default());
        let events = Arc::new(RecordingEventSink::new());
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let orch = OrchestratorBuilder::new(config)
            .capabilities(caps.clone().into_capabilities())
            .workspace_backend(backend.clone())
            .task_store(store.clone() as Arc<dyn TaskStore>)
            .event_sink(events.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();
        Self {
            orch,
            caps,
            backend,
            store,
            events,
            metrics,
        }
    }
}

pub fn issue(number: u64) -> TaskSpec {
    TaskSpec::new(
        SourceRef::new("acme/widgets", number),
        format!("issue #{number}"),
    )
}
