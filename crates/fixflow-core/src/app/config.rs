//! Orchestrator configuration (TOML).
//!
//! Every section is `#[serde(default)]`, so a config file only needs the knobs
//! it changes and a missing file means "all defaults".
//!
//! ```toml
//! [orchestrator]
//! max_concurrent_tasks = 8
//!
//! [workspace]
//! backend = "git"
//! repository = "/srv/repos/widgets"
//! max_open = 8
//!
//! [retry.class_limits]
//! timeout = 2
//!
//! [stages.resolve]
//! timeout_secs = 900
//! max_attempts = 4
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{FailureClass, Stage};
use crate::recovery::{BreakerSettings, BudgetLimits, RetryPolicy};
use crate::workspace::WorkspaceSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub workspace: WorkspaceConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub stages: StagesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pipelines running at once.
    pub max_concurrent_tasks: usize,

    /// Wall-clock budget per task, from admission. Exceeding it escalates.
    pub task_deadline_secs: u64,

    /// How many times a blocking review may send the change back to the resolver.
    pub max_revision_rounds: u32,

    /// Fallback wait before re-trying admission under workspace backpressure.
    pub admission_retry_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            task_deadline_secs: 2 * 60 * 60,
            max_revision_rounds: 2,
            admission_retry_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plain directories (no VCS).
    Directory,
    /// `git worktree` in `repository`.
    Git,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub backend: BackendKind,

    /// Directory the workspaces are created under. With the git backend a
    /// relative path is taken relative to `repository`.
    pub root: PathBuf,

    /// Main repository (git backend only).
    pub repository: PathBuf,

    pub base_ref: String,
    pub branch_prefix: String,

    /// Concurrently open workspaces.
    pub max_open: usize,

    /// Names tried per acquisition when the backend reports leftovers.
    pub max_name_attempts: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Directory,
            root: PathBuf::from(".fixflow/workspaces"),
            repository: PathBuf::from("."),
            base_ref: "HEAD".to_string(),
            branch_prefix: "fixflow".to_string(),
            max_open: 4,
            max_name_attempts: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction in [0, 1].
    pub jitter: f64,
    /// Per-failure-class caps, applied to every stage.
    pub class_limits: BTreeMap<FailureClass, u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default_v1();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
            class_limits: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub open_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        let settings = BreakerSettings::default();
        Self {
            failure_threshold: settings.failure_threshold,
            open_secs: settings.open_duration.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Hard deadline of one capability call.
    pub timeout_secs: u64,
    /// Calls per stage (per resolve round for the resolver), including the first.
    pub max_attempts: u32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub analyze: StageConfig,
    pub resolve: StageConfig,
    pub review: StageConfig,
    pub integrate: StageConfig,
}

impl StagesConfig {
    pub fn get(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Analyze => &self.analyze,
            Stage::Resolve => &self.resolve,
            Stage::Review => &self.review,
            Stage::Integrate => &self.integrate,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageConfig {
        match stage {
            Stage::Analyze => &mut self.analyze,
            Stage::Resolve => &mut self.resolve,
            Stage::Review => &mut self.review,
            Stage::Integrate => &mut self.integrate,
        }
    }
}

/// Upper bound for every seconds-valued knob.
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.orchestrator.max_concurrent_tasks == 0 {
            return invalid("orchestrator.max_concurrent_tasks must be > 0".into());
        }
        if self.orchestrator.task_deadline_secs == 0 {
            return invalid("orchestrator.task_deadline_secs must be > 0".into());
        }
        if self.orchestrator.task_deadline_secs > MAX_WINDOW_SECS {
            return invalid(format!(
                "orchestrator.task_deadline_secs must be <= {MAX_WINDOW_SECS}"
            ));
        }
        if self.workspace.max_open == 0 {
            return invalid("workspace.max_open must be > 0".into());
        }
        if self.workspace.max_name_attempts == 0 {
            return invalid("workspace.max_name_attempts must be > 0".into());
        }
        if self.workspace.base_ref.trim().is_empty() {
            return invalid("workspace.base_ref must not be empty".into());
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return invalid(format!(
                "retry.multiplier must be >= 1.0 (got {})",
                self.retry.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid(format!("retry.jitter must be in [0, 1] (got {})", self.retry.jitter));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms".into());
        }
        if self.retry.max_delay_ms / 1000 > MAX_WINDOW_SECS {
            return invalid(format!("retry.max_delay_ms must be <= {MAX_WINDOW_SECS}000"));
        }
        if let Some((class, _)) = self.retry.class_limits.iter().find(|&(_, &limit)| limit == 0) {
            return invalid(format!("retry.class_limits.{class:?} must be > 0"));
        }
        if self.circuit.failure_threshold == 0 {
            return invalid("circuit.failure_threshold must be > 0".into());
        }
        if self.circuit.open_secs == 0 {
            return invalid("circuit.open_secs must be > 0".into());
        }
        if self.circuit.open_secs > MAX_WINDOW_SECS {
            return invalid(format!("circuit.open_secs must be <= {MAX_WINDOW_SECS}"));
        }
        for stage in Stage::ALL {
            let cfg = self.stages.get(stage);
            if cfg.timeout_secs == 0 {
                return invalid(format!("stages.{stage}.timeout_secs must be > 0"));
            }
            if cfg.timeout_secs > MAX_WINDOW_SECS {
                return invalid(format!(
                    "stages.{stage}.timeout_secs must be <= {MAX_WINDOW_SECS}"
                ));
            }
            if cfg.max_attempts == 0 {
                return invalid(format!("stages.{stage}.max_attempts must be > 0"));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.circuit.failure_threshold,
            open_duration: Duration::from_secs(self.circuit.open_secs),
        }
    }

    pub fn workspace_settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            max_open: self.workspace.max_open,
            branch_prefix: self.workspace.branch_prefix.clone(),
            base_ref: self.workspace.base_ref.clone(),
            max_name_attempts: self.workspace.max_name_attempts,
        }
    }

    pub fn budget_limits(&self, stage: Stage) -> BudgetLimits {
        BudgetLimits {
            max_attempts: self.stages.get(stage).max_attempts,
            class_limits: self.retry.class_limits.clone(),
        }
    }

    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        Duration::from_secs(self.stages.get(stage).timeout_secs)
    }

    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.orchestrator.task_deadline_secs)
    }

    pub fn admission_retry(&self) -> Duration {
        Duration::from_millis(self.orchestrator.admission_retry_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg)?;
    buf.push('\n');

    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).map_err(write_err)?;
    fs::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/fixflow.toml");
        let mut cfg = Config::default();
        cfg.retry.class_limits.insert(FailureClass::Timeout, 2);
        cfg.stages.resolve.max_attempts = 5;

        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixflow.toml");
        fs::write(
            &path,
            r#"
[workspace]
backend = "git"
max_open = 9

[retry.class_limits]
rate_limited = 4

[stages.review]
timeout_secs = 30
"#,
        )
        .unwrap();

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.workspace.backend, BackendKind::Git);
        assert_eq!(cfg.workspace.max_open, 9);
        assert_eq!(cfg.workspace.branch_prefix, "fixflow");
        assert_eq!(cfg.retry.class_limits.get(&FailureClass::RateLimited), Some(&4));
        assert_eq!(cfg.stage_timeout(Stage::Review), Duration::from_secs(30));
        assert_eq!(cfg.stages.review.max_attempts, 3);
        assert_eq!(cfg.budget_limits(Stage::Resolve).class_limits.len(), 1);
    }

    #[test]
    fn unparsable_file_reports_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.toml");
        fs::write(&path, "[orchestrator\nmax_concurrent_tasks = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[rstest]
    #[case::zero_concurrency(|c: &mut Config| c.orchestrator.max_concurrent_tasks = 0)]
    #[case::zero_cap(|c: &mut Config| c.workspace.max_open = 0)]
    #[case::zero_threshold(|c: &mut Config| c.circuit.failure_threshold = 0)]
    #[case::shrinking_backoff(|c: &mut Config| c.retry.multiplier = 0.5)]
    #[case::jitter_out_of_range(|c: &mut Config| c.retry.jitter = 1.5)]
    #[case::zero_timeout(|c: &mut Config| c.stages.integrate.timeout_secs = 0)]
    #[case::zero_attempts(|c: &mut Config| c.stages.analyze.max_attempts = 0)]
    #[case::unbounded_deadline(|c: &mut Config| c.orchestrator.task_deadline_secs = u64::MAX)]
    #[case::unbounded_open_window(|c: &mut Config| c.circuit.open_secs = u64::MAX)]
    #[case::unbounded_timeout(|c: &mut Config| c.stages.review.timeout_secs = MAX_WINDOW_SECS + 1)]
    #[case::unbounded_backoff(|c: &mut Config| c.retry.max_delay_ms = u64::MAX)]
    fn validate_rejects(#[case] mutate: fn(&mut Config)) {
        let mut cfg = Config::default();
        mutate(&mut cfg);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
