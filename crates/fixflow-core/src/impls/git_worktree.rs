//! GitWorktreeBackend - `git worktree` を workspace とする backend
//!
//! 1 workspace = 1 worktree + 1 branch。main line には一切触れません。
//! destroy は「既に消えている」状態をすべて成功として扱います。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::domain::Workspace;
use crate::ports::{BackendError, WorkspaceBackend, WorkspaceRequest};

#[derive(Debug, Clone)]
pub struct GitWorktreeBackend {
    /// The main repository the worktrees belong to.
    repository: PathBuf,
    /// Directory the worktrees are created under. Always absolute, so git,
    /// the fs calls and the capabilities all see the same tree.
    root: PathBuf,
}

impl GitWorktreeBackend {
    /// A relative `root` is taken relative to `repository`, the way
    /// `git -C <repository> worktree add` would resolve it.
    pub fn new(repository: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        let repository = repository.into();
        let repository = std::path::absolute(&repository).unwrap_or(repository);
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            repository.join(root)
        };
        Self { repository, root }
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn run(&self, args: &[&str]) -> Result<Output, BackendError> {
        Command::new("git")
            .arg("-C")
            .arg(&self.repository)
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::io(format!("spawn git {}", args.join(" ")), e))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output, BackendError> {
        let out = self.run(args).await?;
        if out.status.success() {
            Ok(out)
        } else {
            Err(command_error(args, &out))
        }
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, BackendError> {
        let reference = format!("refs/heads/{branch}");
        let out = self
            .run(&["show-ref", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.status.success())
    }
}

#[async_trait]
impl WorkspaceBackend for GitWorktreeBackend {
    #[instrument(skip_all, fields(branch = %request.branch))]
    async fn create(&self, request: &WorkspaceRequest) -> Result<PathBuf, BackendError> {
        let path = self.root.join(&request.dir_name);
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| BackendError::io(format!("stat {}", path.display()), e))?;
        if exists || self.branch_exists(&request.branch).await? {
            return Err(BackendError::AlreadyExists(request.branch.clone()));
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| BackendError::io(format!("create {}", self.root.display()), e))?;

        let path_arg = path.to_string_lossy();
        self.run_checked(&[
            "worktree",
            "add",
            "-b",
            &request.branch,
            &path_arg,
            &request.base_ref,
        ])
        .await?;

        debug!(path = %path.display(), "worktree created");
        Ok(path)
    }

    #[instrument(skip_all, fields(branch = %workspace.branch))]
    async fn destroy(&self, workspace: &Workspace) -> Result<(), BackendError> {
        let path_arg = workspace.root.to_string_lossy();
        let out = self
            .run(&["worktree", "remove", "--force", &path_arg])
            .await?;
        if !out.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "worktree remove failed, removing directory directly"
            );
        }

        match fs::remove_dir_all(&workspace.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackendError::io(
                    format!("remove {}", workspace.root.display()),
                    e,
                ));
            }
        }

        // Drop administrative entries for trees removed behind git's back.
        let prune = self.run(&["worktree", "prune"]).await?;
        if !prune.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&prune.stderr).trim(),
                "git worktree prune failed"
            );
        }

        if self.branch_exists(&workspace.branch).await? {
            self.run_checked(&["branch", "-D", &workspace.branch])
                .await?;
        }
        Ok(())
    }
}

fn command_error(args: &[&str], out: &Output) -> BackendError {
    BackendError::Command {
        command: format!("git {}", args.join(" ")),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    }
}
