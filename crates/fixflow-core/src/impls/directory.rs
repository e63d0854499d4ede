//! DirectoryBackend - 空ディレクトリを workspace とする backend（開発・テスト用）
//!
//! VCS を使わずに lease / 上限 / 冪等 cleanup の挙動を確認するためのものです。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, instrument};

use crate::domain::Workspace;
use crate::ports::{BackendError, WorkspaceBackend, WorkspaceRequest};

#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl WorkspaceBackend for DirectoryBackend {
    #[instrument(skip_all, fields(dir = %request.dir_name))]
    async fn create(&self, request: &WorkspaceRequest) -> Result<PathBuf, BackendError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| BackendError::io(format!("create {}", self.root.display()), e))?;

        let path = self.root.join(&request.dir_name);
        match fs::create_dir(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "workspace directory created");
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(BackendError::AlreadyExists(request.dir_name.clone()))
            }
            Err(e) => Err(BackendError::io(format!("create {}", path.display()), e)),
        }
    }

    #[instrument(skip_all, fields(root = %workspace.root.display()))]
    async fn destroy(&self, workspace: &Workspace) -> Result<(), BackendError> {
        match fs::remove_dir_all(&workspace.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("workspace directory already gone");
                Ok(())
            }
            Err(e) => Err(BackendError::io(
                format!("remove {}", workspace.root.display()),
                e,
            )),
        }
    }
}
