//! WorkspaceBackend port - VCS plumbing（worktree の作成・削除）
//!
//! WorkspaceManager は lease と上限だけを管理し、実際のツリー操作はこの trait に委譲します。
//!
//! # 実装
//! - **DirectoryBackend**: 空ディレクトリ（開発・テスト用）
//! - **GitWorktreeBackend**: `git worktree`（本番用）

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{TaskId, Workspace};

/// What the manager asks a backend to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRequest {
    pub task_id: TaskId,
    /// Branch/ref name to create.
    pub branch: String,
    /// Directory name (relative to the backend's root).
    pub dir_name: String,
    pub base_ref: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// The name is taken (e.g. abandoned by a crashed process). The manager
    /// picks the next attempt number; this is not a creation failure.
    #[error("workspace name already in use: {0}")]
    AlreadyExists(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
}

impl BackendError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackendError::Io {
            context: context.into(),
            source,
        }
    }
}

/// WorkspaceBackend はツリーの作成と削除を行う
///
/// # 契約
/// - `create` は原子的: 失敗時に中途半端なツリーを残さない（努力義務）
/// - `destroy` は冪等: 既に消えている・一部だけ消えているツリーでも Ok を返す
#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    async fn create(&self, request: &WorkspaceRequest) -> Result<PathBuf, BackendError>;

    async fn destroy(&self, workspace: &Workspace) -> Result<(), BackendError>;
}
