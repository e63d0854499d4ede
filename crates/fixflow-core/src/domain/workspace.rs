//! Workspace handle: a leased, disposable copy of the tree bound to one task.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{LeaseId, TaskId};

/// A workspace lease as handed to the orchestrator and capabilities.
///
/// The handle is plain data; the workspace manager owns the lease table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub lease_id: LeaseId,
    /// Lease owner.
    pub task_id: TaskId,
    pub root: PathBuf,
    /// Branch/ref name, derived from the task id and `attempt`.
    pub branch: String,
    pub base_ref: String,
    /// Per-task naming attempt (monotonic, starts at 1).
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// What to do with a workspace when its lease is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Leave the tree on disk for human inspection.
    Keep,
    /// Remove the tree and its branch.
    Destroy,
}
