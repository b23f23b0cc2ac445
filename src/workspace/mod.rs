//! Isolated per-task workspaces.
//!
//! A workspace is a git worktree checked out on its own branch, owned by
//! exactly one task (or compare sub-task) at a time. [`WorkspaceManager`]
//! is the only component that creates or destroys them; everything else
//! refers to them by [`WorkspaceId`].

pub mod backend;
pub mod manager;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::uuid_id;

pub use backend::{GitWorktreeBackend, WorkspaceBackend};
pub use manager::{WorkspaceClaim, WorkspaceConfig, WorkspaceManager};

uuid_id!(
    /// Identifier of a provisioned workspace.
    WorkspaceId
);

/// Lifecycle: provisioned, active, idle, reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    /// Checkout exists but no owner has started using it.
    Provisioned,
    /// Held by its owner.
    Active,
    /// Released by its owner; eligible for reclamation once stale.
    Idle,
    /// Checkout and branch deleted.
    Reclaimed,
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceState::Provisioned => write!(f, "provisioned"),
            WorkspaceState::Active => write!(f, "active"),
            WorkspaceState::Idle => write!(f, "idle"),
            WorkspaceState::Reclaimed => write!(f, "reclaimed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    /// Task or sub-task that owns the checkout.
    pub owner_task_id: String,
    pub path: PathBuf,
    /// Commit the checkout was created from.
    pub base_ref: String,
    /// Branch created for this workspace.
    pub branch_ref: String,
    pub state: WorkspaceState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Workspace {
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            WorkspaceState::Provisioned | WorkspaceState::Active
        )
    }
}
