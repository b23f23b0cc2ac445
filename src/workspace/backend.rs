//! Filesystem/VCS operations behind workspaces.
//!
//! The trait is synchronous; [`super::WorkspaceManager`] runs every call on
//! the blocking pool.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::debug;

use crate::git::GitOps;
use crate::Result;

pub use crate::git::{ChangeStatus, FileChange};

pub trait WorkspaceBackend: Send + Sync {
    /// Bytes available on the filesystem holding `path`.
    fn free_disk_space(&self, path: &Path) -> Result<u64>;

    /// Resolve a revision spec to a commit id.
    fn resolve_revision(&self, rev: &str) -> Result<String>;

    /// Create `branch` at `base` and check it out at `path`.
    fn create_checkout(&self, base: &str, branch: &str, path: &Path) -> Result<()>;

    /// Remove the checkout at `path`. Succeeds if it is already gone.
    fn remove_checkout(&self, path: &Path) -> Result<()>;

    /// Delete `branch`. Succeeds if it is already gone.
    fn delete_branch(&self, branch: &str) -> Result<()>;

    /// Files in the checkout at `path` that differ from `base`.
    fn changed_files(&self, base: &str, path: &Path) -> Result<Vec<FileChange>>;
}

/// Git worktrees of one repository, with disk space read from the OS.
pub struct GitWorktreeBackend {
    git: GitOps,
}

impl GitWorktreeBackend {
    pub fn new(repo_path: &Path) -> Result<Self> {
        Ok(Self {
            git: GitOps::new(repo_path)?,
        })
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }
}

/// Closest ancestor of `path` that exists, canonicalized.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return canonical;
        }
        if !current.pop() {
            return PathBuf::from("/");
        }
    }
}

/// Available bytes on the disk whose mount point is the longest prefix of
/// `path`. `None` if no mounted disk covers it.
pub fn available_space_for(path: &Path) -> Option<u64> {
    let target = existing_ancestor(path);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

impl WorkspaceBackend for GitWorktreeBackend {
    fn free_disk_space(&self, path: &Path) -> Result<u64> {
        match available_space_for(path) {
            Some(bytes) => Ok(bytes),
            None => {
                // Containers sometimes expose no disk list; do not block provisioning.
                debug!(path = %path.display(), "no disk found for path, assuming unlimited");
                Ok(u64::MAX)
            }
        }
    }

    fn resolve_revision(&self, rev: &str) -> Result<String> {
        self.git.resolve_revision(rev)
    }

    fn create_checkout(&self, base: &str, branch: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.git.create_worktree(base, branch, path)
    }

    fn remove_checkout(&self, path: &Path) -> Result<()> {
        self.git.remove_worktree(path)
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git.delete_branch(branch)
    }

    fn changed_files(&self, base: &str, path: &Path) -> Result<Vec<FileChange>> {
        self.git.changed_files(base, path)
    }
}
