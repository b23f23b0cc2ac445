use std::path::{Path, PathBuf};

use git2::{BranchType, Delta, DiffFindOptions, DiffOptions, ErrorCode, Oid, Repository};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// How a file differs from the base revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    TypeChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub status: ChangeStatus,
}

fn prune_options() -> git2::WorktreePruneOptions {
    let mut opts = git2::WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    opts
}

/// Thin wrapper over a git repository used for worktree provisioning.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "opening repository");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Resolve any revision spec (`HEAD`, branch, tag, sha) to a full commit id.
    pub fn resolve_revision(&self, rev: &str) -> Result<String> {
        let repo = self.repo()?;
        let object = repo.revparse_single(rev)?;
        let commit = object.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Create `branch` at `rev` and check it out as a new worktree at
    /// `worktree_path`. The worktree is named after the path's last component
    /// since branch names may contain slashes.
    pub fn create_worktree(&self, rev: &str, branch: &str, worktree_path: &Path) -> Result<()> {
        debug!(rev, branch, path = %worktree_path.display(), "creating worktree");
        let repo = self.repo()?;
        let commit = repo.revparse_single(rev)?.peel_to_commit()?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        debug!(commit = %commit.id(), name = worktree_name, "worktree created");
        Ok(())
    }

    /// Remove a worktree with its admin data. Missing worktrees and
    /// directories are not an error.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "removing worktree");
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        // Path comparison can miss on canonicalization; fall back to the folder name.
        let worktree_name = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(String::from)
            .or_else(|| {
                folder_name.as_ref().and_then(|fname| {
                    worktrees
                        .iter()
                        .flatten()
                        .find(|name| *name == fname.as_str())
                        .map(String::from)
                })
            });

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(&mut prune_options())) {
                    warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover admin dir keeps the branch marked as checked out.
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                debug!(dir = %admin_dir.display(), "removing worktree admin dir");
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        Ok(())
    }

    /// Delete a local branch. A missing branch counts as deleted.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let found = repo.find_branch(branch, BranchType::Local);
        match found {
            Ok(mut branch_ref) => {
                branch_ref.delete()?;
                debug!(branch, "branch deleted");
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(branch, "branch already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }

    /// Drop admin data of worktrees whose directory no longer exists.
    pub fn prune_stale_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in self.list_worktrees()? {
            if let Ok(wt) = repo.find_worktree(&name) {
                if !wt.path().exists() && wt.prune(Some(&mut prune_options())).is_ok() {
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            debug!(pruned, "pruned stale worktree references");
        }
        Ok(pruned)
    }

    /// Files changed in `worktree_path` relative to commit `base`, including
    /// committed, staged, unstaged and untracked changes. Sorted by path.
    pub fn changed_files(&self, base: &str, worktree_path: &Path) -> Result<Vec<FileChange>> {
        let repo = Repository::open(worktree_path)?;
        let base_tree = repo.find_commit(Oid::from_str(base)?)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let mut diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;
        let mut find = DiffFindOptions::new();
        find.renames(true).for_untracked(true);
        diff.find_similar(Some(&mut find))?;

        let mut changes: Vec<FileChange> = diff
            .deltas()
            .filter_map(|delta| {
                let status = match delta.status() {
                    Delta::Added | Delta::Untracked | Delta::Copied => ChangeStatus::Added,
                    Delta::Modified => ChangeStatus::Modified,
                    Delta::Deleted => ChangeStatus::Deleted,
                    Delta::Renamed => ChangeStatus::Renamed,
                    Delta::Typechange => ChangeStatus::TypeChanged,
                    _ => return None,
                };
                let path = delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())?;
                Some(FileChange {
                    path: path.to_string_lossy().into_owned(),
                    status,
                })
            })
            .collect();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }
}
