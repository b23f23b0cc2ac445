//! Workspace lifecycle: provisioning under disk and concurrency limits,
//! release, idempotent reclamation and staleness queries.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use super::backend::{FileChange, WorkspaceBackend};
use super::{Workspace, WorkspaceId, WorkspaceState};
use crate::config::Config;
use crate::events::{EventBus, OrchestrationEvent};
use crate::guard::{ResourceGuard, ResourcePermit};
use crate::store::StateStore;
use crate::util::{blocking, blocking_with_timeout, sanitize_ref_component};
use crate::{Error, Result};

const DISK_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Directory under which every checkout is created.
    pub root: PathBuf,
    /// Provisioning is refused below this many free bytes.
    pub min_free_disk_bytes: u64,
    /// Ceiling on simultaneously active workspaces.
    pub max_active: usize,
    /// First component of every workspace branch name.
    pub branch_prefix: String,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            min_free_disk_bytes: 1024 * 1024 * 1024,
            max_active: 8,
            branch_prefix: "taskforge".to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            root: config.worktrees_dir()?,
            min_free_disk_bytes: config.min_free_disk_bytes(),
            max_active: config.workspace.max_active,
            branch_prefix: config.workspace.branch_prefix.clone(),
        })
    }
}

struct Entry {
    workspace: Workspace,
    /// Concurrency slot, held while the workspace is active.
    permit: Option<ResourcePermit>,
}

/// A freshly acquired workspace its owner has not recorded yet.
///
/// Dropped while still armed (the owning task was aborted in between), it
/// reclaims the workspace in the background.
pub struct WorkspaceClaim {
    workspaces: Arc<WorkspaceManager>,
    id: Option<WorkspaceId>,
}

impl WorkspaceClaim {
    /// The owner has recorded the workspace and is responsible for it now.
    pub fn recorded(mut self) {
        self.id = None;
    }
}

impl Drop for WorkspaceClaim {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(workspace = %id.short(), "no runtime to reclaim unrecorded workspace");
            return;
        };
        let workspaces = self.workspaces.clone();
        runtime.spawn(async move {
            debug!(workspace = %id.short(), "reclaiming workspace its owner never recorded");
            if let Err(e) = workspaces.reclaim(id).await {
                warn!(workspace = %id.short(), error = %e, "failed to reclaim unrecorded workspace");
            }
        });
    }
}

pub struct WorkspaceManager {
    backend: Arc<dyn WorkspaceBackend>,
    config: WorkspaceConfig,
    guard: ResourceGuard,
    workspaces: RwLock<HashMap<WorkspaceId, Entry>>,
    events: EventBus,
    store: Option<Arc<dyn StateStore>>,
}

impl WorkspaceManager {
    pub fn new(backend: Arc<dyn WorkspaceBackend>, config: WorkspaceConfig) -> Self {
        let guard = ResourceGuard::new("workspaces", config.max_active);
        Self {
            backend,
            config,
            guard,
            workspaces: RwLock::new(HashMap::new()),
            events: EventBus::default(),
            store: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Number of workspaces currently holding a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.guard.in_use()
    }

    /// Free bytes on the filesystem holding the workspace root.
    pub async fn free_disk_space(&self) -> Result<u64> {
        let backend = self.backend.clone();
        let root = self.config.root.clone();
        // Disk enumeration can stall on unresponsive network mounts.
        blocking_with_timeout(DISK_QUERY_TIMEOUT, move || backend.free_disk_space(&root)).await
    }

    pub async fn resolve_revision(&self, rev: &str) -> Result<String> {
        let backend = self.backend.clone();
        let rev = rev.to_string();
        blocking(move || backend.resolve_revision(&rev)).await
    }

    /// Provision a workspace for `owner` at `base_ref`.
    ///
    /// Fails with `InsufficientDiskSpace` or `ConcurrencyLimitExceeded`
    /// before anything is created, or with `ProvisioningFailed` after
    /// partial state has been rolled back. Provisioning itself runs on its
    /// own task: if the caller stops waiting, the finished checkout is
    /// reclaimed instead of being left without an owner.
    pub async fn acquire(self: &Arc<Self>, owner: &str, base_ref: &str) -> Result<Workspace> {
        let available = self.free_disk_space().await?;
        if available < self.config.min_free_disk_bytes {
            warn!(
                owner,
                available,
                required = self.config.min_free_disk_bytes,
                "refusing workspace: insufficient disk space"
            );
            return Err(Error::InsufficientDiskSpace {
                available,
                required: self.config.min_free_disk_bytes,
            });
        }

        let permit = self
            .guard
            .try_acquire()
            .ok_or(Error::ConcurrencyLimitExceeded {
                limit: self.guard.limit(),
            })?;

        let id = WorkspaceId::new();
        let slug = format!("{}-{}", sanitize_ref_component(owner), id.short());
        let now = Utc::now();
        let workspace = Workspace {
            id,
            owner_task_id: owner.to_string(),
            path: self.config.root.join(&slug),
            base_ref: base_ref.to_string(),
            branch_ref: format!("{}/{}", self.config.branch_prefix, slug),
            state: WorkspaceState::Provisioned,
            created_at: now,
            last_used_at: now,
        };

        // Tracked while provisioning so the directory is never seen as an orphan.
        self.workspaces.write().await.insert(
            id,
            Entry {
                workspace: workspace.clone(),
                permit: None,
            },
        );

        let (tx, rx) = oneshot::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.provision(workspace, permit).await;
            if let Err(Ok(abandoned)) = tx.send(result) {
                warn!(
                    workspace = %abandoned.id.short(),
                    owner = %abandoned.owner_task_id,
                    "workspace provisioned after its caller went away, reclaiming"
                );
                if let Err(e) = manager.reclaim(abandoned.id).await {
                    warn!(workspace = %abandoned.id.short(), error = %e, "failed to reclaim abandoned workspace");
                }
            }
        });
        rx.await.map_err(|e| Error::TaskJoin(e.to_string()))?
    }

    /// Guard `id` until its owner has recorded it.
    pub fn claim(self: &Arc<Self>, id: WorkspaceId) -> WorkspaceClaim {
        WorkspaceClaim {
            workspaces: Arc::clone(self),
            id: Some(id),
        }
    }

    async fn provision(&self, mut workspace: Workspace, permit: ResourcePermit) -> Result<Workspace> {
        self.persist(&workspace).await;

        let backend = self.backend.clone();
        let base = workspace.base_ref.clone();
        let branch = workspace.branch_ref.clone();
        let path = workspace.path.clone();
        let created = blocking(move || {
            let commit = backend.resolve_revision(&base)?;
            match backend.create_checkout(&commit, &branch, &path) {
                Ok(()) => Ok(commit),
                Err(e) => {
                    if let Err(cleanup) = backend.remove_checkout(&path) {
                        warn!(path = %path.display(), error = %cleanup, "rollback: checkout removal failed");
                    }
                    if let Err(cleanup) = backend.delete_branch(&branch) {
                        warn!(branch = %branch, error = %cleanup, "rollback: branch deletion failed");
                    }
                    Err(e)
                }
            }
        })
        .await;

        let id = workspace.id;
        let owner = workspace.owner_task_id.clone();
        let commit = match created {
            Ok(commit) => commit,
            Err(e) => {
                self.workspaces.write().await.remove(&id);
                workspace.state = WorkspaceState::Reclaimed;
                self.persist(&workspace).await;
                warn!(owner = %owner, error = %e, "workspace provisioning failed");
                return Err(Error::ProvisioningFailed(format!("{}: {}", owner, e)));
            }
        };

        workspace.base_ref = commit;
        workspace.state = WorkspaceState::Active;
        self.workspaces.write().await.insert(
            id,
            Entry {
                workspace: workspace.clone(),
                permit: Some(permit),
            },
        );

        info!(
            workspace = %id.short(),
            owner = %owner,
            branch = %workspace.branch_ref,
            path = %workspace.path.display(),
            "workspace acquired"
        );
        self.events.emit(OrchestrationEvent::WorkspaceAcquired {
            workspace_id: id,
            owner,
        });
        self.persist(&workspace).await;
        Ok(workspace)
    }

    /// Mark a workspace idle and give back its concurrency slot. The
    /// checkout stays on disk.
    pub async fn release(&self, id: WorkspaceId) -> Result<()> {
        let snapshot = {
            let mut map = self.workspaces.write().await;
            let entry = map
                .get_mut(&id)
                .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))?;
            if entry.workspace.state == WorkspaceState::Idle {
                return Ok(());
            }
            entry.workspace.state = WorkspaceState::Idle;
            entry.workspace.last_used_at = Utc::now();
            entry.permit = None;
            entry.workspace.clone()
        };
        debug!(workspace = %id.short(), "workspace released");
        self.events
            .emit(OrchestrationEvent::WorkspaceReleased { workspace_id: id });
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Record use by the owner.
    pub async fn touch(&self, id: WorkspaceId) -> Result<()> {
        let mut map = self.workspaces.write().await;
        let entry = map
            .get_mut(&id)
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))?;
        entry.workspace.last_used_at = Utc::now();
        Ok(())
    }

    /// Delete the checkout and branch of a workspace.
    ///
    /// Workspaces this process does not track are looked up in the store,
    /// so a group recorded by an earlier run can still be cleaned up.
    /// Unknown ids and already-removed artifacts count as success. On
    /// failure the workspace stays tracked so a later sweep retries it.
    pub async fn reclaim(&self, id: WorkspaceId) -> Result<()> {
        let tracked = self.workspaces.read().await.get(&id).map(|e| e.workspace.clone());
        let in_memory = tracked.is_some();
        let snapshot = match tracked {
            Some(workspace) => workspace,
            None => match self.load_persisted(id).await {
                Some(record) if record.state != WorkspaceState::Reclaimed => record,
                _ => {
                    debug!(workspace = %id.short(), "reclaim of unknown workspace, nothing to do");
                    return Ok(());
                }
            },
        };

        let backend = self.backend.clone();
        let path = snapshot.path.clone();
        let branch = snapshot.branch_ref.clone();
        blocking(move || {
            backend.remove_checkout(&path)?;
            backend.delete_branch(&branch)
        })
        .await?;

        let removed = self.workspaces.write().await.remove(&id).is_some();
        if in_memory && !removed {
            // A concurrent reclaim got there first.
            return Ok(());
        }
        let mut workspace = snapshot;
        workspace.state = WorkspaceState::Reclaimed;
        info!(workspace = %id.short(), owner = %workspace.owner_task_id, "workspace reclaimed");
        self.events
            .emit(OrchestrationEvent::WorkspaceReclaimed { workspace_id: id });
        self.persist(&workspace).await;
        Ok(())
    }

    /// Remove a checkout directory nothing tracks, with its branch.
    pub async fn reclaim_orphan(&self, path: &Path) -> Result<()> {
        let backend = self.backend.clone();
        let path = path.to_path_buf();
        let branch = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|name| format!("{}/{}", self.config.branch_prefix, name));
        blocking({
            let path = path.clone();
            move || {
                backend.remove_checkout(&path)?;
                if let Some(branch) = branch {
                    backend.delete_branch(&branch)?;
                }
                Ok(())
            }
        })
        .await?;

        for mut record in self.persisted_records().await {
            if record.path == path && record.state != WorkspaceState::Reclaimed {
                record.state = WorkspaceState::Reclaimed;
                self.persist(&record).await;
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: WorkspaceId) -> Option<Workspace> {
        self.workspaces
            .read()
            .await
            .get(&id)
            .map(|e| e.workspace.clone())
    }

    pub async fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self
            .workspaces
            .read()
            .await
            .values()
            .map(|e| e.workspace.clone())
            .collect();
        all.sort_by_key(|w| w.created_at);
        all
    }

    /// Idle workspaces whose last use predates `now - older_than`.
    pub async fn find_stale(&self, older_than: Duration) -> Vec<Workspace> {
        self.find_stale_at(Utc::now(), older_than).await
    }

    pub async fn find_stale_at(&self, now: DateTime<Utc>, older_than: Duration) -> Vec<Workspace> {
        let retention = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut stale: Vec<Workspace> = self
            .workspaces
            .read()
            .await
            .values()
            .map(|e| &e.workspace)
            .filter(|w| w.state == WorkspaceState::Idle && w.last_used_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|w| w.last_used_at);
        stale
    }

    /// Directories under the workspace root that no live workspace owns and
    /// that have gone untouched for at least `older_than`.
    ///
    /// The root may be shared with other processes. Their persisted records
    /// protect provisioned and active checkouts outright, and idle ones
    /// until their last use is older than `older_than`. A directory with no
    /// record at all is aged by its modification time.
    pub async fn find_orphans(&self, older_than: Duration) -> Result<Vec<PathBuf>> {
        let mut protected: HashSet<PathBuf> = self
            .workspaces
            .read()
            .await
            .values()
            .map(|e| e.workspace.path.clone())
            .collect();
        let mut idle_since: HashMap<PathBuf, DateTime<Utc>> = HashMap::new();
        if let Some(store) = &self.store {
            for record in store.list_workspaces().await? {
                match record.state {
                    WorkspaceState::Provisioned | WorkspaceState::Active => {
                        protected.insert(record.path);
                    }
                    WorkspaceState::Idle => {
                        idle_since.insert(record.path, record.last_used_at);
                    }
                    WorkspaceState::Reclaimed => {}
                }
            }
        }

        let retention = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let root = self.config.root.clone();
        blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut orphans = Vec::new();
            for entry in std::fs::read_dir(&root)?.flatten() {
                let path = entry.path();
                if !path.is_dir() || protected.contains(&path) {
                    continue;
                }
                let last_touched = match idle_since.get(&path) {
                    Some(at) => *at,
                    None => DateTime::<Utc>::from(entry.metadata()?.modified()?),
                };
                if last_touched <= cutoff {
                    orphans.push(path);
                } else {
                    debug!(path = %path.display(), "untracked checkout is too recent to remove");
                }
            }
            orphans.sort();
            Ok(orphans)
        })
        .await
    }

    /// Files changed in a workspace relative to its base commit.
    pub async fn changed_files(&self, id: WorkspaceId) -> Result<Vec<FileChange>> {
        let workspace = self
            .get(id)
            .await
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))?;
        let backend = self.backend.clone();
        blocking(move || backend.changed_files(&workspace.base_ref, &workspace.path)).await
    }

    async fn load_persisted(&self, id: WorkspaceId) -> Option<Workspace> {
        let store = self.store.as_ref()?;
        match store.load_workspace(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(workspace = %id.short(), error = %e, "failed to load workspace record");
                None
            }
        }
    }

    async fn persisted_records(&self) -> Vec<Workspace> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        store.list_workspaces().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to list workspace records");
            Vec::new()
        })
    }

    async fn persist(&self, workspace: &Workspace) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_workspace(workspace).await {
                warn!(workspace = %workspace.id.short(), error = %e, "failed to persist workspace");
            }
        }
    }

    #[cfg(test)]
    async fn set_last_used(&self, id: WorkspaceId, at: DateTime<Utc>) {
        if let Some(entry) = self.workspaces.write().await.get_mut(&id) {
            entry.workspace.last_used_at = at;
        }
    }
}
