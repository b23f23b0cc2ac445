//! Persistence of groups, compare tasks and workspaces.
//!
//! Saves are idempotent upserts keyed by entity id. Callers treat the store
//! as eventually consistent: a failed write is logged by the caller and
//! never stops orchestration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::orchestration::compare::{CompareId, CompareTask};
use crate::orchestration::group::{GroupId, TaskGroup};
use crate::workspace::{Workspace, WorkspaceId};
use crate::Result;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_group(&self, group: &TaskGroup) -> Result<()>;
    async fn load_group(&self, id: GroupId) -> Result<Option<TaskGroup>>;
    async fn save_compare(&self, compare: &CompareTask) -> Result<()>;
    async fn load_compare(&self, id: CompareId) -> Result<Option<CompareTask>>;
    async fn save_workspace(&self, workspace: &Workspace) -> Result<()>;
    async fn load_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>>;
    /// Every workspace record, including reclaimed ones.
    async fn list_workspaces(&self) -> Result<Vec<Workspace>>;
}

/// In-process store. Counts writes so callers can assert on side effects.
#[derive(Default)]
pub struct MemoryStore {
    groups: RwLock<HashMap<GroupId, TaskGroup>>,
    compares: RwLock<HashMap<CompareId, CompareTask>>,
    workspaces: RwLock<HashMap<WorkspaceId, Workspace>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_group(&self, group: &TaskGroup) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.groups.write().await.insert(group.id, group.clone());
        Ok(())
    }

    async fn load_group(&self, id: GroupId) -> Result<Option<TaskGroup>> {
        Ok(self.groups.read().await.get(&id).cloned())
    }

    async fn save_compare(&self, compare: &CompareTask) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.compares.write().await.insert(compare.id, compare.clone());
        Ok(())
    }

    async fn load_compare(&self, id: CompareId) -> Result<Option<CompareTask>> {
        Ok(self.compares.read().await.get(&id).cloned())
    }

    async fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.workspaces
            .write()
            .await
            .insert(workspace.id, workspace.clone());
        Ok(())
    }

    async fn load_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>> {
        Ok(self.workspaces.read().await.get(&id).cloned())
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        Ok(self.workspaces.read().await.values().cloned().collect())
    }
}

/// One JSON document per entity under `<root>/{groups,compares,workspaces}`.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", id))
    }

    async fn write<T: Serialize + Sync>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        let path = self.entity_path(kind, id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "state written");
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        let path = self.entity_path(kind, id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable document of `kind`. Unparseable files are skipped.
    async fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let dir = self.root.join(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable state file"),
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save_group(&self, group: &TaskGroup) -> Result<()> {
        self.write("groups", &group.id.to_string(), group).await
    }

    async fn load_group(&self, id: GroupId) -> Result<Option<TaskGroup>> {
        self.read("groups", &id.to_string()).await
    }

    async fn save_compare(&self, compare: &CompareTask) -> Result<()> {
        self.write("compares", &compare.id.to_string(), compare).await
    }

    async fn load_compare(&self, id: CompareId) -> Result<Option<CompareTask>> {
        self.read("compares", &id.to_string()).await
    }

    async fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        self.write("workspaces", &workspace.id.to_string(), workspace)
            .await
    }

    async fn load_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>> {
        self.read("workspaces", &id.to_string()).await
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.list("workspaces").await
    }
}
