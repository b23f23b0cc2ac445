//! The request-handling surface.
//!
//! [`Forge`] wires the workspace manager, the group controller, the compare
//! orchestrator and the sweeper to one event bus and one state store, and
//! exposes the operations an outer transport (CLI, server) calls.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cleanup::{ActorHandle, CleanupActor, CleanupSweeper, SweepReport};
use crate::config::Config;
use crate::core::{ExecutionStage, GroupMode, Task};
use crate::events::{EventBus, EventEnvelope};
use crate::orchestration::compare::{CompareConfig, CompareFiles, CompareId, CompareOrchestrator, CompareTask};
use crate::orchestration::executor::ExecutorRegistry;
use crate::orchestration::group::{self, GroupController, GroupId, GroupSettings, GroupSpec, TaskGroup};
use crate::store::{JsonFileStore, StateStore};
use crate::workspace::{GitWorktreeBackend, WorkspaceBackend, WorkspaceConfig, WorkspaceId, WorkspaceManager};
use crate::Result;

pub struct Forge {
    config: Config,
    events: EventBus,
    workspaces: Arc<WorkspaceManager>,
    groups: GroupController,
    compares: CompareOrchestrator,
    sweeper: Arc<CleanupSweeper>,
}

impl Forge {
    /// Production wiring: git worktrees of `repo_path`, command-line
    /// executors from the config, JSON state under `state_dir`.
    pub fn from_config(config: Config, repo_path: &Path) -> Result<Self> {
        config.ensure_dirs()?;
        let backend = GitWorktreeBackend::new(repo_path)?;
        match backend.git().prune_stale_worktrees() {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "pruned worktrees left by a previous run"),
            Err(e) => warn!(error = %e, "stale worktree pruning failed"),
        }
        let store = JsonFileStore::new(config.state_dir()?);
        let executors = ExecutorRegistry::from_config(&config);
        info!(repo = %repo_path.display(), executors = ?executors.kinds(), "taskforge initialized");
        Self::new(config, Arc::new(backend), executors, Arc::new(store))
    }

    pub fn new(
        config: Config,
        backend: Arc<dyn WorkspaceBackend>,
        executors: ExecutorRegistry,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventBus::default();
        let workspaces = Arc::new(
            WorkspaceManager::new(backend, WorkspaceConfig::from_config(&config)?)
                .with_events(events.clone())
                .with_store(store.clone()),
        );
        let groups = GroupController::new(
            workspaces.clone(),
            executors.clone(),
            events.clone(),
            store.clone(),
            GroupSettings::from_config(&config),
        );
        let compares = CompareOrchestrator::new(
            workspaces.clone(),
            executors,
            events.clone(),
            store,
            CompareConfig::from_config(&config),
        );
        let sweeper = Arc::new(CleanupSweeper::new(workspaces.clone(), events.clone()));

        Ok(Self {
            config,
            events,
            workspaces,
            groups,
            compares,
            sweeper,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Dry-run planning; nothing is started or persisted.
    pub fn plan_group(
        &self,
        tasks: &[Task],
        mode: GroupMode,
        max_parallel: Option<usize>,
    ) -> Result<Vec<ExecutionStage>> {
        group::plan_group(tasks, mode, max_parallel)
    }

    pub async fn start_group(&self, spec: GroupSpec) -> Result<GroupId> {
        self.groups.start_group(spec).await
    }

    pub async fn get_group_status(&self, id: GroupId) -> Result<TaskGroup> {
        self.groups.get_group_status(id).await
    }

    pub async fn list_groups(&self) -> Vec<TaskGroup> {
        self.groups.list_groups().await
    }

    pub async fn cancel_group(&self, id: GroupId) -> Result<()> {
        self.groups.cancel_group(id).await
    }

    pub async fn wait_for_group(&self, id: GroupId) -> Result<TaskGroup> {
        self.groups.wait_for_group(id).await
    }

    pub async fn cleanup_group(&self, id: GroupId) -> Result<Vec<WorkspaceId>> {
        self.groups.cleanup_group(id).await
    }

    pub async fn start_compare(&self, instruction: &str, repository_ref: &str) -> Result<CompareId> {
        self.compares.start_compare(instruction, repository_ref).await
    }

    pub async fn get_compare_status(&self, id: CompareId) -> Result<CompareTask> {
        self.compares.get_compare_status(id).await
    }

    pub async fn cancel_compare(&self, id: CompareId) -> Result<()> {
        self.compares.cancel_compare(id).await
    }

    pub async fn wait_for_compare(&self, id: CompareId) -> Result<CompareTask> {
        self.compares.wait_for_compare(id).await
    }

    pub async fn get_compare_files(&self, id: CompareId) -> Result<CompareFiles> {
        self.compares.get_compare_files(id).await
    }

    pub async fn sweep_stale_workspaces(&self, retention: Duration) -> SweepReport {
        self.sweeper.sweep(retention).await
    }

    /// Start periodic sweeping with the configured interval and retention.
    pub fn spawn_sweeper(&self) -> ActorHandle {
        CleanupActor::spawn(
            self.sweeper.clone(),
            self.config.cleanup.interval(),
            self.config.cleanup.retention(),
        )
    }
}
