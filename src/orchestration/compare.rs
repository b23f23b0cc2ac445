//! Multi-agent comparison.
//!
//! One instruction runs against every configured executor kind at the same
//! base revision, each in its own workspace. Sub-tasks are independent: a
//! failing or unprovisionable sub-task never affects its siblings, and the
//! compare status is always [`aggregate_status`] of the sub-task statuses.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{collect_events, ExecutionRequest, ExecutorKind, ExecutorRegistry};
use crate::config::Config;
use crate::events::{EventBus, OrchestrationEvent};
use crate::guard::{ResourceGuard, ResourcePermit};
use crate::id::uuid_id;
use crate::store::StateStore;
use crate::workspace::backend::{ChangeStatus, FileChange};
use crate::workspace::{WorkspaceId, WorkspaceManager};
use crate::{Error, Result};

uuid_id!(
    /// Identifier of a compare task.
    CompareId
);

uuid_id!(
    /// Identifier of one executor's run inside a compare task.
    SubTaskId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompareStatus {
    #[default]
    Pending,
    Running,
    Completed,
    PartialSuccess,
    Failed,
    Cancelling,
    Cancelled,
}

impl CompareStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompareStatus::Completed
                | CompareStatus::PartialSuccess
                | CompareStatus::Failed
                | CompareStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CompareStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompareStatus::Pending => "pending",
            CompareStatus::Running => "running",
            CompareStatus::Completed => "completed",
            CompareStatus::PartialSuccess => "partial_success",
            CompareStatus::Failed => "failed",
            CompareStatus::Cancelling => "cancelling",
            CompareStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubTaskStatus::Completed | SubTaskStatus::Failed | SubTaskStatus::Cancelled
        )
    }
}

/// Compare status as a function of its sub-task statuses.
///
/// Order-independent and safe to recompute at any time. While anything is
/// still running the result is `running`, or `cancelling` once
/// cancellation was requested. When every sub-task is terminal:
/// - any `cancelled` sub-task makes the compare `cancelled`
/// - all `completed` gives `completed`
/// - none `completed` gives `failed`
/// - otherwise `partial_success`
pub fn aggregate_status<I>(statuses: I, cancel_requested: bool) -> CompareStatus
where
    I: IntoIterator<Item = SubTaskStatus>,
{
    let (mut pending, mut active, mut completed, mut failed, mut cancelled) = (0, 0, 0, 0, 0);
    for status in statuses {
        match status {
            SubTaskStatus::Pending => pending += 1,
            SubTaskStatus::Running => active += 1,
            SubTaskStatus::Completed => completed += 1,
            SubTaskStatus::Failed => failed += 1,
            SubTaskStatus::Cancelled => cancelled += 1,
        }
    }

    if pending + active > 0 {
        return if cancel_requested {
            CompareStatus::Cancelling
        } else if active + completed + failed + cancelled == 0 {
            CompareStatus::Pending
        } else {
            CompareStatus::Running
        };
    }
    if cancelled > 0 {
        CompareStatus::Cancelled
    } else if failed == 0 && completed > 0 {
        CompareStatus::Completed
    } else if completed == 0 {
        CompareStatus::Failed
    } else {
        CompareStatus::PartialSuccess
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: SubTaskId,
    pub executor: ExecutorKind,
    pub status: SubTaskStatus,
    pub workspace_id: Option<WorkspaceId>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    fn new(executor: ExecutorKind) -> Self {
        Self {
            id: SubTaskId::new(),
            executor,
            status: SubTaskStatus::Pending,
            workspace_id: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn finish(&mut self, result: Result<String>) {
        match result {
            Ok(output) => {
                self.status = SubTaskStatus::Completed;
                self.output = Some(output);
            }
            Err(Error::Cancelled) => self.status = SubTaskStatus::Cancelled,
            Err(e) => {
                self.status = SubTaskStatus::Failed;
                self.error = Some(format!("{}: {}", self.executor, e));
            }
        }
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareTask {
    pub id: CompareId,
    pub instruction: String,
    /// Revision spec as submitted.
    pub repository_ref: String,
    /// Commit every sub-task starts from.
    pub base_revision: String,
    pub sub_tasks: BTreeMap<ExecutorKind, SubTask>,
    pub status: CompareStatus,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CompareTask {
    fn refresh_status(&mut self) {
        self.status = aggregate_status(
            self.sub_tasks.values().map(|s| s.status),
            self.cancel_requested,
        );
    }
}

/// One changed path and how each executor changed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareFileEntry {
    pub path: String,
    pub statuses: BTreeMap<ExecutorKind, ChangeStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareFiles {
    pub files: Vec<CompareFileEntry>,
    /// More paths changed than `files` holds.
    pub truncated: bool,
    /// Number of distinct changed paths across all executors.
    pub total_count: usize,
}

/// Union of per-executor changes, sorted by path and capped at `max_files`.
pub fn merge_changes<I>(changes: I, max_files: usize) -> CompareFiles
where
    I: IntoIterator<Item = (ExecutorKind, Vec<FileChange>)>,
{
    let mut by_path: BTreeMap<String, BTreeMap<ExecutorKind, ChangeStatus>> = BTreeMap::new();
    for (kind, files) in changes {
        for change in files {
            by_path.entry(change.path).or_default().insert(kind, change.status);
        }
    }

    let total_count = by_path.len();
    let files = by_path
        .into_iter()
        .take(max_files)
        .map(|(path, statuses)| CompareFileEntry { path, statuses })
        .collect();
    CompareFiles {
        files,
        truncated: total_count > max_files,
        total_count,
    }
}

#[derive(Debug, Clone)]
pub struct CompareConfig {
    pub executors: Vec<ExecutorKind>,
    /// Compare tasks allowed to run at once, process-wide.
    pub max_concurrent: usize,
    /// Free bytes required before any compare workspace is provisioned.
    pub min_free_disk_bytes: u64,
    pub max_files_count: usize,
    pub cancel_grace: Duration,
    /// How long a finished compare stays in memory.
    pub retain_finished: Duration,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            executors: ExecutorKind::ALL.to_vec(),
            max_concurrent: 3,
            min_free_disk_bytes: 4 * 1024 * 1024 * 1024,
            max_files_count: 500,
            cancel_grace: Duration::from_secs(30),
            retain_finished: Duration::from_secs(60 * 60),
        }
    }
}

impl CompareConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            executors: config.compare.executors.clone(),
            max_concurrent: config.compare.max_concurrent,
            min_free_disk_bytes: config.compare_min_free_disk_bytes(),
            max_files_count: config.compare.max_files_count,
            cancel_grace: config.cleanup.cancel_grace(),
            retain_finished: config.cleanup.finished_ttl(),
        }
    }
}

struct CompareHandle {
    compare: RwLock<CompareTask>,
    cancel: CancellationToken,
    status: watch::Sender<CompareStatus>,
}

struct Inner {
    workspaces: Arc<WorkspaceManager>,
    executors: ExecutorRegistry,
    events: EventBus,
    store: Arc<dyn StateStore>,
    config: CompareConfig,
    guard: ResourceGuard,
    compares: RwLock<HashMap<CompareId, Arc<CompareHandle>>>,
}

#[derive(Clone)]
pub struct CompareOrchestrator {
    inner: Arc<Inner>,
}

impl CompareOrchestrator {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        executors: ExecutorRegistry,
        events: EventBus,
        store: Arc<dyn StateStore>,
        config: CompareConfig,
    ) -> Self {
        let guard = ResourceGuard::new("compares", config.max_concurrent);
        Self {
            inner: Arc::new(Inner {
                workspaces,
                executors,
                events,
                store,
                config,
                guard,
                compares: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Compare tasks currently holding a concurrency slot.
    pub fn running_count(&self) -> usize {
        self.inner.guard.in_use()
    }

    /// Start a compare task.
    ///
    /// The concurrency and disk gates are checked before any workspace is
    /// provisioned; violating either fails the call with nothing created.
    pub async fn start_compare(&self, instruction: &str, repository_ref: &str) -> Result<CompareId> {
        self.inner.evict_finished().await;
        let kinds = self.inner.config.executors.clone();
        if kinds.is_empty() {
            return Err(Error::Validation("no executors configured for compare".into()));
        }

        let permit = self
            .inner
            .guard
            .try_acquire()
            .ok_or(Error::TooManyCompareTasks {
                limit: self.inner.guard.limit(),
            })?;

        let available = self.inner.workspaces.free_disk_space().await?;
        let required = self.inner.config.min_free_disk_bytes;
        if available < required {
            warn!(available, required, "not enough disk space to start compare");
            return Err(Error::InsufficientDiskSpace {
                available,
                required,
            });
        }

        let base_revision = self.inner.workspaces.resolve_revision(repository_ref).await?;

        let compare = CompareTask {
            id: CompareId::new(),
            instruction: instruction.to_string(),
            repository_ref: repository_ref.to_string(),
            base_revision,
            sub_tasks: kinds.iter().map(|k| (*k, SubTask::new(*k))).collect(),
            status: CompareStatus::Running,
            cancel_requested: false,
            created_at: Utc::now(),
            completed_at: None,
        };
        let id = compare.id;
        info!(
            compare = %id.short(),
            base = %compare.base_revision,
            executors = kinds.len(),
            "starting compare task"
        );

        let (status, _) = watch::channel(compare.status);
        let handle = Arc::new(CompareHandle {
            compare: RwLock::new(compare.clone()),
            cancel: CancellationToken::new(),
            status,
        });
        self.inner.compares.write().await.insert(id, handle.clone());
        self.inner.events.emit(OrchestrationEvent::CompareStatusChanged {
            compare_id: id,
            status: compare.status,
        });
        self.inner.persist(&compare).await;

        tokio::spawn(drive(self.inner.clone(), handle, permit));
        Ok(id)
    }

    pub async fn get_compare_status(&self, id: CompareId) -> Result<CompareTask> {
        if let Some(handle) = self.inner.handle(id).await {
            return Ok(handle.compare.read().await.clone());
        }
        self.inner.load(id).await
    }

    /// Request cancellation of every non-terminal sub-task.
    ///
    /// Sub-tasks that already finished keep their status, so a compare whose
    /// sub-tasks all finished is left as it is.
    pub async fn cancel_compare(&self, id: CompareId) -> Result<()> {
        let Some(handle) = self.inner.handle(id).await else {
            self.inner.load(id).await?;
            return Ok(());
        };

        let changed = self
            .inner
            .update(&handle, |compare| {
                if compare.status.is_terminal() || compare.cancel_requested {
                    false
                } else {
                    compare.cancel_requested = true;
                    true
                }
            })
            .await;
        if changed {
            info!(compare = %id.short(), "cancelling compare task");
            handle.cancel.cancel();
        }
        Ok(())
    }

    pub async fn wait_for_compare(&self, id: CompareId) -> Result<CompareTask> {
        let Some(handle) = self.inner.handle(id).await else {
            return self.inner.load(id).await;
        };
        let mut rx = handle.status.subscribe();
        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        let compare = handle.compare.read().await.clone();
        Ok(compare)
    }

    /// Files each executor changed relative to the shared base revision.
    ///
    /// Computed on request from the sub-task workspaces. Sub-tasks without a
    /// workspace, or whose workspace was already reclaimed, contribute
    /// nothing.
    pub async fn get_compare_files(&self, id: CompareId) -> Result<CompareFiles> {
        let compare = self.get_compare_status(id).await?;
        let lookups = compare.sub_tasks.values().filter_map(|sub_task| {
            let workspace = sub_task.workspace_id?;
            let kind = sub_task.executor;
            let workspaces = self.inner.workspaces.clone();
            Some(async move { (kind, workspaces.changed_files(workspace).await) })
        });

        let mut changes = Vec::new();
        for (kind, result) in join_all(lookups).await {
            match result {
                Ok(files) => changes.push((kind, files)),
                Err(Error::WorkspaceNotFound(_)) => {
                    debug!(compare = %id.short(), executor = %kind, "workspace already reclaimed")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(merge_changes(changes, self.inner.config.max_files_count))
    }
}

impl Inner {
    async fn handle(&self, id: CompareId) -> Option<Arc<CompareHandle>> {
        self.compares.read().await.get(&id).cloned()
    }

    async fn load(&self, id: CompareId) -> Result<CompareTask> {
        self.store
            .load_compare(id)
            .await?
            .ok_or_else(|| Error::CompareNotFound(id.to_string()))
    }

    /// Drop compares that finished more than `retain_finished` ago. Each is
    /// saved once more first and stays in memory if that write fails.
    async fn evict_finished(&self) {
        let retain = chrono::Duration::from_std(self.config.retain_finished).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(retain).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let handles: Vec<(CompareId, Arc<CompareHandle>)> = self
            .compares
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        for (id, handle) in handles {
            let snapshot = handle.compare.read().await.clone();
            let expired = snapshot.status.is_terminal() && snapshot.completed_at.is_some_and(|at| at <= cutoff);
            if !expired {
                continue;
            }
            match self.store.save_compare(&snapshot).await {
                Ok(()) => {
                    self.compares.write().await.remove(&id);
                    debug!(compare = %id.short(), "finished compare evicted from memory");
                }
                Err(e) => warn!(compare = %id.short(), error = %e, "keeping finished compare in memory, store write failed"),
            }
        }
    }

    /// Apply `f`, recompute the aggregate status, then publish and persist.
    async fn update<T>(&self, handle: &CompareHandle, f: impl FnOnce(&mut CompareTask) -> T) -> T {
        let (out, snapshot, changed) = {
            let mut compare = handle.compare.write().await;
            let before = compare.status;
            let out = f(&mut compare);
            compare.refresh_status();
            if compare.status.is_terminal() && compare.completed_at.is_none() {
                compare.completed_at = Some(Utc::now());
            }
            (out, compare.clone(), compare.status != before)
        };

        if changed {
            debug!(compare = %snapshot.id.short(), status = %snapshot.status, "compare status changed");
            handle.status.send_replace(snapshot.status);
            self.events.emit(OrchestrationEvent::CompareStatusChanged {
                compare_id: snapshot.id,
                status: snapshot.status,
            });
        }
        self.persist(&snapshot).await;
        out
    }

    async fn update_sub_task(&self, handle: &CompareHandle, kind: ExecutorKind, f: impl FnOnce(&mut SubTask)) {
        let (compare_id, status) = self
            .update(handle, |compare| {
                let status = compare.sub_tasks.get_mut(&kind).map(|sub| {
                    f(sub);
                    sub.status
                });
                (compare.id, status)
            })
            .await;
        if let Some(status) = status {
            self.events.emit(OrchestrationEvent::SubTaskStatusChanged {
                compare_id,
                executor: kind,
                status,
            });
        }
    }

    /// Reclaim the checkout of a sub-task that did not finish on its own.
    async fn reclaim_sub_task_workspace(&self, handle: &CompareHandle, kind: ExecutorKind) {
        let workspace = handle
            .compare
            .read()
            .await
            .sub_tasks
            .get(&kind)
            .and_then(|sub| sub.workspace_id);
        if let Some(workspace) = workspace {
            if let Err(e) = self.workspaces.reclaim(workspace).await {
                warn!(workspace = %workspace.short(), executor = %kind, error = %e, "failed to reclaim sub-task workspace");
            }
        }
    }

    async fn persist(&self, compare: &CompareTask) {
        if let Err(e) = self.store.save_compare(compare).await {
            warn!(compare = %compare.id.short(), error = %e, "failed to persist compare task");
        }
    }
}

async fn drive(inner: Arc<Inner>, handle: Arc<CompareHandle>, permit: ResourcePermit) {
    let (id, kinds, instruction, base) = {
        let compare = handle.compare.read().await;
        (
            compare.id,
            compare.sub_tasks.keys().copied().collect::<Vec<_>>(),
            compare.instruction.clone(),
            compare.base_revision.clone(),
        )
    };

    let mut in_flight = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, ExecutorKind> = HashMap::new();
    for kind in kinds {
        let abort = in_flight.spawn(run_sub_task(
            inner.clone(),
            handle.clone(),
            kind,
            instruction.clone(),
            base.clone(),
            handle.cancel.child_token(),
        ));
        running.insert(abort.id(), kind);
    }

    let mut grace_deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled(), if grace_deadline.is_none() => {
                grace_deadline = Some(Instant::now() + inner.config.cancel_grace);
            }
            _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                warn!(compare = %id.short(), in_flight = in_flight.len(), "grace period elapsed, aborting sub-tasks");
                in_flight.abort_all();
                while in_flight.join_next().await.is_some() {}
                break;
            }
            joined = in_flight.join_next_with_id() => {
                match joined {
                    Some(Ok((task, ()))) => {
                        running.remove(&task);
                    }
                    Some(Err(e)) => {
                        if let Some(kind) = running.remove(&e.id()) {
                            warn!(compare = %id.short(), executor = %kind, error = %e, "sub-task crashed");
                            inner.reclaim_sub_task_workspace(&handle, kind).await;
                            let message = e.to_string();
                            inner
                                .update_sub_task(&handle, kind, |sub| {
                                    sub.finish(Err(Error::TaskJoin(message)))
                                })
                                .await;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Sub-tasks still unfinished here were aborted; reclaim their checkouts.
    for kind in running.into_values() {
        let unfinished = matches!(
            handle.compare.read().await.sub_tasks.get(&kind),
            Some(sub) if !sub.status.is_terminal()
        );
        if !unfinished {
            continue;
        }
        inner.reclaim_sub_task_workspace(&handle, kind).await;
        inner
            .update_sub_task(&handle, kind, |sub| sub.finish(Err(Error::Cancelled)))
            .await;
    }

    let compare = handle.compare.read().await.clone();
    permit.release();
    info!(compare = %id.short(), status = %compare.status, "compare task finished");
}

async fn run_sub_task(
    inner: Arc<Inner>,
    handle: Arc<CompareHandle>,
    kind: ExecutorKind,
    instruction: String,
    base: String,
    cancel: CancellationToken,
) {
    let compare_id = handle.compare.read().await.id;
    let owner = format!("compare-{}-{}", compare_id.short(), kind);

    let executor = match inner.executors.get(kind) {
        Ok(executor) => executor,
        Err(e) => {
            inner.update_sub_task(&handle, kind, |sub| sub.finish(Err(e))).await;
            return;
        }
    };

    if cancel.is_cancelled() {
        inner
            .update_sub_task(&handle, kind, |sub| sub.finish(Err(Error::Cancelled)))
            .await;
        return;
    }

    let workspace = match inner.workspaces.acquire(&owner, &base).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(compare = %compare_id.short(), executor = %kind, error = %e, "sub-task workspace provisioning failed");
            inner.update_sub_task(&handle, kind, |sub| sub.finish(Err(e))).await;
            return;
        }
    };

    let claim = inner.workspaces.claim(workspace.id);
    inner
        .update_sub_task(&handle, kind, |sub| {
            sub.workspace_id = Some(workspace.id);
            sub.status = SubTaskStatus::Running;
            sub.started_at = Some(Utc::now());
        })
        .await;
    claim.recorded();

    debug!(compare = %compare_id.short(), executor = %kind, workdir = %workspace.path.display(), "dispatching sub-task");
    let request = ExecutionRequest::new(instruction, Some(workspace.path.clone()));
    let result = if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        match executor.execute(request, cancel.clone()).await {
            Ok(events) => collect_events(events, &cancel).await,
            Err(e) => Err(e),
        }
    };

    if let Err(e) = inner.workspaces.release(workspace.id).await {
        warn!(workspace = %workspace.id.short(), error = %e, "failed to release sub-task workspace");
    }
    inner.update_sub_task(&handle, kind, |sub| sub.finish(result)).await;
}
