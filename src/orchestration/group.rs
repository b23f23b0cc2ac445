//! Task group execution.
//!
//! [`GroupController`] is the only writer of [`TaskGroup`] state. A group is
//! planned once on start; a planning failure fails the group before any
//! task runs. Stages are executed strictly in order: stage `k + 1` is not
//! admitted until every task of stage `k` is terminal. Within a stage at
//! most `max_parallel` tasks run at once.
//!
//! Failure policy:
//! - `continue_on_error = false`: the first failure stops admission. Tasks
//!   already running are allowed to finish; everything not yet started is
//!   skipped and the group ends `failed`.
//! - `continue_on_error = true`: failures are recorded per task, tasks that
//!   depend on a failed task (directly or transitively) are skipped, and the
//!   group ends `completed_with_failures`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{collect_events, ExecutionRequest, ExecutorRegistry};
use crate::config::Config;
use crate::core::{plan, ExecutionStage, GroupMode, Task, TaskDAG, TaskId, TaskRun, TaskState};
use crate::events::{EventBus, OrchestrationEvent};
use crate::id::uuid_id;
use crate::retry::{RetryEngine, RetryMetadata, RetryPolicy};
use crate::store::StateStore;
use crate::workspace::{WorkspaceId, WorkspaceManager};
use crate::{Error, Result};

uuid_id!(
    /// Identifier of a task group.
    GroupId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    #[default]
    Pending,
    Running,
    /// Every attempted task succeeded.
    Completed,
    /// Ran to the end with `continue_on_error`, but some tasks failed.
    CompletedWithFailures,
    Failed,
    Cancelling,
    Cancelled,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GroupStatus::Completed
                | GroupStatus::CompletedWithFailures
                | GroupStatus::Failed
                | GroupStatus::Cancelled
        )
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Running => "running",
            GroupStatus::Completed => "completed",
            GroupStatus::CompletedWithFailures => "completed_with_failures",
            GroupStatus::Failed => "failed",
            GroupStatus::Cancelling => "cancelling",
            GroupStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Terminal task counts. Every field only ever grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    /// Tasks that finished successfully.
    pub completed: usize,
    /// Tasks that ran and failed.
    pub failed: usize,
    /// Tasks that were never attempted.
    pub skipped: usize,
    pub total: usize,
}

impl Progress {
    fn from_runs(runs: &[TaskRun]) -> Self {
        let mut progress = Progress {
            total: runs.len(),
            ..Default::default()
        };
        for run in runs {
            match run.state {
                TaskState::Completed => progress.completed += 1,
                TaskState::Failed { .. } => progress.failed += 1,
                TaskState::Skipped { .. } => progress.skipped += 1,
                _ => {}
            }
        }
        progress
    }
}

fn default_base_ref() -> String {
    "HEAD".to_string()
}

/// A group as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub mode: GroupMode,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Concurrency ceiling inside a stage; unlimited when absent.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Revision isolated tasks check out.
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    /// Overrides the controller's retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            tasks,
            mode: GroupMode::default(),
            continue_on_error: false,
            max_parallel: None,
            base_ref: default_base_ref(),
            retry: None,
        }
    }

    pub fn with_mode(mut self, mode: GroupMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = base_ref.into();
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,
    pub name: String,
    pub tasks: Vec<Task>,
    pub mode: GroupMode,
    pub continue_on_error: bool,
    pub max_parallel: Option<usize>,
    pub base_ref: String,
    pub status: GroupStatus,
    pub progress: Progress,
    pub stages: Vec<ExecutionStage>,
    /// One record per task, in submission order.
    pub runs: Vec<TaskRun>,
    /// First failure, as `task <id>: <error>`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskGroup {
    fn from_spec(spec: &GroupSpec) -> Self {
        let runs: Vec<TaskRun> = spec
            .tasks
            .iter()
            .map(|t| TaskRun::new(t.id.clone()))
            .collect();
        Self {
            id: GroupId::new(),
            name: spec.name.clone(),
            tasks: spec.tasks.clone(),
            mode: spec.mode,
            continue_on_error: spec.continue_on_error,
            max_parallel: spec.max_parallel,
            base_ref: spec.base_ref.clone(),
            status: GroupStatus::Pending,
            progress: Progress::from_runs(&runs),
            stages: Vec::new(),
            runs,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn run(&self, task_id: &str) -> Option<&TaskRun> {
        self.runs.iter().find(|r| r.task_id.as_str() == task_id)
    }

    fn run_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskRun> {
        self.runs.iter_mut().find(|r| &r.task_id == task_id)
    }

    fn workspaces(&self) -> Vec<WorkspaceId> {
        self.runs.iter().filter_map(|r| r.workspace_id).collect()
    }
}

/// Controller-wide defaults.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub retry: RetryPolicy,
    /// Deadline for a single attempt.
    pub task_timeout: Option<Duration>,
    /// How long cancelled tasks get to stop before they are aborted.
    pub cancel_grace: Duration,
    /// How long a finished group stays in memory.
    pub retain_finished: Duration,
}

impl GroupSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry.policy(),
            task_timeout: config.retry.task_timeout(),
            cancel_grace: config.cleanup.cancel_grace(),
            retain_finished: config.cleanup.finished_ttl(),
        }
    }
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            task_timeout: None,
            cancel_grace: Duration::from_secs(30),
            retain_finished: Duration::from_secs(60 * 60),
        }
    }
}

struct GroupHandle {
    group: RwLock<TaskGroup>,
    cancel: CancellationToken,
    status: watch::Sender<GroupStatus>,
}

struct TaskOutcome {
    result: Result<String>,
    retry: Option<RetryMetadata>,
}

impl TaskOutcome {
    fn failed(err: Error) -> Self {
        Self {
            result: Err(err),
            retry: None,
        }
    }
}

struct Inner {
    workspaces: Arc<WorkspaceManager>,
    executors: ExecutorRegistry,
    events: EventBus,
    store: Arc<dyn StateStore>,
    settings: GroupSettings,
    groups: RwLock<HashMap<GroupId, Arc<GroupHandle>>>,
}

#[derive(Clone)]
pub struct GroupController {
    inner: Arc<Inner>,
}

/// Validate and plan a group without running anything.
pub fn plan_group(
    tasks: &[Task],
    mode: GroupMode,
    max_parallel: Option<usize>,
) -> Result<Vec<ExecutionStage>> {
    if max_parallel == Some(0) {
        return Err(Error::Validation("max_parallel must be at least 1".into()));
    }
    plan(tasks, mode)
}

impl GroupController {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        executors: ExecutorRegistry,
        events: EventBus,
        store: Arc<dyn StateStore>,
        settings: GroupSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                workspaces,
                executors,
                events,
                store,
                settings,
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a group and start driving it in the background.
    ///
    /// A group that fails validation or planning is still registered, in
    /// `failed` status with no task attempted.
    pub async fn start_group(&self, spec: GroupSpec) -> Result<GroupId> {
        self.inner.evict_finished().await;
        let mut group = TaskGroup::from_spec(&spec);
        let id = group.id;

        let planned = plan_group(&spec.tasks, spec.mode, spec.max_parallel)
            .and_then(|stages| TaskDAG::from_tasks(&spec.tasks).map(|dag| (stages, dag)));

        let (stages, dag) = match planned {
            Ok(planned) => planned,
            Err(e) => {
                warn!(group = %id.short(), name = %spec.name, error = %e, "group rejected during planning");
                let reason = format!("group planning failed: {}", e);
                for run in group.runs.iter_mut() {
                    run.skip(&reason);
                }
                group.progress = Progress::from_runs(&group.runs);
                group.status = GroupStatus::Failed;
                group.error = Some(e.to_string());
                group.completed_at = Some(Utc::now());
                self.inner.register(group).await;
                return Ok(id);
            }
        };

        group.stages = stages;
        group.status = GroupStatus::Running;
        info!(
            group = %id.short(),
            name = %spec.name,
            tasks = spec.tasks.len(),
            stages = group.stages.len(),
            mode = %spec.mode,
            "starting task group"
        );
        let handle = self.inner.register(group).await;

        let engine = RetryEngine::new(spec.retry.unwrap_or(self.inner.settings.retry))
            .with_deadline(self.inner.settings.task_timeout);
        tokio::spawn(drive(self.inner.clone(), handle, dag, engine));
        Ok(id)
    }

    /// Current snapshot of a group. Falls back to the store for groups this
    /// process no longer tracks.
    pub async fn get_group_status(&self, id: GroupId) -> Result<TaskGroup> {
        if let Some(handle) = self.inner.handle(id).await {
            return Ok(handle.group.read().await.clone());
        }
        self.inner.load(id).await
    }

    pub async fn list_groups(&self) -> Vec<TaskGroup> {
        let handles: Vec<Arc<GroupHandle>> =
            self.inner.groups.read().await.values().cloned().collect();
        let mut groups = Vec::with_capacity(handles.len());
        for handle in handles {
            groups.push(handle.group.read().await.clone());
        }
        groups.sort_by_key(|g| g.created_at);
        groups
    }

    /// Request cancellation. Returns once the group is `cancelling`; the
    /// driver moves it to `cancelled` after in-flight tasks stop or the
    /// grace period runs out. A terminal group is left untouched.
    pub async fn cancel_group(&self, id: GroupId) -> Result<()> {
        let Some(handle) = self.inner.handle(id).await else {
            // Not running here; nothing to stop.
            self.inner.load(id).await?;
            return Ok(());
        };

        let changed = self
            .inner
            .update(&handle, |group| {
                if group.status.is_terminal() || group.status == GroupStatus::Cancelling {
                    false
                } else {
                    group.status = GroupStatus::Cancelling;
                    true
                }
            })
            .await;
        if changed {
            info!(group = %id.short(), "cancelling task group");
            handle.cancel.cancel();
        }
        Ok(())
    }

    /// Wait until a group reaches a terminal status. A group this process
    /// no longer tracks is returned as last recorded.
    pub async fn wait_for_group(&self, id: GroupId) -> Result<TaskGroup> {
        let Some(handle) = self.inner.handle(id).await else {
            return self.inner.load(id).await;
        };
        let mut rx = handle.status.subscribe();
        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        let group = handle.group.read().await.clone();
        Ok(group)
    }

    /// Reclaim every workspace used by a finished group.
    pub async fn cleanup_group(&self, id: GroupId) -> Result<Vec<WorkspaceId>> {
        let group = self.get_group_status(id).await?;
        if !group.status.is_terminal() {
            return Err(Error::Validation(format!(
                "group {} is still {}",
                id.short(),
                group.status
            )));
        }

        let mut reclaimed = Vec::new();
        for workspace in group.workspaces() {
            match self.inner.workspaces.reclaim(workspace).await {
                Ok(()) => reclaimed.push(workspace),
                Err(e) => {
                    warn!(group = %id.short(), workspace = %workspace.short(), error = %e, "workspace reclaim failed, leaving it for the sweeper")
                }
            }
        }
        info!(group = %id.short(), reclaimed = reclaimed.len(), "group cleanup finished");
        self.inner.evict(id).await;
        Ok(reclaimed)
    }
}

impl Inner {
    async fn handle(&self, id: GroupId) -> Option<Arc<GroupHandle>> {
        self.groups.read().await.get(&id).cloned()
    }

    async fn load(&self, id: GroupId) -> Result<TaskGroup> {
        self.store
            .load_group(id)
            .await?
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))
    }

    /// Drop a finished group from memory once its final state is stored.
    async fn evict(&self, id: GroupId) {
        let Some(handle) = self.handle(id).await else {
            return;
        };
        let snapshot = handle.group.read().await.clone();
        if !snapshot.status.is_terminal() {
            return;
        }
        match self.store.save_group(&snapshot).await {
            Ok(()) => {
                self.groups.write().await.remove(&id);
                debug!(group = %id.short(), "finished group evicted from memory");
            }
            Err(e) => warn!(group = %id.short(), error = %e, "keeping finished group in memory, store write failed"),
        }
    }

    /// Evict every group that finished more than `retain_finished` ago.
    async fn evict_finished(&self) {
        let retain = chrono::Duration::from_std(self.settings.retain_finished).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(retain).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let handles: Vec<(GroupId, Arc<GroupHandle>)> = self
            .groups
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        for (id, handle) in handles {
            let expired = handle
                .group
                .read()
                .await
                .completed_at
                .is_some_and(|at| at <= cutoff);
            if expired {
                self.evict(id).await;
            }
        }
    }

    async fn register(&self, group: TaskGroup) -> Arc<GroupHandle> {
        let (status, _) = watch::channel(group.status);
        let id = group.id;
        let snapshot = group.clone();
        let handle = Arc::new(GroupHandle {
            group: RwLock::new(group),
            cancel: CancellationToken::new(),
            status,
        });
        self.groups.write().await.insert(id, handle.clone());
        self.events.emit(OrchestrationEvent::GroupStatusChanged {
            group_id: id,
            status: snapshot.status,
        });
        self.persist(&snapshot).await;
        handle
    }

    /// Apply `f` to the group, then publish and persist the result.
    async fn update<T>(&self, handle: &GroupHandle, f: impl FnOnce(&mut TaskGroup) -> T) -> T {
        let (out, snapshot, status_changed, progress_changed) = {
            let mut group = handle.group.write().await;
            let before_status = group.status;
            let before_progress = group.progress;
            let out = f(&mut group);
            group.progress = Progress::from_runs(&group.runs);
            (
                out,
                group.clone(),
                group.status != before_status,
                group.progress != before_progress,
            )
        };

        if status_changed {
            debug!(group = %snapshot.id.short(), status = %snapshot.status, "group status changed");
            handle.status.send_replace(snapshot.status);
            self.events.emit(OrchestrationEvent::GroupStatusChanged {
                group_id: snapshot.id,
                status: snapshot.status,
            });
        }
        if progress_changed {
            self.events.emit(OrchestrationEvent::GroupProgress {
                group_id: snapshot.id,
                progress: snapshot.progress,
            });
        }
        self.persist(&snapshot).await;
        out
    }

    async fn update_run(&self, handle: &GroupHandle, task_id: &TaskId, f: impl FnOnce(&mut TaskRun)) {
        let (group_id, state) = self
            .update(handle, |group| {
                let state = group.run_mut(task_id).map(|run| {
                    f(run);
                    run.state.clone()
                });
                (group.id, state)
            })
            .await;
        if let Some(state) = state {
            debug!(group = %group_id.short(), task = %task_id, state = %state, "task state changed");
            self.events.emit(OrchestrationEvent::TaskStateChanged {
                group_id,
                task_id: task_id.clone(),
                state,
            });
        }
    }

    async fn attach_workspace(&self, handle: &GroupHandle, task_id: &TaskId, workspace: WorkspaceId) {
        let mut group = handle.group.write().await;
        if let Some(run) = group.run_mut(task_id) {
            run.workspace_id = Some(workspace);
        }
    }

    /// Record a finished task. Returns whether it counts as a failure.
    async fn record_outcome(&self, handle: &GroupHandle, task_id: &TaskId, outcome: TaskOutcome) -> bool {
        let TaskOutcome { result, retry } = outcome;
        let failed = matches!(&result, Err(e) if !matches!(e, Error::Cancelled));
        let message = result.as_ref().err().map(|e| e.to_string());
        if let Some(msg) = &message {
            if failed {
                warn!(task = %task_id, error = %msg, "task failed");
            }
        }

        self.update(handle, |group| {
            if failed && group.error.is_none() {
                group.error = Some(format!("task {}: {}", task_id, message.as_deref().unwrap_or_default()));
            }
        })
        .await;

        self.update_run(handle, task_id, |run| {
            run.retry = retry;
            match result {
                Ok(output) => run.complete(output),
                Err(Error::Cancelled) => run.cancel(),
                Err(e) => run.fail(&e.to_string()),
            }
        })
        .await;
        failed
    }

    async fn finalize(&self, handle: &GroupHandle, abort_reason: Option<String>) {
        let cancelled = handle.cancel.is_cancelled();

        // Tasks still running here were aborted after the grace period.
        let abandoned: Vec<WorkspaceId> = {
            let group = handle.group.read().await;
            group
                .runs
                .iter()
                .filter(|r| r.state == TaskState::Running)
                .filter_map(|r| r.workspace_id)
                .collect()
        };
        for workspace in abandoned {
            if let Err(e) = self.workspaces.reclaim(workspace).await {
                warn!(workspace = %workspace.short(), error = %e, "failed to reclaim workspace of aborted task");
            }
        }

        let snapshot = self
            .update(handle, |group| {
                for run in group.runs.iter_mut().filter(|r| !r.state.is_terminal()) {
                    if cancelled {
                        run.cancel();
                    } else {
                        run.skip(abort_reason.as_deref().unwrap_or("not started"));
                    }
                }
                let any_failed = group
                    .runs
                    .iter()
                    .any(|r| matches!(r.state, TaskState::Failed { .. }));
                group.status = if cancelled {
                    GroupStatus::Cancelled
                } else if abort_reason.is_some() {
                    GroupStatus::Failed
                } else if any_failed {
                    GroupStatus::CompletedWithFailures
                } else {
                    GroupStatus::Completed
                };
                group.completed_at = Some(Utc::now());
                group.clone()
            })
            .await;

        info!(
            group = %snapshot.id.short(),
            status = %snapshot.status,
            completed = snapshot.progress.completed,
            failed = snapshot.progress.failed,
            skipped = snapshot.progress.skipped,
            total = snapshot.progress.total,
            "task group finished"
        );
    }

    async fn persist(&self, group: &TaskGroup) {
        if let Err(e) = self.store.save_group(group).await {
            warn!(group = %group.id.short(), error = %e, "failed to persist group");
        }
    }
}

async fn drive(inner: Arc<Inner>, handle: Arc<GroupHandle>, dag: TaskDAG, engine: RetryEngine) {
    let (stages, tasks, continue_on_error, max_parallel, base_ref) = {
        let group = handle.group.read().await;
        (
            group.stages.clone(),
            group.tasks.clone(),
            group.continue_on_error,
            group.max_parallel,
            group.base_ref.clone(),
        )
    };
    let by_id: HashMap<TaskId, Task> = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

    // Dependent task -> the failed task that blocks it.
    let mut blocked: HashMap<TaskId, TaskId> = HashMap::new();
    let mut abort_reason: Option<String> = None;
    let mut grace_deadline: Option<Instant> = None;

    'stages: for stage in &stages {
        if abort_reason.is_some() || handle.cancel.is_cancelled() {
            break;
        }
        debug!(stage = stage.index, tasks = stage.tasks.len(), "entering stage");

        let limit = max_parallel.unwrap_or(stage.tasks.len()).max(1);
        let mut pending: VecDeque<TaskId> = stage.tasks.iter().cloned().collect();
        let mut in_flight: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TaskId> = HashMap::new();

        loop {
            while in_flight.len() < limit && abort_reason.is_none() && !handle.cancel.is_cancelled() {
                let Some(task_id) = pending.pop_front() else {
                    break;
                };
                if let Some(origin) = blocked.get(&task_id) {
                    let reason = format!("dependency {} did not complete", origin);
                    inner.update_run(&handle, &task_id, |run| run.skip(&reason)).await;
                    continue;
                }
                let Some(task) = by_id.get(&task_id).cloned() else {
                    continue;
                };
                inner.update_run(&handle, &task_id, TaskRun::start).await;
                let abort = in_flight.spawn(execute_task(
                    inner.clone(),
                    handle.clone(),
                    task,
                    base_ref.clone(),
                    engine.clone(),
                    handle.cancel.child_token(),
                ));
                running.insert(abort.id(), task_id);
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = handle.cancel.cancelled(), if grace_deadline.is_none() => {
                    grace_deadline = Some(Instant::now() + inner.settings.cancel_grace);
                    debug!(in_flight = in_flight.len(), "cancellation requested, waiting for tasks to stop");
                }
                _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                    warn!(in_flight = in_flight.len(), "grace period elapsed, aborting remaining tasks");
                    in_flight.abort_all();
                    while in_flight.join_next().await.is_some() {}
                    break 'stages;
                }
                joined = in_flight.join_next_with_id() => {
                    let (id, outcome) = match joined {
                        Some(Ok((id, outcome))) => (id, outcome),
                        Some(Err(e)) => (e.id(), TaskOutcome::failed(Error::TaskJoin(e.to_string()))),
                        None => continue,
                    };
                    let Some(task_id) = running.remove(&id) else {
                        continue;
                    };
                    let failed = inner.record_outcome(&handle, &task_id, outcome).await;
                    if failed {
                        if continue_on_error {
                            for dependent in dag.transitive_dependents(&task_id) {
                                blocked.entry(dependent).or_insert_with(|| task_id.clone());
                            }
                        } else if abort_reason.is_none() {
                            abort_reason = Some(format!("group aborted after task {} failed", task_id));
                        }
                    }
                }
            }
        }
    }

    inner.finalize(&handle, abort_reason).await;
}

async fn execute_task(
    inner: Arc<Inner>,
    handle: Arc<GroupHandle>,
    task: Task,
    base_ref: String,
    engine: RetryEngine,
    cancel: CancellationToken,
) -> TaskOutcome {
    let executor = match inner.executors.get(task.executor) {
        Ok(executor) => executor,
        Err(e) => return TaskOutcome::failed(e),
    };

    if cancel.is_cancelled() {
        return TaskOutcome::failed(Error::Cancelled);
    }
    let workspace = if task.requires_workspace {
        // Dropping a pending acquire hands its checkout back to the manager.
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TaskOutcome::failed(Error::Cancelled),
            acquired = inner.workspaces.acquire(task.id.as_str(), &base_ref) => acquired,
        };
        match acquired {
            Ok(ws) if cancel.is_cancelled() => {
                if let Err(e) = inner.workspaces.reclaim(ws.id).await {
                    warn!(task = %task.id, workspace = %ws.id.short(), error = %e, "failed to reclaim workspace of cancelled task");
                }
                return TaskOutcome::failed(Error::Cancelled);
            }
            Ok(ws) => {
                let claim = inner.workspaces.claim(ws.id);
                inner.attach_workspace(&handle, &task.id, ws.id).await;
                claim.recorded();
                Some(ws)
            }
            Err(e) => return TaskOutcome::failed(e),
        }
    } else {
        None
    };

    let request = ExecutionRequest::new(
        task.instruction.clone(),
        workspace.as_ref().map(|ws| ws.path.clone()),
    );
    let workspace_id = workspace.as_ref().map(|ws| ws.id);
    let outcome = engine
        .execute(&cancel, |attempt, cancel| {
            let executor = executor.clone();
            let request = request.clone();
            let workspaces = inner.workspaces.clone();
            let task_id = task.id.clone();
            async move {
                debug!(task = %task_id, attempt, "dispatching task");
                if let Some(id) = workspace_id {
                    workspaces.touch(id).await?;
                }
                let events = executor.execute(request, cancel.clone()).await?;
                collect_events(events, &cancel).await
            }
        })
        .await;

    if let Some(id) = workspace_id {
        if let Err(e) = inner.workspaces.release(id).await {
            warn!(task = %task.id, workspace = %id.short(), error = %e, "failed to release workspace");
        }
    }

    TaskOutcome {
        result: outcome.result,
        retry: Some(outcome.metadata),
    }
}
