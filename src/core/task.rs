//! Task data model for task groups.
//!
//! A [`Task`] is the immutable definition submitted with a group; a
//! [`TaskRun`] is the mutable execution record the group controller keeps
//! for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestration::executor::ExecutorKind;
use crate::retry::RetryMetadata;
use crate::workspace::WorkspaceId;

/// Identifier of a task within its group.
///
/// Task ids are chosen by the submitter so dependency edges can refer to
/// them; uniqueness is only required inside one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single instruction inside a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the group.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// Instruction handed to the agent executor.
    pub instruction: String,
    /// Tasks that must reach a terminal state before this one may start.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Which agent backend runs the task.
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Whether the task runs in its own isolated workspace.
    #[serde(default)]
    pub requires_workspace: bool,
}

impl Task {
    /// Create a task with no dependencies that runs without a workspace.
    pub fn new(id: &str, instruction: &str) -> Self {
        Self {
            id: TaskId::new(id),
            name: id.to_string(),
            instruction: instruction.to_string(),
            dependencies: Vec::new(),
            executor: ExecutorKind::default(),
            requires_workspace: false,
        }
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.dependencies.push(TaskId::new(id));
        self
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    pub fn isolated(mut self) -> Self {
        self.requires_workspace = true;
        self
    }
}

/// Execution state of a task inside a running group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Not started yet.
    #[default]
    Pending,
    /// Currently executing (possibly between retries).
    Running,
    /// Finished successfully.
    Completed,
    /// Failed after retries were exhausted or on a fatal error.
    Failed {
        /// Last classified error.
        error: String,
    },
    /// Never attempted.
    Skipped {
        /// Why the task was not attempted.
        reason: String,
    },
    /// Stopped by a cancellation request.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed { error } => write!(f, "failed: {}", error),
            TaskState::Skipped { reason } => write!(f, "skipped: {}", reason),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Execution record for one task of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Retry chain of the most recent execution, if it ran.
    pub retry: Option<RetryMetadata>,
    /// Workspace held while the task ran.
    pub workspace_id: Option<WorkspaceId>,
    /// Final output reported by the executor.
    pub output: Option<String>,
    /// Last error, prefixed with the task id.
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            retry: None,
            workspace_id: None,
            output: None,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, output: String) {
        self.state = TaskState::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.last_error = Some(format!("{}: {}", self.task_id, error));
        self.state = TaskState::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: &str) {
        self.state = TaskState::Skipped {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.state = TaskState::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
