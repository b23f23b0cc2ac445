use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds an agent executor can report for a single run.
///
/// This is the input to [`crate::retry::classify`]; executors pick the kind,
/// the retry policy decides what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection, stream or process transport broke.
    Transport,
    /// The executor gave up waiting.
    Timeout,
    /// Rate limit, quota or other exhaustion on the backend side.
    ResourceExhausted,
    /// The request itself is invalid (bad instruction, missing binary, ...).
    Validation,
    /// Anything else the executor could not recover from.
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::ResourceExhausted => write!(f, "resource_exhausted"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

/// Coarse error categories used when reporting failures to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Structural,
    Resource,
    Provisioning,
    Execution,
    Cancellation,
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle between tasks: {}", task_ids.join(", "))]
    Cycle { task_ids: Vec<String> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Insufficient disk space: {available} bytes available, {required} required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("Workspace concurrency limit exceeded (max: {limit})")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("Too many compare tasks running (max: {limit})")]
    TooManyCompareTasks { limit: usize },

    #[error("Workspace provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Execution failed ({kind}): {message}")]
    Execution { kind: FailureKind, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Task group not found: {0}")]
    GroupNotFound(String),

    #[error("Compare task not found: {0}")]
    CompareNotFound(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("No executor configured for {0}")]
    ExecutorNotConfigured(String),
}

impl Error {
    /// Shorthand for an executor-reported failure.
    pub fn execution(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Execution {
            kind,
            message: message.into(),
        }
    }

    /// The reporting category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Cycle { .. } | Error::UnknownDependency { .. } | Error::DuplicateTask(_) => {
                ErrorCategory::Structural
            }
            Error::InsufficientDiskSpace { .. }
            | Error::ConcurrencyLimitExceeded { .. }
            | Error::TooManyCompareTasks { .. } => ErrorCategory::Resource,
            Error::ProvisioningFailed(_) => ErrorCategory::Provisioning,
            Error::Execution { .. } | Error::Timeout(_) => ErrorCategory::Execution,
            Error::Cancelled => ErrorCategory::Cancellation,
            _ => ErrorCategory::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
