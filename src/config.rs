use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::orchestration::executor::ExecutorKind;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub worktree_dir: Option<String>,
    pub state_dir: Option<String>,
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub compare: CompareSettings,
    #[serde(default)]
    pub cleanup: CleanupSettings,
    /// Per-kind overrides, keyed by executor name.
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub min_free_disk_mb: u64,
    pub max_active: usize,
    pub branch_prefix: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            min_free_disk_mb: 1024,
            max_active: 8,
            branch_prefix: "taskforge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-attempt deadline.
    pub task_timeout_secs: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            task_timeout_secs: None,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareSettings {
    pub max_concurrent: usize,
    pub min_free_disk_mb: u64,
    pub max_files_count: usize,
    pub executors: Vec<ExecutorKind>,
}

impl Default for CompareSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            min_free_disk_mb: 4096,
            max_files_count: 500,
            executors: ExecutorKind::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub retention_secs: u64,
    pub interval_secs: u64,
    pub cancel_grace_secs: u64,
    /// How long finished groups and compare tasks stay in memory before
    /// they are served from the state store only.
    pub finished_ttl_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            interval_secs: 60 * 60,
            cancel_grace_secs: 30,
            finished_ttl_secs: 60 * 60,
        }
    }
}

impl CleanupSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn finished_ttl(&self) -> Duration {
        Duration::from_secs(self.finished_ttl_secs)
    }
}

/// How to launch one agent CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
    /// Handed to the executor as flags, not interpreted by the scheduler.
    #[serde(default)]
    pub options: toml::Table,
}

impl ExecutorSettings {
    pub fn default_for(kind: ExecutorKind) -> Self {
        let args = match kind {
            ExecutorKind::Claude | ExecutorKind::Gemini => vec!["-p".to_string()],
            ExecutorKind::Codex => vec!["exec".to_string()],
        };
        Self {
            command: kind.as_str().to_string(),
            args,
            timeout_secs: None,
            options: toml::Table::new(),
        }
    }
}

impl Config {
    pub fn taskforge_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskforge"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::taskforge_dir()?.join("taskforge.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::taskforge_dir()?.join("worktrees")),
        }
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::taskforge_dir()?.join("state")),
        }
    }

    pub fn min_free_disk_bytes(&self) -> u64 {
        self.workspace.min_free_disk_mb.saturating_mul(MB)
    }

    pub fn compare_min_free_disk_bytes(&self) -> u64 {
        self.compare.min_free_disk_mb.saturating_mul(MB)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(&path)?)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace.max_active == 0 {
            return Err(Error::Validation(
                "workspace.max_active must be at least 1".into(),
            ));
        }
        if self.compare.max_concurrent == 0 {
            return Err(Error::Validation(
                "compare.max_concurrent must be at least 1".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Validation(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.workspace.branch_prefix.trim().is_empty() {
            return Err(Error::Validation(
                "workspace.branch_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::taskforge_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.worktrees_dir()?, self.state_dir()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
