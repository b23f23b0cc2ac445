//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Script-driven agent executors that edit their workspace
//! - A worktree backend with controllable free disk space
//! - A fully wired `Forge` over all of the above

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use taskforge::config::Config;
use taskforge::error::FailureKind;
use taskforge::git::FileChange;
use taskforge::orchestration::{AgentEvent, AgentExecutor, ExecutionRequest, ExecutorKind, ExecutorRegistry};
use taskforge::store::JsonFileStore;
use taskforge::workspace::{GitWorktreeBackend, WorkspaceBackend};
use taskforge::{Forge, Result};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// Keeps the directory alive for the test's duration.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Create a file and commit it. Returns the new commit id.
    pub fn create_and_commit(&self, filename: &str, content: &str, message: &str) -> String {
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&file_path, content).expect("Failed to write file");
        git(&self.path, &["add", filename]);
        git(&self.path, &["commit", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        git(&self.path, &["rev-parse", "HEAD"])
    }

    pub fn branches(&self) -> Vec<String> {
        git(&self.path, &["branch", "--format=%(refname:short)"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Add a worktree behind the library's back, as a crashed run would leave.
    pub fn add_worktree(&self, branch: &str, path: &Path) {
        let path = path.to_string_lossy();
        git(&self.path, &["worktree", "add", "-b", branch, &path]);
    }

    pub fn worktree_count(&self) -> usize {
        git(&self.path, &["worktree", "list", "--porcelain"])
            .lines()
            .filter(|l| l.starts_with("worktree "))
            .count()
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Git worktree backend whose free disk space and checkout latency are set
/// by the test.
pub struct DiskOverride {
    inner: GitWorktreeBackend,
    free: AtomicU64,
    provision_delay_ms: AtomicU64,
}

impl DiskOverride {
    pub fn new(repo: &Path) -> Self {
        Self {
            inner: GitWorktreeBackend::new(repo).expect("Failed to open repo"),
            free: AtomicU64::new(u64::MAX),
            provision_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn set_free_space(&self, bytes: u64) {
        self.free.store(bytes, Ordering::SeqCst);
    }

    /// Make every checkout creation block for `delay` first.
    pub fn set_provision_delay(&self, delay: Duration) {
        self.provision_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl WorkspaceBackend for DiskOverride {
    fn free_disk_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }

    fn resolve_revision(&self, rev: &str) -> Result<String> {
        self.inner.resolve_revision(rev)
    }

    fn create_checkout(&self, base: &str, branch: &str, path: &Path) -> Result<()> {
        let delay = self.provision_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.inner.create_checkout(base, branch, path)
    }

    fn remove_checkout(&self, path: &Path) -> Result<()> {
        self.inner.remove_checkout(path)
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.inner.delete_branch(branch)
    }

    fn changed_files(&self, base: &str, path: &Path) -> Result<Vec<FileChange>> {
        self.inner.changed_files(base, path)
    }
}

/// Agent driven by a `;`-separated script:
/// - `write PATH`: write `PATH by <kind>` into PATH
/// - `delete PATH`: remove PATH
/// - `fail`: fatal validation error
/// - `flaky N`: transport error on the first N runs
/// - `hang`: run until cancelled
///
/// The script comes from the instruction unless the agent was built with
/// its own, which lets compare tests give each executor kind a different
/// behaviour for the same instruction.
pub struct FixtureAgent {
    kind: ExecutorKind,
    script: Option<String>,
    runs: Mutex<HashMap<String, u32>>,
    workdirs: Mutex<Vec<Option<PathBuf>>>,
}

impl FixtureAgent {
    pub fn new(kind: ExecutorKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: None,
            runs: Mutex::new(HashMap::new()),
            workdirs: Mutex::new(Vec::new()),
        })
    }

    pub fn scripted(kind: ExecutorKind, script: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Some(script.to_string()),
            runs: Mutex::new(HashMap::new()),
            workdirs: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.workdirs.lock().unwrap().len()
    }

    pub fn workdirs(&self) -> Vec<Option<PathBuf>> {
        self.workdirs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentExecutor for FixtureAgent {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        let script = self.script.clone().unwrap_or_else(|| request.instruction.clone());
        let run = {
            let mut runs = self.runs.lock().unwrap();
            let n = runs.entry(script.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.workdirs.lock().unwrap().push(request.workdir.clone());

        let kind = self.kind;
        let workdir = request.workdir;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for command in script.split(';').map(str::trim).filter(|c| !c.is_empty()) {
                let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
                let _ = tx
                    .send(AgentEvent::Progress {
                        message: command.to_string(),
                    })
                    .await;
                match verb {
                    "write" | "delete" => {
                        let Some(dir) = &workdir else {
                            let _ = tx
                                .send(AgentEvent::Error {
                                    kind: FailureKind::Validation,
                                    message: "no workspace".into(),
                                })
                                .await;
                            return;
                        };
                        let path = dir.join(arg);
                        if verb == "write" {
                            if let Some(parent) = path.parent() {
                                let _ = std::fs::create_dir_all(parent);
                            }
                            let _ = std::fs::write(&path, format!("{} by {}\n", arg, kind));
                        } else {
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                    "fail" => {
                        let _ = tx
                            .send(AgentEvent::Error {
                                kind: FailureKind::Validation,
                                message: format!("{} refused", kind),
                            })
                            .await;
                        return;
                    }
                    "flaky" => {
                        let failures: u32 = arg.parse().unwrap_or(0);
                        if run <= failures {
                            let _ = tx
                                .send(AgentEvent::Error {
                                    kind: FailureKind::Transport,
                                    message: format!("connection reset (run {})", run),
                                })
                                .await;
                            return;
                        }
                    }
                    "hang" => {
                        cancel.cancelled().await;
                        return;
                    }
                    other => panic!("unknown fixture command: {}", other),
                }
            }
            let _ = tx
                .send(AgentEvent::Result {
                    output: format!("{}: done", kind),
                })
                .await;
            let _ = tx.send(AgentEvent::Done).await;
        });
        Ok(rx)
    }
}

/// Config rooted in a scratch directory, with no disk minimums and
/// millisecond retry delays.
pub fn test_config(scratch: &Path) -> Config {
    let mut config = Config::default();
    config.worktree_dir = Some(scratch.join("worktrees").to_string_lossy().into_owned());
    config.state_dir = Some(scratch.join("state").to_string_lossy().into_owned());
    config.workspace.min_free_disk_mb = 0;
    config.workspace.branch_prefix = "tf".into();
    config.compare.min_free_disk_mb = 0;
    config.retry.max_retries = 2;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.cleanup.cancel_grace_secs = 1;
    config
}

/// A `Forge` over a real repository, fixture agents and JSON state.
pub struct Harness {
    pub repo: TestRepo,
    pub scratch: TempDir,
    pub backend: Arc<DiskOverride>,
    pub forge: Forge,
}

impl Harness {
    pub fn new(agents: Vec<Arc<FixtureAgent>>) -> Self {
        Self::with_config(agents, |_| {})
    }

    pub fn with_config(agents: Vec<Arc<FixtureAgent>>, tweak: impl FnOnce(&mut Config)) -> Self {
        let repo = TestRepo::new();
        let scratch = TempDir::new().expect("Failed to create scratch dir");
        let mut config = test_config(scratch.path());
        tweak(&mut config);

        let backend = Arc::new(DiskOverride::new(&repo.path));
        let mut registry = ExecutorRegistry::new();
        for agent in agents {
            registry.register(agent);
        }
        let store = Arc::new(JsonFileStore::new(scratch.path().join("state")));
        let forge = Forge::new(config, backend.clone(), registry, store).expect("Failed to build forge");

        Self {
            repo,
            scratch,
            backend,
            forge,
        }
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.scratch.path().join("worktrees")
    }
}

/// Upper bound for any single orchestration in these tests.
pub const WAIT: Duration = Duration::from_secs(20);
