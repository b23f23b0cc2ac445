//! Agent executors.
//!
//! An [`AgentExecutor`] takes an instruction and a working directory and
//! streams [`AgentEvent`]s back over a channel, closing it when the run is
//! over. The orchestration layer never branches on [`ExecutorKind`] beyond
//! picking the executor out of an [`ExecutorRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ExecutorSettings};
use crate::error::FailureKind;
use crate::{Error, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    Claude,
    Codex,
    Gemini,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 3] = [
        ExecutorKind::Claude,
        ExecutorKind::Codex,
        ExecutorKind::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Claude => "claude",
            ExecutorKind::Codex => "codex",
            ExecutorKind::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(ExecutorKind::Claude),
            "codex" => Ok(ExecutorKind::Codex),
            "gemini" => Ok(ExecutorKind::Gemini),
            other => Err(Error::Validation(format!("unknown executor kind: {}", other))),
        }
    }
}

/// One item of an executor's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Progress { message: String },
    Result { output: String },
    Error { kind: FailureKind, message: String },
    Done,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub instruction: String,
    /// Checkout to run in; `None` runs in the process working directory.
    pub workdir: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(instruction: impl Into<String>, workdir: Option<PathBuf>) -> Self {
        Self {
            instruction: instruction.into(),
            workdir,
        }
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Start a run. Errors returned here mean the run never started; errors
    /// after that arrive as [`AgentEvent::Error`]. The executor observes
    /// `cancel` and closes the stream once it has stopped.
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>>;
}

/// Drain an event stream into the run's final output.
///
/// A reported error wins over a result. A stream that closes without
/// either is a transport failure, or `Cancelled` if `cancel` fired.
pub async fn collect_events(
    mut events: mpsc::Receiver<AgentEvent>,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut output = None;
    let mut failure = None;

    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Progress { message } => debug!(%message, "agent progress"),
            AgentEvent::Result { output: out } => output = Some(out),
            AgentEvent::Error { kind, message } => {
                failure.get_or_insert(Error::execution(kind, message));
            }
            AgentEvent::Done => break,
        }
    }

    if let Some(err) = failure {
        return Err(if cancel.is_cancelled() {
            Error::Cancelled
        } else {
            err
        });
    }
    match output {
        Some(out) => Ok(out),
        None if cancel.is_cancelled() => Err(Error::Cancelled),
        None => Err(Error::execution(
            FailureKind::Transport,
            "event stream closed without a result",
        )),
    }
}

/// Executors by kind.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command-line executors for every kind, using `[executors.<kind>]`
    /// settings where present.
    pub fn from_config(config: &Config) -> Self {
        for name in config.executors.keys() {
            if name.parse::<ExecutorKind>().is_err() {
                warn!(executor = %name, "ignoring settings for unknown executor kind");
            }
        }
        let mut registry = Self::new();
        for kind in ExecutorKind::ALL {
            let settings = config
                .executors
                .get(kind.as_str())
                .cloned()
                .unwrap_or_else(|| ExecutorSettings::default_for(kind));
            registry.register(Arc::new(CommandExecutor::from_settings(kind, &settings)));
        }
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn AgentExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, kind: ExecutorKind) -> Result<Arc<dyn AgentExecutor>> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::ExecutorNotConfigured(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<ExecutorKind> {
        let mut kinds: Vec<ExecutorKind> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Runs an agent CLI as a child process, one line of stdout per progress
/// event. The instruction is passed as the last argument.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    kind: ExecutorKind,
    program: String,
    args: Vec<String>,
    options: BTreeMap<String, toml::Value>,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(kind: ExecutorKind, program: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            options: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn from_settings(kind: ExecutorKind, settings: &ExecutorSettings) -> Self {
        Self {
            kind,
            program: settings.command.clone(),
            args: settings.args.clone(),
            options: settings
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: settings.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments for one run: fixed args, then options as `--key value`
    /// flags (`--key` alone for `true`, skipped for `false`), then the
    /// instruction.
    pub fn command_args(&self, instruction: &str) -> Vec<String> {
        let mut args = self.args.clone();
        for (key, value) in &self.options {
            match value {
                toml::Value::Boolean(true) => args.push(format!("--{}", key)),
                toml::Value::Boolean(false) => {}
                toml::Value::String(s) => {
                    args.push(format!("--{}", key));
                    args.push(s.clone());
                }
                toml::Value::Array(items) => {
                    for item in items {
                        args.push(format!("--{}", key));
                        args.push(match item {
                            toml::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        });
                    }
                }
                other => {
                    args.push(format!("--{}", key));
                    args.push(other.to_string());
                }
            }
        }
        args.push(instruction.to_string());
        args
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        let binary = which::which(&self.program).map_err(|_| {
            Error::execution(
                FailureKind::Validation,
                format!("{} binary not found: {}", self.kind, self.program),
            )
        })?;

        let mut command = Command::new(&binary);
        command
            .args(self.command_args(&request.instruction))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::execution(
                FailureKind::Validation,
                format!("failed to start {}: {}", self.kind, e),
            )
        })?;
        info!(kind = %self.kind, pid = ?child.id(), "agent process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let kind = self.kind;
        let timeout = self.timeout;
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });

            let deadline = async move {
                match timeout {
                    Some(limit) => sleep_until(Instant::now() + limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline);

            let mut collected = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = child.kill().await;
                            debug!(%kind, "agent process killed on cancellation");
                            return;
                        }
                        _ = tx.closed() => {
                            let _ = child.kill().await;
                            debug!(%kind, "agent process killed, nobody is reading its events");
                            return;
                        }
                        _ = &mut deadline => {
                            let _ = child.kill().await;
                            let event = AgentEvent::Error {
                                kind: FailureKind::Timeout,
                                message: format!("{} did not finish within {:?}", kind, timeout.unwrap_or_default()),
                            };
                            if tx.send(event).await.is_ok() {
                                let _ = tx.send(AgentEvent::Done).await;
                            }
                            return;
                        }
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                collected.push_str(&line);
                                collected.push('\n');
                                if tx.send(AgentEvent::Progress { message: line }).await.is_err() {
                                    let _ = child.kill().await;
                                    debug!(%kind, "agent process killed, event receiver dropped");
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ = child.kill().await;
                                let event = AgentEvent::Error {
                                    kind: FailureKind::Transport,
                                    message: e.to_string(),
                                };
                                if tx.send(event).await.is_ok() {
                                    let _ = tx.send(AgentEvent::Done).await;
                                }
                                return;
                            }
                        }
                    }
                }
            }

            let status = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                _ = tx.closed() => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => status,
            };
            let stderr = stderr_task.await.unwrap_or_default();

            let event = match status {
                Ok(status) if status.success() => AgentEvent::Result {
                    output: collected.trim_end().to_string(),
                },
                Ok(status) => AgentEvent::Error {
                    kind: FailureKind::Internal,
                    message: format!(
                        "{} exited with code {}: {}",
                        kind,
                        status.code().unwrap_or(-1),
                        stderr.trim()
                    ),
                },
                Err(e) => AgentEvent::Error {
                    kind: FailureKind::Transport,
                    message: e.to_string(),
                },
            };
            if tx.send(event).await.is_err() || tx.send(AgentEvent::Done).await.is_err() {
                debug!(%kind, "agent finished after its events were abandoned");
            }
        });

        Ok(rx)
    }
}
