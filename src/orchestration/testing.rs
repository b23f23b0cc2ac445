//! Scripted executor for controller tests.
//!
//! The instruction selects the behaviour:
//! - `ok` / anything else: succeed with `done: <instruction>`
//! - `fail`: fatal validation error
//! - `flaky:N`: transport error for the first N runs, then succeed
//! - `slow:MS`: succeed after MS milliseconds
//! - `hang`: run until cancelled, then close the stream
//! - `stubborn`: ignore cancellation and sleep for a minute
//! - `panic`: panic inside `execute`, taking the calling task down

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::executor::{AgentEvent, AgentExecutor, ExecutionRequest, ExecutorKind};
use crate::error::FailureKind;
use crate::Result;

pub(crate) struct ScriptedExecutor {
    kind: ExecutorKind,
    calls: Mutex<Vec<ExecutionRequest>>,
    runs_per_instruction: Mutex<HashMap<String, usize>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn new(kind: ExecutorKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            calls: Mutex::new(Vec::new()),
            runs_per_instruction: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn instructions(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.instruction.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        let instruction = request.instruction.clone();
        let run = {
            let mut runs = self.runs_per_instruction.lock().unwrap();
            let n = runs.entry(instruction.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.calls.lock().unwrap().push(request);
        if instruction == "panic" {
            panic!("scripted executor panicked");
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = RunningGuard(self.running.clone());

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _guard = guard;
            let _ = tx
                .send(AgentEvent::Progress {
                    message: format!("starting {}", instruction),
                })
                .await;

            let event = if instruction == "fail" {
                AgentEvent::Error {
                    kind: FailureKind::Validation,
                    message: "scripted failure".into(),
                }
            } else if let Some(n) = instruction.strip_prefix("flaky:") {
                let failures: usize = n.parse().unwrap_or(0);
                if run <= failures {
                    AgentEvent::Error {
                        kind: FailureKind::Transport,
                        message: format!("flaky run {}", run),
                    }
                } else {
                    AgentEvent::Result {
                        output: format!("done: {}", instruction),
                    }
                }
            } else if let Some(ms) = instruction.strip_prefix("slow:") {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
                AgentEvent::Result {
                    output: format!("done: {}", instruction),
                }
            } else if instruction == "hang" {
                cancel.cancelled().await;
                return;
            } else if instruction == "stubborn" {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            } else {
                AgentEvent::Result {
                    output: format!("done: {}", instruction),
                }
            };

            let _ = tx.send(event).await;
            let _ = tx.send(AgentEvent::Done).await;
        });
        Ok(rx)
    }
}
