//! Fire-and-forget notifications of orchestration state changes.
//!
//! Delivery is best effort: `emit` never waits, events sent with no
//! subscriber are dropped and slow subscribers may lag. Consumers that need
//! the authoritative state re-read it from the controllers or the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::{TaskId, TaskState};
use crate::orchestration::compare::{CompareId, CompareStatus, SubTaskStatus};
use crate::orchestration::executor::ExecutorKind;
use crate::orchestration::group::{GroupId, GroupStatus, Progress};
use crate::workspace::WorkspaceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    GroupStatusChanged {
        group_id: GroupId,
        status: GroupStatus,
    },
    GroupProgress {
        group_id: GroupId,
        progress: Progress,
    },
    TaskStateChanged {
        group_id: GroupId,
        task_id: TaskId,
        state: TaskState,
    },
    CompareStatusChanged {
        compare_id: CompareId,
        status: CompareStatus,
    },
    SubTaskStatusChanged {
        compare_id: CompareId,
        executor: ExecutorKind,
        status: SubTaskStatus,
    },
    WorkspaceAcquired {
        workspace_id: WorkspaceId,
        owner: String,
    },
    WorkspaceReleased {
        workspace_id: WorkspaceId,
    },
    WorkspaceReclaimed {
        workspace_id: WorkspaceId,
    },
    SweepCompleted {
        reclaimed: usize,
        failed: usize,
        orphans_removed: usize,
    },
}

/// An event with its position in the bus's emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    pub event: OrchestrationEvent,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: OrchestrationEvent) {
        let envelope = EventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            emitted_at: Utc::now(),
            event,
        };
        // No subscribers is fine.
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}
