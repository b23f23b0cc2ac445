//! Reclamation of stale and orphaned workspaces.
//!
//! The sweeper only decides *what* to reclaim; every filesystem and branch
//! operation goes through [`WorkspaceManager`]. A failed reclaim is logged
//! and left in place, so the next sweep retries it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, OrchestrationEvent};
use crate::workspace::{WorkspaceId, WorkspaceManager};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Stale workspaces that were reclaimed.
    pub reclaimed: Vec<WorkspaceId>,
    /// Stale workspaces whose reclaim failed, with the error.
    pub failed: Vec<(WorkspaceId, String)>,
    /// Untracked checkout directories that were removed.
    pub orphans_removed: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CleanupSweeper {
    workspaces: Arc<WorkspaceManager>,
    events: EventBus,
}

impl CleanupSweeper {
    pub fn new(workspaces: Arc<WorkspaceManager>, events: EventBus) -> Self {
        Self { workspaces, events }
    }

    /// Reclaim idle workspaces unused for longer than `retention`, then any
    /// checkout directory that no workspace owns and that is itself older
    /// than `retention`. Safe to run repeatedly, and from several processes
    /// sharing one workspace root and state store.
    pub async fn sweep(&self, retention: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        for workspace in self.workspaces.find_stale(retention).await {
            match self.workspaces.reclaim(workspace.id).await {
                Ok(()) => report.reclaimed.push(workspace.id),
                Err(e) => {
                    warn!(workspace = %workspace.id.short(), error = %e, "stale workspace reclaim failed, will retry next sweep");
                    report.failed.push((workspace.id, e.to_string()));
                }
            }
        }

        match self.workspaces.find_orphans(retention).await {
            Ok(orphans) => {
                for path in orphans {
                    match self.workspaces.reclaim_orphan(&path).await {
                        Ok(()) => report.orphans_removed.push(path),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "orphaned checkout removal failed")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "orphan scan failed"),
        }

        info!(
            reclaimed = report.reclaimed.len(),
            failed = report.failed.len(),
            orphans = report.orphans_removed.len(),
            "workspace sweep finished"
        );
        self.events.emit(OrchestrationEvent::SweepCompleted {
            reclaimed: report.reclaimed.len(),
            failed: report.failed.len(),
            orphans_removed: report.orphans_removed.len(),
        });
        report
    }
}

/// Handle to a running background actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs [`CleanupSweeper::sweep`] on a fixed interval.
pub struct CleanupActor;

impl CleanupActor {
    /// The first sweep runs immediately.
    pub fn spawn(sweeper: Arc<CleanupSweeper>, interval: Duration, retention: Duration) -> ActorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        debug!(?interval, ?retention, "CleanupActor::spawn");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("CleanupActor cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        sweeper.sweep(retention).await;
                    }
                }
            }
        });

        ActorHandle::new(cancel)
    }
}
