//! Stale and orphaned workspace cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_test::assert_ok;

use taskforge::events::OrchestrationEvent;
use taskforge::orchestration::ExecutorRegistry;
use taskforge::store::JsonFileStore;
use taskforge::workspace::WorkspaceState;
use taskforge::Forge;

use crate::fixtures::{test_config, Harness, WAIT};

/// A second process sharing the harness's repository, workspace root and
/// state directory.
fn neighbour(h: &Harness) -> Forge {
    let store = Arc::new(JsonFileStore::new(h.scratch.path().join("state")));
    Forge::new(test_config(h.scratch.path()), h.backend.clone(), ExecutorRegistry::new(), store)
        .expect("Failed to build second forge")
}

#[tokio::test]
async fn test_sweep_reclaims_only_idle_workspaces() {
    let h = Harness::new(vec![]);
    let workspaces = h.forge.workspaces();
    let busy = assert_ok!(workspaces.acquire("busy", "HEAD").await);
    let done = assert_ok!(workspaces.acquire("done", "HEAD").await);
    assert_ok!(workspaces.release(done.id).await);

    let report = h.forge.sweep_stale_workspaces(Duration::ZERO).await;

    assert_eq!(report.reclaimed, vec![done.id]);
    assert!(report.failed.is_empty());
    assert!(report.orphans_removed.is_empty());
    assert!(!done.path.exists());
    assert!(!h.repo.branches().contains(&done.branch_ref));

    let remaining = workspaces.get(busy.id).await.unwrap();
    assert_eq!(remaining.state, WorkspaceState::Active);
    assert!(busy.path.exists());
}

#[tokio::test]
async fn test_sweep_respects_retention() {
    let h = Harness::new(vec![]);
    let workspaces = h.forge.workspaces();
    let ws = assert_ok!(workspaces.acquire("recent", "HEAD").await);
    assert_ok!(workspaces.release(ws.id).await);

    let report = h.forge.sweep_stale_workspaces(Duration::from_secs(3600)).await;
    assert!(report.is_clean());
    assert!(report.reclaimed.is_empty());
    assert!(ws.path.exists());
}

#[tokio::test]
async fn test_sweep_removes_orphaned_checkouts() {
    let h = Harness::new(vec![]);
    let root = h.worktrees_dir();
    std::fs::create_dir_all(&root).unwrap();

    // A worktree left by a crashed process, and a bare leftover directory.
    let ghost = root.join("ghost");
    h.repo.add_worktree("tf/ghost", &ghost);
    let leftover = root.join("leftover");
    std::fs::create_dir_all(leftover.join("src")).unwrap();
    assert_eq!(h.repo.worktree_count(), 2);

    let tracked = assert_ok!(h.forge.workspaces().acquire("tracked", "HEAD").await);
    let mut rx = h.forge.subscribe();

    let report = h.forge.sweep_stale_workspaces(Duration::ZERO).await;

    assert_eq!(report.orphans_removed, vec![ghost.clone(), leftover.clone()]);
    assert!(!ghost.exists());
    assert!(!leftover.exists());
    assert!(!h.repo.branches().contains(&"tf/ghost".to_string()));
    assert!(tracked.path.exists(), "tracked workspaces are never orphans");
    assert_eq!(h.repo.worktree_count(), 2);

    let envelope = assert_ok!(rx.try_recv());
    assert_eq!(
        envelope.event,
        OrchestrationEvent::SweepCompleted {
            reclaimed: 0,
            failed: 0,
            orphans_removed: 2
        }
    );
}

#[tokio::test]
async fn test_recent_leftovers_wait_for_retention() {
    let h = Harness::new(vec![]);
    let root = h.worktrees_dir();
    let leftover = root.join("half-written");
    std::fs::create_dir_all(&leftover).unwrap();

    let report = h.forge.sweep_stale_workspaces(Duration::from_secs(3600)).await;
    assert!(report.orphans_removed.is_empty());
    assert!(leftover.exists());

    let report = h.forge.sweep_stale_workspaces(Duration::ZERO).await;
    assert_eq!(report.orphans_removed, vec![leftover.clone()]);
    assert!(!leftover.exists());
}

/// Given two processes sharing one workspace root and state store
/// When one sweeps while the other holds a workspace
/// Then the held checkout survives every retention
#[tokio::test]
async fn test_sweep_spares_workspaces_of_other_processes() {
    let h = Harness::new(vec![]);
    let in_use = assert_ok!(h.forge.workspaces().acquire("in-use", "HEAD").await);

    let other = neighbour(&h);
    assert!(other.workspaces().list().await.is_empty());

    for retention in [Duration::from_secs(24 * 60 * 60), Duration::ZERO] {
        let report = other.sweep_stale_workspaces(retention).await;
        assert!(report.is_clean());
        assert!(report.orphans_removed.is_empty(), "removed {:?}", report.orphans_removed);
    }
    assert!(in_use.path.exists());
    assert!(h.repo.branches().contains(&in_use.branch_ref));
    assert_eq!(
        h.forge.workspaces().get(in_use.id).await.unwrap().state,
        WorkspaceState::Active
    );

    // Once released, the record ages like any other idle checkout.
    assert_ok!(h.forge.workspaces().release(in_use.id).await);
    let report = other.sweep_stale_workspaces(Duration::from_secs(24 * 60 * 60)).await;
    assert!(report.orphans_removed.is_empty());
    assert!(in_use.path.exists());
}

#[tokio::test]
async fn test_background_sweeper_until_shutdown() {
    let h = Harness::with_config(vec![], |c| {
        c.cleanup.interval_secs = 1;
        c.cleanup.retention_secs = 0;
    });
    let workspaces = h.forge.workspaces();
    let ws = assert_ok!(workspaces.acquire("short-lived", "HEAD").await);
    assert_ok!(workspaces.release(ws.id).await);

    let handle = h.forge.spawn_sweeper();
    timeout(WAIT, async {
        while workspaces.get(ws.id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sweeper never reclaimed the workspace");
    assert!(!ws.path.exists());

    handle.shutdown();
    assert!(handle.is_cancelled());
}
