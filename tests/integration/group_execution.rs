//! Task groups end to end: planning, failure policy, retries, cancellation
//! and workspace cleanup over a real repository.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

use taskforge::core::{GroupMode, Task, TaskState};
use taskforge::events::OrchestrationEvent;
use taskforge::orchestration::{
    ExecutorKind, ExecutorRegistry, GroupId, GroupSpec, GroupStatus, Progress, TaskGroup,
};
use taskforge::store::{JsonFileStore, StateStore};
use taskforge::workspace::WorkspaceState;
use taskforge::{Error, Forge};

use crate::fixtures::{test_config, FixtureAgent, Harness, WAIT};

fn claude() -> Vec<Arc<FixtureAgent>> {
    vec![FixtureAgent::new(ExecutorKind::Claude)]
}

async fn finish(forge: &Forge, id: GroupId) -> TaskGroup {
    timeout(WAIT, forge.wait_for_group(id))
        .await
        .expect("group did not finish in time")
        .expect("group vanished")
}

async fn wait_until_running(forge: &Forge, id: GroupId, task: &str) {
    timeout(WAIT, async {
        loop {
            let group = forge.get_group_status(id).await.unwrap();
            let run = group.run(task).unwrap();
            if run.state == TaskState::Running && run.workspace_id.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never started");
}

fn state_of<'a>(group: &'a TaskGroup, task: &str) -> &'a TaskState {
    &group.run(task).unwrap().state
}

/// Given A -> B -> C where B fails and the group stops on error
/// Then A completes, B fails, C is skipped and the group fails
#[tokio::test]
async fn test_chain_with_failure_stops_group() {
    let h = Harness::new(claude());
    let spec = GroupSpec::new(
        "chain",
        vec![
            Task::new("a", "write a.txt").isolated(),
            Task::new("b", "fail").depends_on("a"),
            Task::new("c", "write c.txt").depends_on("b").isolated(),
        ],
    );

    let id = assert_ok!(h.forge.start_group(spec).await);
    let group = finish(&h.forge, id).await;

    assert_eq!(group.status, GroupStatus::Failed);
    assert_eq!(*state_of(&group, "a"), TaskState::Completed);
    assert!(matches!(state_of(&group, "b"), TaskState::Failed { .. }));
    assert!(matches!(state_of(&group, "c"), TaskState::Skipped { .. }));
    assert_eq!(
        group.progress,
        Progress {
            completed: 1,
            failed: 1,
            skipped: 1,
            total: 3
        }
    );
    assert_eq!(group.run("a").unwrap().output.as_deref(), Some("claude: done"));
    assert!(group.run("b").unwrap().last_error.as_deref().unwrap().contains("claude refused"));
    assert!(group.run("c").unwrap().workspace_id.is_none());

    // A's checkout survives the group until cleanup.
    let ws_id = group.run("a").unwrap().workspace_id.unwrap();
    let ws = h.forge.workspaces().get(ws_id).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Idle);
    assert_eq!(
        std::fs::read_to_string(ws.path.join("a.txt")).unwrap(),
        "a.txt by claude\n"
    );

    let reclaimed = assert_ok!(h.forge.cleanup_group(id).await);
    assert_eq!(reclaimed, vec![ws_id]);
    assert!(!ws.path.exists());
    assert!(!h.repo.branches().contains(&ws.branch_ref));
}

/// Given a diamond where one branch fails and continue_on_error is set
/// Then only the join below the failure is skipped
#[tokio::test]
async fn test_continue_on_error_skips_only_dependents() {
    let h = Harness::new(claude());
    let spec = GroupSpec::new(
        "diamond",
        vec![
            Task::new("root", "write root.txt").isolated(),
            Task::new("left", "fail").depends_on("root"),
            Task::new("right", "write right.txt").depends_on("root").isolated(),
            Task::new("join", "write join.txt").depends_on("left").depends_on("right"),
            Task::new("lone", ""),
        ],
    )
    .continue_on_error(true);

    let id = assert_ok!(h.forge.start_group(spec).await);
    let group = finish(&h.forge, id).await;

    assert_eq!(group.status, GroupStatus::CompletedWithFailures);
    assert_eq!(*state_of(&group, "root"), TaskState::Completed);
    assert_eq!(*state_of(&group, "right"), TaskState::Completed);
    assert_eq!(*state_of(&group, "lone"), TaskState::Completed);
    assert!(matches!(state_of(&group, "left"), TaskState::Failed { .. }));
    assert!(matches!(state_of(&group, "join"), TaskState::Skipped { .. }));
    assert_eq!(group.progress.completed, 3);
    assert_eq!(group.progress.failed, 1);
    assert_eq!(group.progress.skipped, 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let agent = FixtureAgent::new(ExecutorKind::Claude);
    let h = Harness::new(vec![agent.clone()]);
    let spec = GroupSpec::new("flaky", vec![Task::new("net", "flaky 2; write net.txt").isolated()]);

    let id = assert_ok!(h.forge.start_group(spec).await);
    let group = finish(&h.forge, id).await;

    assert_eq!(group.status, GroupStatus::Completed);
    let run = group.run("net").unwrap();
    assert_eq!(run.retry.as_ref().unwrap().attempt, 3);
    // Every attempt ran in the same workspace.
    let ws = h.forge.workspaces().get(run.workspace_id.unwrap()).await.unwrap();
    assert!(ws.path.join("net.txt").exists());
    assert_eq!(agent.workdirs(), vec![Some(ws.path.clone()); 3]);
}

#[tokio::test]
async fn test_retries_exhausted_fails_task() {
    let h = Harness::new(claude());
    let spec = GroupSpec::new("flaky", vec![Task::new("net", "flaky 5")]);

    let id = assert_ok!(h.forge.start_group(spec).await);
    let group = finish(&h.forge, id).await;

    assert_eq!(group.status, GroupStatus::Failed);
    let run = group.run("net").unwrap();
    assert!(matches!(run.state, TaskState::Failed { .. }));
    // One initial attempt plus two retries.
    assert_eq!(run.retry.as_ref().unwrap().attempt, 3);
}

#[tokio::test]
async fn test_sequential_mode_plans_one_task_per_stage() {
    let h = Harness::new(claude());
    let tasks = vec![
        Task::new("docs", ""),
        Task::new("schema", ""),
        Task::new("api", "").depends_on("schema"),
    ];

    let stages = assert_ok!(h.forge.plan_group(&tasks, GroupMode::Sequential, None));
    assert_eq!(stages.len(), 3);
    assert!(stages.iter().all(|s| s.tasks.len() == 1));

    let id = assert_ok!(
        h.forge
            .start_group(GroupSpec::new("seq", tasks).with_mode(GroupMode::Sequential))
            .await
    );
    let group = finish(&h.forge, id).await;
    assert_eq!(group.status, GroupStatus::Completed);
    assert_eq!(group.stages, stages);
}

#[tokio::test]
async fn test_cycle_is_registered_as_failed() {
    let h = Harness::new(claude());
    let spec = GroupSpec::new(
        "cyclic",
        vec![
            Task::new("x", "").depends_on("y"),
            Task::new("y", "").depends_on("x"),
        ],
    );

    assert!(matches!(
        h.forge.plan_group(&spec.tasks, spec.mode, None),
        Err(Error::Cycle { .. })
    ));

    let id = assert_ok!(h.forge.start_group(spec).await);
    let group = finish(&h.forge, id).await;
    assert_eq!(group.status, GroupStatus::Failed);
    assert!(group.error.as_deref().unwrap().contains("cycle"));
    assert_eq!(group.progress.skipped, 2);
    assert!(group.stages.is_empty());
}

#[tokio::test]
async fn test_cancel_reclaims_running_workspaces() {
    let h = Harness::new(claude());
    let spec = GroupSpec::new(
        "stuck",
        vec![
            Task::new("hung", "write partial.txt; hang").isolated(),
            Task::new("after", "").depends_on("hung"),
        ],
    );

    let id = assert_ok!(h.forge.start_group(spec).await);
    wait_until_running(&h.forge, id, "hung").await;

    assert_ok!(h.forge.cancel_group(id).await);
    let group = finish(&h.forge, id).await;

    assert_eq!(group.status, GroupStatus::Cancelled);
    assert_eq!(*state_of(&group, "hung"), TaskState::Cancelled);
    assert_eq!(*state_of(&group, "after"), TaskState::Cancelled);

    // Cancelling again is a no-op.
    assert_ok!(h.forge.cancel_group(id).await);
    assert_eq!(h.forge.get_group_status(id).await.unwrap().status, GroupStatus::Cancelled);

    assert_ok!(h.forge.cleanup_group(id).await);
    assert!(h.forge.workspaces().list().await.is_empty());
    assert_eq!(h.repo.worktree_count(), 1);
}

#[tokio::test]
async fn test_cleanup_rejected_while_running() {
    let h = Harness::new(claude());
    let spec = GroupSpec::new("busy", vec![Task::new("hung", "hang").isolated()]);

    let id = assert_ok!(h.forge.start_group(spec).await);
    wait_until_running(&h.forge, id, "hung").await;

    let err = assert_err!(h.forge.cleanup_group(id).await);
    assert!(matches!(err, Error::Validation(_)));

    assert_ok!(h.forge.cancel_group(id).await);
    finish(&h.forge, id).await;
    assert_ok!(h.forge.cleanup_group(id).await);
}

#[tokio::test]
async fn test_status_events_follow_lifecycle() {
    let h = Harness::new(claude());
    let mut rx = h.forge.subscribe();

    let id = assert_ok!(
        h.forge
            .start_group(GroupSpec::new("events", vec![Task::new("a", ""), Task::new("b", "").depends_on("a")]))
            .await
    );
    finish(&h.forge, id).await;

    let mut statuses = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if let OrchestrationEvent::GroupStatusChanged { group_id, status } = envelope.event {
            assert_eq!(group_id, id);
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![GroupStatus::Running, GroupStatus::Completed]);
}

#[tokio::test]
async fn test_group_state_is_persisted() {
    let h = Harness::new(claude());
    let id = assert_ok!(
        h.forge
            .start_group(GroupSpec::new("saved", vec![Task::new("a", "")]))
            .await
    );
    finish(&h.forge, id).await;

    let store = JsonFileStore::new(h.scratch.path().join("state"));
    let saved = assert_ok!(store.load_group(id).await).expect("group not persisted");
    assert_eq!(saved.status, GroupStatus::Completed);
    assert_eq!(saved.progress.completed, 1);

    let unknown = GroupId::new();
    assert!(matches!(
        h.forge.get_group_status(unknown).await,
        Err(Error::GroupNotFound(_))
    ));
}

/// Given a task whose workspace is still being provisioned
/// When the group is cancelled
/// Then the checkout is removed once provisioning finishes
#[tokio::test]
async fn test_cancel_during_provisioning_removes_checkout() {
    let agent = FixtureAgent::new(ExecutorKind::Claude);
    let h = Harness::new(vec![agent.clone()]);
    h.backend.set_provision_delay(Duration::from_millis(500));

    let id = assert_ok!(
        h.forge
            .start_group(GroupSpec::new("slow", vec![Task::new("a", "write a.txt").isolated()]))
            .await
    );
    timeout(WAIT, async {
        while h.forge.workspaces().list().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("provisioning never started");

    assert_ok!(h.forge.cancel_group(id).await);
    let group = finish(&h.forge, id).await;
    assert_eq!(group.status, GroupStatus::Cancelled);

    timeout(WAIT, async {
        while !h.forge.workspaces().list().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("abandoned workspace was never reclaimed");
    assert_eq!(h.repo.worktree_count(), 1);
    assert_eq!(h.repo.branches().len(), 1);
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_cleaned_up_group_is_served_from_store() {
    let h = Harness::new(claude());
    let id = assert_ok!(
        h.forge
            .start_group(GroupSpec::new("archived", vec![Task::new("a", "write a.txt").isolated()]))
            .await
    );
    let group = finish(&h.forge, id).await;
    assert_ok!(h.forge.cleanup_group(id).await);

    assert!(h.forge.list_groups().await.iter().all(|g| g.id != id));
    let stored = assert_ok!(h.forge.get_group_status(id).await);
    assert_eq!(stored.status, GroupStatus::Completed);
    assert_eq!(stored.completed_at, group.completed_at);
    assert_eq!(finish(&h.forge, id).await.status, GroupStatus::Completed);
    assert_ok!(h.forge.cancel_group(id).await);

    // A fresh process over the same state directory sees the same record.
    let store = Arc::new(JsonFileStore::new(h.scratch.path().join("state")));
    let restarted = assert_ok!(Forge::new(
        test_config(h.scratch.path()),
        h.backend.clone(),
        ExecutorRegistry::new(),
        store
    ));
    let seen = assert_ok!(restarted.get_group_status(id).await);
    assert_eq!(seen.status, GroupStatus::Completed);
    assert_eq!(seen.progress.completed, 1);
}
