//! Property tests for planning and failure propagation.

use std::collections::HashMap;

use proptest::prelude::*;
use tokio_test::block_on;

use taskforge::core::{plan, GroupMode, Task, TaskState};
use taskforge::orchestration::{ExecutorKind, GroupSpec, GroupStatus};

use crate::fixtures::{FixtureAgent, Harness};

/// Random acyclic groups: task `i` may only depend on tasks `< i`.
fn arb_dag() -> impl Strategy<Value = (Vec<Task>, Vec<bool>)> {
    (1usize..8).prop_flat_map(|n| {
        (
            prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
            prop::collection::vec(prop::bool::weighted(0.3), n),
        )
            .prop_map(move |(edges, failing)| {
                let tasks = (0..n)
                    .map(|i| {
                        let instruction = if failing[i] { "fail" } else { "" };
                        (0..i)
                            .filter(|&j| edges[i][j])
                            .fold(Task::new(&format!("t{}", i), instruction), |task, j| {
                                task.depends_on(&format!("t{}", j))
                            })
                    })
                    .collect();
                (tasks, failing)
            })
    })
}

fn arb_mode() -> impl Strategy<Value = GroupMode> {
    prop_oneof![
        Just(GroupMode::Sequential),
        Just(GroupMode::Parallel),
        Just(GroupMode::Mixed),
    ]
}

proptest! {
    #[test]
    fn prop_every_task_planned_once((tasks, _) in arb_dag(), mode in arb_mode()) {
        let stages = plan(&tasks, mode).unwrap();

        let mut stage_of = HashMap::new();
        for stage in &stages {
            prop_assert!(!stage.tasks.is_empty());
            for id in &stage.tasks {
                prop_assert!(stage_of.insert(id.clone(), stage.index).is_none());
            }
        }
        prop_assert_eq!(stage_of.len(), tasks.len());

        match mode {
            GroupMode::Parallel => prop_assert_eq!(stages.len(), 1),
            GroupMode::Sequential => prop_assert_eq!(stages.len(), tasks.len()),
            GroupMode::Mixed => {}
        }
        if mode != GroupMode::Parallel {
            for task in &tasks {
                for dep in &task.dependencies {
                    prop_assert!(stage_of[dep] < stage_of[&task.id]);
                }
            }
        }
    }

    #[test]
    fn prop_adding_back_edge_is_a_cycle((mut tasks, _) in arb_dag()) {
        prop_assume!(tasks.len() >= 2);
        let last = tasks.len() - 1;
        tasks[last] = tasks[last].clone().depends_on("t0");
        tasks[0] = tasks[0].clone().depends_on(&format!("t{}", last));
        prop_assert!(plan(&tasks, GroupMode::Mixed).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// With continue_on_error, a task completes iff it and all of its
    /// dependencies succeed, fails iff it ran and failed, and is skipped
    /// otherwise.
    #[test]
    fn prop_failures_skip_exactly_the_dependents((tasks, failing) in arb_dag()) {
        let h = Harness::new(vec![FixtureAgent::new(ExecutorKind::Claude)]);
        let spec = GroupSpec::new("prop", tasks.clone()).continue_on_error(true);

        let group = block_on(async {
            let id = h.forge.start_group(spec).await.unwrap();
            h.forge.wait_for_group(id).await.unwrap()
        });

        let mut ran_ok: Vec<bool> = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            let deps_ok = task
                .dependencies
                .iter()
                .all(|dep| ran_ok[dep.as_str()[1..].parse::<usize>().unwrap()]);
            let state = &group.run(task.id.as_str()).unwrap().state;
            match (deps_ok, failing[i]) {
                (true, false) => prop_assert_eq!(state, &TaskState::Completed),
                (true, true) => prop_assert!(matches!(state, TaskState::Failed { .. }), "{} was {}", task.id, state),
                (false, _) => prop_assert!(matches!(state, TaskState::Skipped { .. }), "{} was {}", task.id, state),
            }
            ran_ok.push(deps_ok && !failing[i]);
        }

        let expected = if failing.iter().any(|f| *f) {
            GroupStatus::CompletedWithFailures
        } else {
            GroupStatus::Completed
        };
        prop_assert_eq!(group.status, expected);
        prop_assert_eq!(group.progress.total, tasks.len());
    }
}
