//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module validates a group's dependency edges and turns them into
//! ordered execution stages. Planning is a pure function of the task list:
//! nothing is started, acquired or persisted here.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Scheduling policy for a task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// One task per stage, in dependency order.
    Sequential,
    /// All tasks in a single stage; dependencies are only validated.
    Parallel,
    /// Topological layering; each layer runs concurrently.
    #[default]
    Mixed,
}

impl std::fmt::Display for GroupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupMode::Sequential => write!(f, "sequential"),
            GroupMode::Parallel => write!(f, "parallel"),
            GroupMode::Mixed => write!(f, "mixed"),
        }
    }
}

/// A set of tasks eligible to run concurrently.
///
/// Stage `k` may only start once every task of stages `0..k` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStage {
    pub index: usize,
    pub tasks: Vec<TaskId>,
}

/// Compute execution stages for a set of tasks.
///
/// # Errors
/// - [`Error::DuplicateTask`] if two tasks share an id
/// - [`Error::UnknownDependency`] if an edge references a missing task
/// - [`Error::Cycle`] naming every task that sits on a cycle
pub fn plan(tasks: &[Task], mode: GroupMode) -> Result<Vec<ExecutionStage>> {
    let dag = TaskDAG::from_tasks(tasks)?;
    Ok(dag.stages(mode))
}

/// The validated task dependency graph.
///
/// Nodes are task ids, inserted in submission order so that `NodeIndex`
/// order doubles as the tie-breaker for equally eligible tasks. An edge
/// `a -> b` means `b` depends on `a`.
pub struct TaskDAG {
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Build and validate the graph for a group's tasks.
    pub fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id.to_string()));
            }
            let index = graph.add_node(task.id.clone());
            task_index.insert(task.id.clone(), index);
        }

        for task in tasks {
            let to = task_index[&task.id];
            let mut seen = HashSet::new();
            for dep in &task.dependencies {
                let from = *task_index
                    .get(dep)
                    .ok_or_else(|| Error::UnknownDependency {
                        task: task.id.to_string(),
                        dependency: dep.to_string(),
                    })?;
                if seen.insert(from) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let dag = Self { graph, task_index };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<()> {
        if !is_cyclic_directed(&self.graph) {
            return Ok(());
        }

        let mut members: Vec<NodeIndex> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || self.graph.contains_edge(component[0], component[0])
            })
            .flatten()
            .collect();
        members.sort();

        Err(Error::Cycle {
            task_ids: members
                .into_iter()
                .map(|index| self.graph[index].to_string())
                .collect(),
        })
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Every task that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut dependents = HashSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return dependents;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                dependents.insert(self.graph[node].clone());
            }
        }
        dependents
    }

    /// Stages for the given scheduling mode.
    pub fn stages(&self, mode: GroupMode) -> Vec<ExecutionStage> {
        let groups: Vec<Vec<TaskId>> = match mode {
            GroupMode::Sequential => self
                .sequential_order()
                .into_iter()
                .map(|id| vec![id])
                .collect(),
            GroupMode::Parallel => {
                if self.graph.node_count() == 0 {
                    Vec::new()
                } else {
                    vec![self.graph.node_weights().cloned().collect()]
                }
            }
            GroupMode::Mixed => self.layers(),
        };

        groups
            .into_iter()
            .enumerate()
            .map(|(index, tasks)| ExecutionStage { index, tasks })
            .collect()
    }

    fn indegrees(&self) -> Vec<usize> {
        self.graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect()
    }

    /// Topological layering: layer `k` holds tasks whose dependencies all
    /// sit in layers `< k`. Tasks keep submission order inside a layer.
    fn layers(&self) -> Vec<Vec<TaskId>> {
        let mut indegree = self.indegrees();
        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| indegree[i.index()] == 0)
            .collect();
        let mut layers = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    indegree[succ.index()] -= 1;
                    if indegree[succ.index()] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort();
            layers.push(current.iter().map(|i| self.graph[*i].clone()).collect());
            current = next;
        }

        layers
    }

    /// Kahn's algorithm, always taking the earliest-submitted ready task.
    fn sequential_order(&self) -> Vec<TaskId> {
        let mut indegree = self.indegrees();
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|i| indegree[i.index()] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(Reverse(node)) = ready.pop() {
            order.push(self.graph[node].clone());
            for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                indegree[succ.index()] -= 1;
                if indegree[succ.index()] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        order
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
