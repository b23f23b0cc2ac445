//! Core domain models for task groups.
//!
//! This module contains the task definitions, their execution records and
//! the dependency planner that turns a group into execution stages.

pub mod dag;
pub mod task;

pub use dag::{plan, ExecutionStage, GroupMode, TaskDAG};
pub use task::{Task, TaskId, TaskRun, TaskState};
