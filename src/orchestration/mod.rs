//! Orchestration of agent runs.
//!
//! Task groups run through [`group::GroupController`], multi-agent
//! comparisons through [`compare::CompareOrchestrator`]. Both reach agent
//! backends only through the [`executor::AgentExecutor`] trait.

pub mod compare;
pub mod executor;
pub mod group;

#[cfg(test)]
pub(crate) mod testing;

pub use compare::{
    aggregate_status, CompareConfig, CompareFiles, CompareId, CompareOrchestrator, CompareStatus,
    CompareTask, SubTask, SubTaskStatus,
};
pub use executor::{
    AgentEvent, AgentExecutor, CommandExecutor, ExecutionRequest, ExecutorKind, ExecutorRegistry,
};
pub use group::{GroupController, GroupId, GroupSettings, GroupSpec, GroupStatus, Progress, TaskGroup};
