//! Integration test suite for taskforge.
//!
//! These tests drive the public `Forge` API against real git repositories
//! created in temporary directories. Agents are in-process fixtures that
//! edit their worktree according to a small script, so no agent CLI is
//! required.
//!
//! # Test Categories
//!
//! - `workspace_lifecycle`: Worktree provisioning, release, reclaim and rollback
//! - `group_execution`: Task groups end to end
//! - `compare_agents`: Multi-agent comparison and file merging
//! - `sweeper`: Stale and orphaned workspace cleanup
//! - `planner_props`: Property tests for planning and failure propagation

mod fixtures;

mod group_execution;
mod planner_props;
mod sweeper;
