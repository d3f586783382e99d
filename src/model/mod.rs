//! Cluster data model: identifiers, agent cards, tasks, and plans.

pub mod agent;
pub mod task;
pub mod types;

pub use agent::{AgentCard, AgentStatus};
pub use task::{
    MergeStatus, PlanError, PlannedTask, Task, TaskContext, TaskPlan, TaskResult, TaskStatus,
    TaskType,
};
pub use types::{AgentId, BranchName, TaskId, ValidationError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix milliseconds.
///
/// Heartbeats and lock stamps are compared across processes, so everything
/// uses the same representation.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
