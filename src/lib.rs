//! drover — a distributed multi-agent task-execution cluster.
//!
//! Peer nodes cooperate over an embedded message bus with replicated,
//! revisioned KV storage. Agents publish self-descriptions, claim tasks,
//! coordinate edits through file locks, execute work on isolated git
//! branches, and merge those branches back into a shared working branch
//! with pluggable conflict arbitration. A dependency-aware orchestrator
//! releases downstream tasks as their predecessors complete; a monitor
//! recovers tasks and locks abandoned by agents that stop heartbeating.
//!
//! The embedding application supplies two collaborators:
//! [`TaskHandler`](worker::TaskHandler) (what a task actually does) and
//! [`ConflictResolver`](drover_git::ConflictResolver) (how merge conflicts
//! are arbitrated).

pub mod bus;
pub mod config;
pub mod locks;
pub mod model;
pub mod monitor;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod tasks;
pub mod telemetry;
pub mod worker;

pub use drover_git as git;

pub use bus::{Bus, BusError, BusHandle, Kv};
pub use config::NodeConfig;
pub use locks::{FileLock, LockError, LockManager};
pub use model::{
    AgentCard, AgentId, AgentStatus, BranchName, MergeStatus, PlannedTask, Task, TaskContext,
    TaskId, TaskPlan, TaskResult, TaskStatus, TaskType,
};
pub use monitor::Monitor;
pub use node::Node;
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use registry::{AgentRegistry, RegistryError};
pub use tasks::{TaskStore, TaskStoreError};
pub use worker::{TaskHandler, Worker};
