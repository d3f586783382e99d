//! Tasks, results, and plans.
//!
//! The task state machine lives here as data ([`TaskStatus::can_transition`])
//! so the store, the tests, and the property suite all share one edge table.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::types::{AgentId, BranchName, TaskId};

/// `Display` via `as_str` — shared by the status enums.
macro_rules! fmt_as_str {
    () => {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    };
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Where a task is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Written to the store, waiting for a claim.
    #[default]
    Submitted,
    /// Claimed by exactly one agent.
    Assigned,
    /// The claiming agent started executing.
    Working,
    /// The handler reported success.
    Completed,
    /// The handler reported failure, or the merge of the result branch failed.
    Failed,
}

impl TaskStatus {
    /// Stable lowercase name, matching the serde representation and the
    /// `tasks.<status>.<id>` event subjects.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Assigned => "assigned",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// The state-machine edge table.
    ///
    /// `Completed -> Failed` is the merge-failure path: a completed task
    /// whose branch cannot be merged is failed and then requeued.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Submitted, Self::Assigned)
                | (Self::Assigned, Self::Working)
                | (Self::Assigned | Self::Working | Self::Failed, Self::Submitted)
                | (Self::Working, Self::Completed)
                | (Self::Working | Self::Completed, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fmt_as_str!();
}

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// Broad category of work, a routing hint for handlers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Implement,
    Test,
    Review,
    Refactor,
    /// Anything else; the tag is passed through to the handler untouched.
    #[serde(untagged)]
    Other(String),
}

// ---------------------------------------------------------------------------
// MergeStatus
// ---------------------------------------------------------------------------

/// Outcome of merging a task's result branch into the working branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    /// Merged cleanly.
    Merged,
    /// Merged after the conflict resolver arbitrated.
    ConflictResolved,
    /// The merge could not complete.
    MergeFailed,
}

impl MergeStatus {
    /// Stable lowercase name, matching the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merged => "merged",
            Self::ConflictResolved => "conflict_resolved",
            Self::MergeFailed => "merge_failed",
        }
    }

    /// Whether the branch actually landed on the working branch.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Merged | Self::ConflictResolved)
    }
}

impl std::fmt::Display for MergeStatus {
    fmt_as_str!();
}

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

/// What a handler (and later, the merge pipeline) produced for a task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The branch the handler committed its work to, if any.
    #[serde(default)]
    pub branch: Option<BranchName>,
    /// Free-form summary of what was done.
    #[serde(default)]
    pub summary: String,
    /// Merge outcome, attached by the orchestrator after completion.
    /// `None` until the merge pipeline has run.
    #[serde(default)]
    pub merge_status: Option<MergeStatus>,
    /// The merge commit on the working branch, when the merge succeeded.
    #[serde(default)]
    pub merge_commit: Option<String>,
}

impl TaskResult {
    /// A result that indicates success to the worker: it carries a branch
    /// or a non-empty summary.
    #[must_use]
    pub fn indicates_success(&self) -> bool {
        self.branch.is_some() || !self.summary.is_empty()
    }

    /// Whether the merge pipeline has recorded an outcome.
    #[must_use]
    pub const fn has_merge_status(&self) -> bool {
        self.merge_status.is_some()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Repository coordinates a task executes against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Logical repository name; also the first half of lock keys.
    #[serde(default)]
    pub repo: String,
    /// The branch workers branch off of.
    #[serde(default)]
    pub base_branch: String,
    /// Paths the task is expected to touch. A hint, not a contract.
    #[serde(default)]
    pub files_hint: Vec<String>,
}

/// A unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Cluster-unique identity.
    pub id: TaskId,
    /// Broad category of work.
    #[serde(default)]
    pub task_type: TaskType,
    /// One-line title; becomes part of merge commit messages.
    #[serde(default)]
    pub title: String,
    /// Full description handed to the handler (and the conflict resolver).
    #[serde(default)]
    pub description: String,
    /// Required capabilities. Empty means any worker may claim it.
    #[serde(default)]
    pub specialization: Vec<String>,
    /// Coarse scheduling hint; higher is claimed first.
    #[serde(default)]
    pub priority: i32,
    /// Who submitted the task.
    #[serde(default)]
    pub created_by: Option<AgentId>,
    /// Where the work happens.
    #[serde(default)]
    pub context: TaskContext,
    /// Tasks that must complete before this one is submitted.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Lifecycle state.
    #[serde(default)]
    pub status: TaskStatus,
    /// The single agent holding the claim, while status is
    /// assigned/working/completed.
    #[serde(default)]
    pub assigned_to: Option<AgentId>,
    /// Handler output plus merge outcome.
    #[serde(default)]
    pub result: Option<TaskResult>,
}

impl Task {
    /// A minimal task: id plus title, everything else default.
    #[must_use]
    pub fn new(id: TaskId, title: impl Into<String>) -> Self {
        Self {
            id,
            task_type: TaskType::default(),
            title: title.into(),
            description: String::new(),
            specialization: Vec::new(),
            priority: 0,
            created_by: None,
            context: TaskContext::default(),
            depends_on: Vec::new(),
            status: TaskStatus::Submitted,
            assigned_to: None,
            result: None,
        }
    }

    /// Whether a worker advertising `capabilities` may claim this task:
    /// empty specialization matches anyone, otherwise any overlap matches.
    #[must_use]
    pub fn matches_capabilities(&self, capabilities: &[String]) -> bool {
        self.specialization.is_empty()
            || self.specialization.iter().any(|s| capabilities.contains(s))
    }

    /// The task is successfully merged: completed with a successful merge
    /// status recorded.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.status == TaskStatus::Completed
            && self
                .result
                .as_ref()
                .and_then(|r| r.merge_status)
                .is_some_and(MergeStatus::is_success)
    }
}

// ---------------------------------------------------------------------------
// TaskPlan
// ---------------------------------------------------------------------------

/// One node of a plan: the task plus the dependencies it waits on.
///
/// `depends_on` here is authoritative; it is copied onto the task when the
/// plan is stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// The task to run.
    pub task: Task,
    /// Ids of plan tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

/// A DAG of tasks submitted as a unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    /// The plan's tasks, in submission order.
    pub tasks: Vec<PlannedTask>,
}

/// Why a plan was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Two plan entries share an id.
    #[error("plan contains task `{id}` twice")]
    DuplicateTask { id: TaskId },
    /// A dependency names a task outside the plan.
    #[error("task `{id}` depends on `{dependency}`, which is not in the plan")]
    UnknownDependency { id: TaskId, dependency: TaskId },
    /// The dependency graph has a cycle.
    #[error("plan dependencies contain a cycle through `{id}`")]
    Cycle { id: TaskId },
}

impl TaskPlan {
    /// Validate the plan: unique ids, dependencies resolvable within the
    /// plan, and no cycles.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut ids = HashSet::new();
        for planned in &self.tasks {
            if !ids.insert(planned.task.id.clone()) {
                return Err(PlanError::DuplicateTask {
                    id: planned.task.id.clone(),
                });
            }
        }
        for planned in &self.tasks {
            for dep in &planned.depends_on {
                if !ids.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        id: planned.task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; leftover in-degrees mean a cycle.
        let mut indegree: HashMap<&TaskId, usize> = HashMap::new();
        let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for planned in &self.tasks {
            indegree.entry(&planned.task.id).or_insert(0);
            for dep in &planned.depends_on {
                *indegree.entry(&planned.task.id).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(&planned.task.id);
            }
        }
        let mut ready: Vec<&TaskId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = ready.pop() {
            visited += 1;
            for dependent in dependents.get(id).into_iter().flatten() {
                let d = indegree
                    .get_mut(dependent)
                    .expect("dependent is a plan task");
                *d -= 1;
                if *d == 0 {
                    ready.push(dependent);
                }
            }
        }
        if visited != self.tasks.len() {
            let stuck = indegree
                .into_iter()
                .find(|(_, d)| *d > 0)
                .map(|(id, _)| id.clone())
                .expect("cycle implies a positive in-degree");
            return Err(PlanError::Cycle { id: stuck });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn planned(id: &str, deps: &[&str]) -> PlannedTask {
        PlannedTask {
            task: Task::new(tid(id), id),
            depends_on: deps.iter().map(|d| tid(d)).collect(),
        }
    }

    // -- state machine --

    #[test]
    fn named_edges_are_allowed() {
        use TaskStatus::{Assigned, Completed, Failed, Submitted, Working};
        for (from, to) in [
            (Submitted, Assigned),
            (Assigned, Working),
            (Assigned, Submitted),
            (Working, Submitted),
            (Working, Completed),
            (Working, Failed),
            (Completed, Failed),
            (Failed, Submitted),
        ] {
            assert!(from.can_transition(to), "{from} -> {to} should be allowed");
        }
    }

    #[test]
    fn unnamed_edges_are_rejected() {
        use TaskStatus::{Assigned, Completed, Failed, Submitted, Working};
        for (from, to) in [
            (Submitted, Working),
            (Submitted, Completed),
            (Submitted, Failed),
            (Assigned, Completed),
            (Assigned, Failed),
            (Completed, Submitted),
            (Completed, Working),
            (Failed, Working),
            (Failed, Completed),
            (Working, Assigned),
        ] {
            assert!(!from.can_transition(to), "{from} -> {to} should be rejected");
        }
    }

    // -- matching --

    #[test]
    fn empty_specialization_matches_anyone() {
        let t = Task::new(tid("t1"), "universal");
        assert!(t.matches_capabilities(&[]));
        assert!(t.matches_capabilities(&["go".to_owned()]));
    }

    #[test]
    fn specialization_requires_overlap() {
        let mut t = Task::new(tid("t2"), "frontend");
        t.specialization = vec!["frontend".to_owned(), "react".to_owned()];
        assert!(!t.matches_capabilities(&["backend".to_owned(), "go".to_owned()]));
        assert!(t.matches_capabilities(&["react".to_owned()]));
    }

    // -- results --

    #[test]
    fn result_success_needs_branch_or_summary() {
        assert!(!TaskResult::default().indicates_success());
        let with_summary = TaskResult {
            summary: "done".to_owned(),
            ..TaskResult::default()
        };
        assert!(with_summary.indicates_success());
        let with_branch = TaskResult {
            branch: Some(BranchName::new("agent/w1/t1").unwrap()),
            ..TaskResult::default()
        };
        assert!(with_branch.indicates_success());
    }

    #[test]
    fn merged_means_completed_with_successful_status() {
        let mut t = Task::new(tid("t3"), "x");
        assert!(!t.is_merged());
        t.status = TaskStatus::Completed;
        t.result = Some(TaskResult {
            merge_status: Some(MergeStatus::MergeFailed),
            ..TaskResult::default()
        });
        assert!(!t.is_merged());
        t.result = Some(TaskResult {
            merge_status: Some(MergeStatus::Merged),
            ..TaskResult::default()
        });
        assert!(t.is_merged());
    }

    // -- plan validation --

    #[test]
    fn valid_chain_passes() {
        let plan = TaskPlan {
            tasks: vec![planned("t1", &[]), planned("t2", &["t1"]), planned("t3", &["t1", "t2"])],
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn duplicate_id_rejected() {
        let plan = TaskPlan {
            tasks: vec![planned("t1", &[]), planned("t1", &[])],
        };
        assert_eq!(
            plan.validate(),
            Err(PlanError::DuplicateTask { id: tid("t1") })
        );
    }

    #[test]
    fn unknown_dependency_rejected() {
        let plan = TaskPlan {
            tasks: vec![planned("t1", &["ghost"])],
        };
        assert!(matches!(
            plan.validate(),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn cycle_rejected() {
        let plan = TaskPlan {
            tasks: vec![planned("t1", &["t2"]), planned("t2", &["t1"])],
        };
        assert!(matches!(plan.validate(), Err(PlanError::Cycle { .. })));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = TaskPlan {
            tasks: vec![planned("t1", &["t1"])],
        };
        assert!(matches!(plan.validate(), Err(PlanError::Cycle { .. })));
    }

    // -- serde --

    #[test]
    fn task_type_other_roundtrips() {
        let t = TaskType::Other("docs".to_owned());
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"docs\"");
        let back: TaskType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn status_strings_match_subjects() {
        assert_eq!(TaskStatus::Submitted.as_str(), "submitted");
        assert_eq!(TaskStatus::Completed.as_str(), "completed");
        assert_eq!(serde_json::to_string(&TaskStatus::Working).unwrap(), "\"working\"");
    }
}
