//! Orchestrator: plan submission, dependency resolution, merge driving.
//!
//! The orchestrator owns one in-memory plan. Roots (tasks with no
//! dependencies) are written at submission; everything else waits until
//! [`Orchestrator::resolve_dependencies`] sees all of its dependencies in
//! the completed set. Resolution is idempotent — the `submitted` set makes
//! repeated calls with the same completed-set produce no new writes, and a
//! `Duplicate` from the store (another resolver got there first) counts as
//! submitted too.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use drover_git::{ConflictResolver, MergeWorktree};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{
    AgentId, MergeStatus, PlanError, PlannedTask, Task, TaskId, TaskPlan, TaskResult, TaskStatus,
};
use crate::tasks::{TaskStore, TaskStoreError};

// ---------------------------------------------------------------------------
// OrchestratorError
// ---------------------------------------------------------------------------

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The plan failed validation.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The task store failed.
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PlanState {
    plan: Vec<PlannedTask>,
    submitted: HashSet<TaskId>,
}

/// Submits task plans and releases downstream tasks as their dependencies
/// complete.
pub struct Orchestrator {
    agent_id: AgentId,
    tasks: TaskStore,
    state: Mutex<PlanState>,
}

impl Orchestrator {
    /// Build an orchestrator that stamps `agent_id` as `created_by` on every
    /// task it writes.
    #[must_use]
    pub fn new(agent_id: AgentId, tasks: TaskStore) -> Self {
        Self {
            agent_id,
            tasks,
            state: Mutex::new(PlanState::default()),
        }
    }

    /// Validate and adopt `plan`, submitting every task with no
    /// dependencies. Returns the submitted roots.
    ///
    /// # Errors
    /// Plan validation failure, or a store failure while writing roots.
    pub async fn submit_plan(&self, plan: TaskPlan) -> Result<Vec<Task>, OrchestratorError> {
        plan.validate()?;

        let roots: Vec<PlannedTask> = {
            let mut state = self.lock();
            state.plan = plan.tasks;
            state.submitted.clear();
            state
                .plan
                .iter()
                .filter(|p| p.depends_on.is_empty())
                .cloned()
                .collect()
        };

        let mut written = Vec::new();
        for planned in roots {
            if let Some(task) = self.write_planned(planned).await? {
                written.push(task);
            }
        }
        info!(
            component = "orchestrator",
            submitted = written.len(),
            "plan adopted"
        );
        Ok(written)
    }

    /// Plan tasks that have any dependency, irrespective of progress.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.lock()
            .plan
            .iter()
            .filter(|p| !p.depends_on.is_empty())
            .map(|p| p.task.clone())
            .collect()
    }

    /// Submit every plan task whose dependencies are all completed and which
    /// has not been submitted yet. Returns the newly submitted tasks;
    /// repeated calls with no new completions return nothing.
    ///
    /// # Errors
    /// Store failure while reading the completed set or writing tasks.
    pub async fn resolve_dependencies(&self) -> Result<Vec<Task>, OrchestratorError> {
        let completed: HashSet<TaskId> = self
            .tasks
            .list_by_status(TaskStatus::Completed)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let ready: Vec<PlannedTask> = {
            let mut state = self.lock();
            let candidates: Vec<PlannedTask> = state
                .plan
                .iter()
                .filter(|p| {
                    !state.submitted.contains(&p.task.id)
                        && !p.depends_on.is_empty()
                        && p.depends_on.iter().all(|dep| completed.contains(dep))
                })
                .cloned()
                .collect();
            // Marked before the write so a concurrent resolver cannot double
            // submit; un-marked again if the write fails.
            for p in &candidates {
                state.submitted.insert(p.task.id.clone());
            }
            candidates
        };

        let mut released = Vec::new();
        for planned in ready {
            let id = planned.task.id.clone();
            match self.write_planned(planned).await {
                Ok(Some(task)) => {
                    info!(
                        component = "orchestrator",
                        task_id = %task.id,
                        "dependencies satisfied, task released"
                    );
                    released.push(task);
                }
                Ok(None) => {}
                Err(e) => {
                    self.lock().submitted.remove(&id);
                    return Err(e);
                }
            }
        }
        Ok(released)
    }

    /// Merge a completed task's branch into the working branch, attach the
    /// outcome, and resolve dependencies.
    ///
    /// On merge success the task gets a second `complete` with merge info
    /// and its branch is deleted; on merge failure it is failed and
    /// requeued. Either way dependency resolution runs afterwards. A task
    /// that has no branch or already has a merge status is left alone.
    ///
    /// # Errors
    /// Store failure. Merge and resolver failures are consumed here — they
    /// fail and requeue the task instead of propagating.
    pub async fn merge_and_resolve(
        &self,
        id: &TaskId,
        worktree: &MergeWorktree,
        resolver: Option<&dyn ConflictResolver>,
    ) -> Result<Vec<Task>, OrchestratorError> {
        let task = self.tasks.get(id).await?;
        if let Some(branch) = mergeable_branch(&task) {
            let result = task.result.clone().unwrap_or_default();
            match worktree
                .merge(branch.as_str(), &task.title, &task.description, resolver)
                .await
            {
                Ok(outcome) => {
                    let merge_status = if outcome.was_conflicted() {
                        MergeStatus::ConflictResolved
                    } else {
                        MergeStatus::Merged
                    };
                    info!(
                        component = "orchestrator",
                        task_id = %id,
                        status = merge_status.as_str(),
                        commit = %outcome.commit,
                        "branch merged"
                    );
                    let updated = TaskResult {
                        merge_status: Some(merge_status),
                        merge_commit: Some(outcome.commit),
                        ..result
                    };
                    match self.tasks.complete(id, updated).await {
                        Ok(_) => {
                            if let Err(e) = worktree.delete_branch(branch.as_str()).await {
                                warn!(
                                    component = "orchestrator",
                                    task_id = %id,
                                    error_kind = "git",
                                    error = %e,
                                    "merged branch could not be deleted"
                                );
                            }
                        }
                        // Recovery moved the task while we were merging;
                        // the monitor already handled it.
                        Err(TaskStoreError::InvalidTransition { .. }) => {
                            warn!(
                                component = "orchestrator",
                                task_id = %id,
                                error_kind = "precondition",
                                "merge info dropped, task left completed state"
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    warn!(
                        component = "orchestrator",
                        task_id = %id,
                        error_kind = "merge",
                        error = %e,
                        "merge failed, failing and requeueing task"
                    );
                    let failed = TaskResult {
                        merge_status: Some(MergeStatus::MergeFailed),
                        ..result
                    };
                    self.fail_and_requeue(id, failed).await?;
                }
            }
        }
        self.resolve_dependencies().await
    }

    // -- internals ----------------------------------------------------------

    /// `fail` then `requeue`, tolerating precondition losses — if the state
    /// moved underneath us, the stale sweep or another monitor owns it now.
    async fn fail_and_requeue(
        &self,
        id: &TaskId,
        result: TaskResult,
    ) -> Result<(), OrchestratorError> {
        match self.tasks.fail(id, result).await {
            Ok(_) | Err(TaskStoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        match self.tasks.requeue(id).await {
            Ok(_) | Err(TaskStoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Submit one planned task, stamping provenance. `Ok(None)` means the
    /// id was already in the store (a concurrent resolver won).
    async fn write_planned(
        &self,
        planned: PlannedTask,
    ) -> Result<Option<Task>, OrchestratorError> {
        let mut task = planned.task;
        task.created_by = Some(self.agent_id.clone());
        task.depends_on = planned.depends_on;
        let id = task.id.clone();
        match self.tasks.submit(task.clone()).await {
            Ok(()) => {
                self.lock().submitted.insert(id);
                Ok(Some(task))
            }
            Err(TaskStoreError::Duplicate { .. }) => {
                self.lock().submitted.insert(id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlanState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The branch to merge, if the task is completed with a branch and no merge
/// outcome yet.
fn mergeable_branch(task: &Task) -> Option<&crate::model::BranchName> {
    if task.status != TaskStatus::Completed {
        return None;
    }
    let result = task.result.as_ref()?;
    if result.has_merge_status() {
        return None;
    }
    result.branch.as_ref()
}
