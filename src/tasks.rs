//! Task store.
//!
//! Tasks live in the `tasks` bucket, keyed by task id. Every transition is
//! guarded by the task's revision, so a lost race is re-read and re-judged
//! against the state machine — the caller either wins, or gets an
//! [`TaskStoreError::InvalidTransition`] naming the state that beat it.
//! Events are published on `tasks.<status>.<id>` only after the KV commit.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{BusError, BusHandle, Kv};
use crate::model::{AgentId, Task, TaskId, TaskResult, TaskStatus};

// ---------------------------------------------------------------------------
// TaskStoreError
// ---------------------------------------------------------------------------

/// Errors from task store operations.
///
/// `InvalidTransition` is the "status precondition violated" error: it is
/// how a losing claimer learns someone else won, and is never retried by
/// the store itself.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// No task with this id.
    #[error("task `{id}` not found")]
    NotFound {
        /// The missing task.
        id: TaskId,
    },

    /// A submit collided with an existing task id.
    #[error("task `{id}` already exists")]
    Duplicate {
        /// The colliding id.
        id: TaskId,
    },

    /// The task is not in a state the requested edge starts from.
    #[error("task `{id}` is {from}, cannot transition to {attempted}")]
    InvalidTransition {
        /// The task.
        id: TaskId,
        /// The state the task is actually in.
        from: TaskStatus,
        /// The state the caller tried to reach.
        attempted: TaskStatus,
    },

    /// A stored task cannot be decoded.
    #[error("corrupt record for task `{id}`")]
    Corrupt {
        /// The task whose record is unreadable.
        id: TaskId,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The underlying bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Persist tasks and drive their state machine.
#[derive(Clone)]
pub struct TaskStore {
    kv: Kv,
    bus: BusHandle,
}

impl TaskStore {
    /// Wrap the `tasks` bucket and the bus used for transition events.
    #[must_use]
    pub const fn new(kv: Kv, bus: BusHandle) -> Self {
        Self { kv, bus }
    }

    /// The event subject for a task reaching a status.
    #[must_use]
    pub fn subject(status: TaskStatus, id: &TaskId) -> String {
        format!("tasks.{}.{id}", status.as_str())
    }

    /// Write a new task in `submitted`, unassigned. Rejects duplicate ids.
    ///
    /// # Errors
    /// [`TaskStoreError::Duplicate`] if the id exists; bus failure.
    pub async fn submit(&self, mut task: Task) -> Result<(), TaskStoreError> {
        task.status = TaskStatus::Submitted;
        task.assigned_to = None;
        match self.kv.create(task.id.as_str(), &encode(&task)).await {
            Ok(_) => {
                info!(component = "tasks", task_id = %task.id, "task submitted");
                self.publish(&task).await;
                Ok(())
            }
            Err(BusError::AlreadyExists { .. }) => {
                Err(TaskStoreError::Duplicate { id: task.id })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim a submitted task for `agent` (submitted → assigned).
    ///
    /// Exactly one concurrent claimer wins; the rest get
    /// [`TaskStoreError::InvalidTransition`] naming `assigned`.
    ///
    /// # Errors
    /// Precondition violation, unknown task, or bus failure.
    pub async fn claim(&self, id: &TaskId, agent: &AgentId) -> Result<Task, TaskStoreError> {
        self.transition(id, TaskStatus::Assigned, |task| {
            task.assigned_to = Some(agent.clone());
        })
        .await
    }

    /// Mark an assigned task as being executed (assigned → working).
    ///
    /// # Errors
    /// Precondition violation, unknown task, or bus failure.
    pub async fn set_working(&self, id: &TaskId) -> Result<Task, TaskStoreError> {
        self.transition(id, TaskStatus::Working, |_| {}).await
    }

    /// Record success (working → completed), or attach merge information to
    /// an already-completed task.
    ///
    /// The attach path is a CAS read-modify-write: on a revision conflict it
    /// re-reads and retries, and stops if the task has meanwhile left
    /// `completed` (the recovery path won; the merge info is stale).
    ///
    /// # Errors
    /// Precondition violation, unknown task, or bus failure.
    pub async fn complete(&self, id: &TaskId, result: TaskResult) -> Result<Task, TaskStoreError> {
        loop {
            let (task, _) = self.get_with_revision(id).await?;
            let outcome = match task.status {
                TaskStatus::Working => {
                    self.try_transition(id, TaskStatus::Completed, |task| {
                        task.result = Some(merge_results(task.result.take(), result.clone()));
                    })
                    .await?
                }
                TaskStatus::Completed => {
                    self.try_update_in_place(id, |task| {
                        task.result = Some(merge_results(task.result.take(), result.clone()));
                    })
                    .await?
                }
                from => {
                    return Err(TaskStoreError::InvalidTransition {
                        id: id.clone(),
                        from,
                        attempted: TaskStatus::Completed,
                    })
                }
            };
            match outcome {
                Some(task) => return Ok(task),
                None => debug!(component = "tasks", task_id = %id, "complete lost CAS, retrying"),
            }
        }
    }

    /// Record failure with the handler's (or merge pipeline's) result
    /// (working → failed, or completed → failed on the merge-failure path).
    ///
    /// # Errors
    /// Precondition violation, unknown task, or bus failure.
    pub async fn fail(&self, id: &TaskId, result: TaskResult) -> Result<Task, TaskStoreError> {
        self.transition(id, TaskStatus::Failed, |task| {
            task.result = Some(result.clone());
        })
        .await
    }

    /// Return a task to the queue (assigned/working/failed → submitted),
    /// clearing its assignment. Stale merge fields are cleared too, so the
    /// next completion goes through the merge pipeline afresh.
    ///
    /// # Errors
    /// Precondition violation, unknown task, or bus failure.
    pub async fn requeue(&self, id: &TaskId) -> Result<Task, TaskStoreError> {
        self.transition(id, TaskStatus::Submitted, |task| {
            task.assigned_to = None;
            if let Some(result) = task.result.as_mut() {
                result.merge_status = None;
                result.merge_commit = None;
            }
        })
        .await
    }

    /// Fetch one task.
    ///
    /// # Errors
    /// Unknown task or bus failure.
    pub async fn get(&self, id: &TaskId) -> Result<Task, TaskStoreError> {
        let (task, _) = self.get_with_revision(id).await?;
        Ok(task)
    }

    /// Every task currently in `status`.
    ///
    /// # Errors
    /// Bus failure, or a record that cannot be decoded.
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskStoreError> {
        let mut tasks = Vec::new();
        for key in self.kv.list_keys().await? {
            if let Some((value, _)) = self.kv.get(&key).await? {
                let task = decode(&key, &value)?;
                if task.status == status {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    // -- internals ----------------------------------------------------------

    async fn get_with_revision(
        &self,
        id: &TaskId,
    ) -> Result<(Task, crate::bus::Revision), TaskStoreError> {
        let Some((value, revision)) = self.kv.get(id.as_str()).await? else {
            return Err(TaskStoreError::NotFound { id: id.clone() });
        };
        Ok((decode(id.as_str(), &value)?, revision))
    }

    /// One CAS-guarded state-machine edge. A lost race re-reads and
    /// re-judges, so the caller ends up with either a win or a precondition
    /// violation naming the state that beat it.
    async fn transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        mutate: impl Fn(&mut Task),
    ) -> Result<Task, TaskStoreError> {
        loop {
            match self.try_transition(id, to, &mutate).await? {
                Some(task) => return Ok(task),
                None => debug!(component = "tasks", task_id = %id, "transition lost CAS, retrying"),
            }
        }
    }

    /// A single CAS attempt at an edge. `Ok(None)` means the CAS lost and
    /// the caller should re-read.
    async fn try_transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        mutate: impl Fn(&mut Task),
    ) -> Result<Option<Task>, TaskStoreError> {
        let (mut task, revision) = self.get_with_revision(id).await?;
        if !task.status.can_transition(to) {
            return Err(TaskStoreError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                attempted: to,
            });
        }
        task.status = to;
        mutate(&mut task);
        match self
            .kv
            .compare_and_put(id.as_str(), &encode(&task), revision)
            .await
        {
            Ok(_) => {
                info!(
                    component = "tasks",
                    task_id = %id,
                    status = to.as_str(),
                    "task transitioned"
                );
                self.publish(&task).await;
                Ok(Some(task))
            }
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Same-status update for the merge-info attach path: the task must
    /// still be `completed` at commit time. `Ok(None)` means the CAS lost.
    async fn try_update_in_place(
        &self,
        id: &TaskId,
        mutate: impl Fn(&mut Task),
    ) -> Result<Option<Task>, TaskStoreError> {
        let (mut task, revision) = self.get_with_revision(id).await?;
        if task.status != TaskStatus::Completed {
            return Err(TaskStoreError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                attempted: TaskStatus::Completed,
            });
        }
        mutate(&mut task);
        match self
            .kv
            .compare_and_put(id.as_str(), &encode(&task), revision)
            .await
        {
            Ok(_) => {
                self.publish(&task).await;
                Ok(Some(task))
            }
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish the transition event. Commit already happened; a publish
    /// failure is logged and swallowed — the monitor's periodic tick is the
    /// liveness fallback for missed events.
    async fn publish(&self, task: &Task) {
        let subject = Self::subject(task.status, &task.id);
        let payload = encode(task);
        if let Err(e) = self.bus.publish(&subject, &payload).await {
            warn!(
                component = "tasks",
                task_id = %task.id,
                error_kind = "transport",
                error = %e,
                "failed to publish task event"
            );
        }
    }
}

/// Overlay `update` on `prior`, keeping prior merge fields unless the
/// update carries its own.
fn merge_results(prior: Option<TaskResult>, update: TaskResult) -> TaskResult {
    let Some(prior) = prior else { return update };
    TaskResult {
        branch: update.branch.or(prior.branch),
        summary: if update.summary.is_empty() {
            prior.summary
        } else {
            update.summary
        },
        merge_status: update.merge_status.or(prior.merge_status),
        merge_commit: update.merge_commit.or(prior.merge_commit),
    }
}

fn encode(task: &Task) -> String {
    serde_json::to_string(task).unwrap_or_default()
}

fn decode(key: &str, value: &str) -> Result<Task, TaskStoreError> {
    serde_json::from_str(value).map_err(|source| TaskStoreError::Corrupt {
        id: TaskId::new(key).unwrap_or_else(|_| TaskId::new("unknown").expect("valid id")),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusHandle, TASKS_BUCKET};
    use crate::model::{BranchName, MergeStatus};

    async fn store() -> TaskStore {
        let bus = BusHandle::Local(Bus::open(None).expect("bus"));
        let kv = bus.bucket(TASKS_BUCKET).await.expect("bucket");
        TaskStore::new(kv, bus)
    }

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn aid(s: &str) -> AgentId {
        AgentId::new(s).unwrap()
    }

    #[tokio::test]
    async fn submit_rejects_duplicate_id() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        let err = store.submit(Task::new(tid("t1"), "again")).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn submit_normalizes_status_and_assignment() {
        let store = store().await;
        let mut task = Task::new(tid("t1"), "one");
        task.status = TaskStatus::Working;
        task.assigned_to = Some(aid("sneaky"));
        store.submit(task).await.unwrap();
        let got = store.get(&tid("t1")).await.unwrap();
        assert_eq!(got.status, TaskStatus::Submitted);
        assert_eq!(got.assigned_to, None);
    }

    #[tokio::test]
    async fn claim_assigns_exactly_once() {
        let store = store().await;
        store.submit(Task::new(tid("t3"), "three")).await.unwrap();

        let claimed = store.claim(&tid("t3"), &aid("A")).await.unwrap();
        assert_eq!(claimed.status, TaskStatus::Assigned);
        assert_eq!(claimed.assigned_to, Some(aid("A")));

        let err = store.claim(&tid("t3"), &aid("B")).await.unwrap_err();
        match err {
            TaskStoreError::InvalidTransition { from, .. } => {
                assert_eq!(from, TaskStatus::Assigned);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
        assert_eq!(store.get(&tid("t3")).await.unwrap().assigned_to, Some(aid("A")));
    }

    #[tokio::test]
    async fn full_happy_path() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.claim(&tid("t1"), &aid("w1")).await.unwrap();
        store.set_working(&tid("t1")).await.unwrap();
        let result = TaskResult {
            branch: Some(BranchName::new("agent/w1/t1").unwrap()),
            summary: "done".to_owned(),
            ..TaskResult::default()
        };
        let task = store.complete(&tid("t1"), result).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap().summary, "done");
    }

    #[tokio::test]
    async fn complete_from_submitted_is_rejected() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        let err = store.complete(&tid("t1"), TaskResult::default()).await.unwrap_err();
        assert!(matches!(
            err,
            TaskStoreError::InvalidTransition { from: TaskStatus::Submitted, .. }
        ));
    }

    #[tokio::test]
    async fn second_complete_attaches_merge_info() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.claim(&tid("t1"), &aid("w1")).await.unwrap();
        store.set_working(&tid("t1")).await.unwrap();
        let first = TaskResult {
            branch: Some(BranchName::new("agent/w1/t1").unwrap()),
            summary: "done".to_owned(),
            ..TaskResult::default()
        };
        store.complete(&tid("t1"), first.clone()).await.unwrap();

        let with_merge = TaskResult {
            merge_status: Some(MergeStatus::Merged),
            merge_commit: Some("abc123".to_owned()),
            ..first
        };
        let task = store.complete(&tid("t1"), with_merge).await.unwrap();
        let result = task.result.unwrap();
        assert_eq!(result.merge_status, Some(MergeStatus::Merged));
        assert_eq!(result.summary, "done");
        assert_eq!(result.branch, Some(BranchName::new("agent/w1/t1").unwrap()));
    }

    #[tokio::test]
    async fn attach_preserves_prior_merge_fields_when_update_is_bare() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.claim(&tid("t1"), &aid("w1")).await.unwrap();
        store.set_working(&tid("t1")).await.unwrap();
        store
            .complete(
                &tid("t1"),
                TaskResult {
                    summary: "done".to_owned(),
                    merge_status: Some(MergeStatus::Merged),
                    merge_commit: Some("abc".to_owned()),
                    ..TaskResult::default()
                },
            )
            .await
            .unwrap();

        let task = store
            .complete(
                &tid("t1"),
                TaskResult {
                    summary: String::new(),
                    ..TaskResult::default()
                },
            )
            .await
            .unwrap();
        let result = task.result.unwrap();
        assert_eq!(result.merge_status, Some(MergeStatus::Merged));
        assert_eq!(result.merge_commit, Some("abc".to_owned()));
        assert_eq!(result.summary, "done");
    }

    #[tokio::test]
    async fn fail_then_requeue_clears_assignment() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.claim(&tid("t1"), &aid("w1")).await.unwrap();
        store.set_working(&tid("t1")).await.unwrap();
        store
            .fail(&tid("t1"), TaskResult::default())
            .await
            .unwrap();
        let task = store.requeue(&tid("t1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);
        assert_eq!(task.assigned_to, None);
    }

    #[tokio::test]
    async fn fail_from_completed_is_the_merge_failure_edge() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.claim(&tid("t1"), &aid("w1")).await.unwrap();
        store.set_working(&tid("t1")).await.unwrap();
        store
            .complete(
                &tid("t1"),
                TaskResult {
                    summary: "done".to_owned(),
                    ..TaskResult::default()
                },
            )
            .await
            .unwrap();
        let task = store
            .fail(
                &tid("t1"),
                TaskResult {
                    merge_status: Some(MergeStatus::MergeFailed),
                    ..TaskResult::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn requeue_from_completed_is_rejected() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.claim(&tid("t1"), &aid("w1")).await.unwrap();
        store.set_working(&tid("t1")).await.unwrap();
        store
            .complete(
                &tid("t1"),
                TaskResult {
                    summary: "done".to_owned(),
                    ..TaskResult::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            store.requeue(&tid("t1")).await,
            Err(TaskStoreError::InvalidTransition { from: TaskStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn list_by_status_partitions() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.submit(Task::new(tid("t2"), "two")).await.unwrap();
        store.claim(&tid("t2"), &aid("w1")).await.unwrap();

        let submitted = store.list_by_status(TaskStatus::Submitted).await.unwrap();
        let assigned = store.list_by_status(TaskStatus::Assigned).await.unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].id, tid("t1"));
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].id, tid("t2"));
    }

    #[tokio::test]
    async fn transitions_publish_events_after_commit() {
        let bus = Bus::open(None).expect("bus");
        let handle = BusHandle::Local(bus.clone());
        let kv = handle.bucket(TASKS_BUCKET).await.expect("bucket");
        let store = TaskStore::new(kv, handle);

        let mut events = bus.subscribe("tasks.>");
        store.submit(Task::new(tid("t1"), "one")).await.unwrap();
        store.claim(&tid("t1"), &aid("w1")).await.unwrap();

        let submitted = events.recv().await.unwrap();
        assert_eq!(submitted.subject, "tasks.submitted.t1");
        // The event payload is the full task as committed.
        let task: Task = serde_json::from_str(&submitted.payload).unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);

        let assigned = events.recv().await.unwrap();
        assert_eq!(assigned.subject, "tasks.assigned.t1");
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = store().await;
        store.submit(Task::new(tid("t1"), "contested")).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            let agent = aid(&format!("w{n}"));
            handles.push(tokio::spawn(async move {
                store.claim(&tid("t1"), &agent).await.map(|_| agent)
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Ok(agent) = handle.await.expect("join") {
                winners.push(agent);
            }
        }
        assert_eq!(winners.len(), 1, "exactly one claim must win");
        assert_eq!(
            store.get(&tid("t1")).await.unwrap().assigned_to,
            Some(winners[0].clone())
        );
    }
}
