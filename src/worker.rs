//! Worker loop.
//!
//! A worker polls the task store on a fixed interval, claims the first
//! submitted task whose specialization it can serve, and runs the injected
//! [`TaskHandler`]. One task at a time; claim races lost to other workers
//! are expected traffic and only logged at debug level.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{AgentId, AgentStatus, Task, TaskResult};
use crate::registry::AgentRegistry;
use crate::tasks::{TaskStore, TaskStoreError};

/// Default pause between polls of the submitted queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// TaskHandler
// ---------------------------------------------------------------------------

/// Executes one task and reports what it produced.
///
/// Supplied by the embedding application; the cluster core never interprets
/// the work itself. Handlers must watch `cancel` — a handler that ignores it
/// merely leaves its task stuck until the stale-agent sweep requeues it.
///
/// A result carrying a branch or a non-empty summary counts as success;
/// anything else (including an `Err`) fails the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task to completion or cancellation.
    async fn run(&self, cancel: CancellationToken, task: Task) -> anyhow::Result<TaskResult>;
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A polling task executor bound to one agent identity.
pub struct Worker {
    agent_id: AgentId,
    capabilities: Vec<String>,
    tasks: TaskStore,
    registry: AgentRegistry,
    handler: Arc<dyn TaskHandler>,
    poll_interval: Duration,
}

impl Worker {
    /// Build a worker. `capabilities` is matched against task
    /// specializations; an empty specialization matches any worker.
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        capabilities: Vec<String>,
        tasks: TaskStore,
        registry: AgentRegistry,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            agent_id,
            capabilities,
            tasks,
            registry,
            handler,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll until `cancel` fires. At most one task runs at a time.
    pub async fn run(self, cancel: CancellationToken) {
        info!(component = "worker", agent_id = %self.agent_id, "worker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
            if let Some(task) = self.claim_next().await {
                self.execute(task, &cancel).await;
            }
        }
        info!(component = "worker", agent_id = %self.agent_id, "worker stopped");
    }

    /// Scan submitted tasks by descending priority and claim the first
    /// match. Claim conflicts mean another worker won; keep scanning.
    async fn claim_next(&self) -> Option<Task> {
        let mut submitted = match self.tasks.list_by_status(crate::model::TaskStatus::Submitted).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(
                    component = "worker",
                    agent_id = %self.agent_id,
                    error_kind = "transport",
                    error = %e,
                    "failed to list submitted tasks"
                );
                return None;
            }
        };
        submitted.sort_by_key(|t| std::cmp::Reverse(t.priority));

        for task in submitted {
            if !task.matches_capabilities(&self.capabilities) {
                continue;
            }
            match self.tasks.claim(&task.id, &self.agent_id).await {
                Ok(claimed) => return Some(claimed),
                Err(TaskStoreError::InvalidTransition { .. } | TaskStoreError::NotFound { .. }) => {
                    debug!(
                        component = "worker",
                        agent_id = %self.agent_id,
                        task_id = %task.id,
                        "claim lost, continuing scan"
                    );
                }
                Err(e) => {
                    warn!(
                        component = "worker",
                        agent_id = %self.agent_id,
                        task_id = %task.id,
                        error_kind = "transport",
                        error = %e,
                        "claim failed"
                    );
                    return None;
                }
            }
        }
        None
    }

    async fn execute(&self, task: Task, cancel: &CancellationToken) {
        let task_id = task.id.clone();
        if let Err(e) = self.tasks.set_working(&task_id).await {
            warn!(
                component = "worker",
                agent_id = %self.agent_id,
                task_id = %task_id,
                error_kind = "precondition",
                error = %e,
                "could not mark task working"
            );
            return;
        }
        self.set_status(AgentStatus::Working, Some(task_id.clone())).await;

        // Raced against cancellation: a handler that ignores its token is
        // dropped at shutdown, and its task is left for the stale sweep.
        let result = tokio::select! {
            () = cancel.cancelled() => {
                info!(
                    component = "worker",
                    agent_id = %self.agent_id,
                    task_id = %task_id,
                    "cancelled mid-task, leaving it for recovery"
                );
                self.set_status(AgentStatus::Idle, None).await;
                return;
            }
            result = self.handler.run(cancel.child_token(), task) => result,
        };

        let report = match result {
            Ok(result) if result.indicates_success() => self.tasks.complete(&task_id, result).await,
            Ok(result) => {
                info!(
                    component = "worker",
                    agent_id = %self.agent_id,
                    task_id = %task_id,
                    error_kind = "handler",
                    "handler returned neither branch nor summary"
                );
                self.tasks.fail(&task_id, result).await
            }
            Err(e) => {
                warn!(
                    component = "worker",
                    agent_id = %self.agent_id,
                    task_id = %task_id,
                    error_kind = "handler",
                    error = %e,
                    "handler failed"
                );
                self.tasks.fail(&task_id, TaskResult::default()).await
            }
        };
        if let Err(e) = report {
            // The stale sweep will rescue the task if this was more than a race.
            warn!(
                component = "worker",
                agent_id = %self.agent_id,
                task_id = %task_id,
                error_kind = "precondition",
                error = %e,
                "could not report task outcome"
            );
        }

        self.set_status(AgentStatus::Idle, None).await;
    }

    async fn set_status(&self, status: AgentStatus, task: Option<crate::model::TaskId>) {
        if let Err(e) = self.registry.update_status(&self.agent_id, status, task).await {
            warn!(
                component = "worker",
                agent_id = %self.agent_id,
                error_kind = "transport",
                error = %e,
                "registry status update failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusHandle, AGENTS_BUCKET, TASKS_BUCKET};
    use crate::model::{AgentCard, BranchName, TaskId, TaskStatus};

    struct BranchHandler;

    #[async_trait]
    impl TaskHandler for BranchHandler {
        async fn run(&self, _cancel: CancellationToken, task: Task) -> anyhow::Result<TaskResult> {
            Ok(TaskResult {
                branch: Some(BranchName::new(&format!("agent/w1/{}", task.id)).unwrap()),
                summary: "done".to_owned(),
                ..TaskResult::default()
            })
        }
    }

    struct EmptyHandler;

    #[async_trait]
    impl TaskHandler for EmptyHandler {
        async fn run(&self, _cancel: CancellationToken, _task: Task) -> anyhow::Result<TaskResult> {
            Ok(TaskResult::default())
        }
    }

    async fn fixture(handler: Arc<dyn TaskHandler>, capabilities: &[&str]) -> (TaskStore, AgentRegistry, Worker) {
        let bus = BusHandle::Local(Bus::open(None).expect("bus"));
        let tasks = TaskStore::new(
            bus.bucket(TASKS_BUCKET).await.expect("bucket"),
            bus.clone(),
        );
        let registry = AgentRegistry::new(bus.bucket(AGENTS_BUCKET).await.expect("bucket"));
        let agent_id = AgentId::new("w1").unwrap();
        registry
            .register(AgentCard::new(
                agent_id.clone(),
                "w1",
                capabilities.iter().map(|s| (*s).to_owned()).collect(),
            ))
            .await
            .unwrap();
        let worker = Worker::new(
            agent_id,
            capabilities.iter().map(|s| (*s).to_owned()).collect(),
            tasks.clone(),
            registry.clone(),
            handler,
        )
        .with_poll_interval(Duration::from_millis(20));
        (tasks, registry, worker)
    }

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    async fn wait_for_status(tasks: &TaskStore, id: &TaskId, status: TaskStatus) -> Task {
        for _ in 0..250 {
            let task = tasks.get(id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn worker_claims_executes_and_completes() {
        let (tasks, registry, worker) = fixture(Arc::new(BranchHandler), &["go"]).await;
        tasks.submit(Task::new(tid("t1"), "one")).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let done = wait_for_status(&tasks, &tid("t1"), TaskStatus::Completed).await;
        assert_eq!(done.assigned_to, Some(AgentId::new("w1").unwrap()));
        assert_eq!(
            done.result.unwrap().branch,
            Some(BranchName::new("agent/w1/t1").unwrap())
        );
        let card = registry.get(&AgentId::new("w1").unwrap()).await.unwrap();
        assert_eq!(card.status, AgentStatus::Idle);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn specialization_mismatch_is_skipped() {
        let (tasks, _registry, worker) = fixture(Arc::new(BranchHandler), &["backend", "go"]).await;
        let mut task = Task::new(tid("t2"), "frontend work");
        task.specialization = vec!["frontend".to_owned(), "react".to_owned()];
        tasks.submit(task).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let still = tasks.get(&tid("t2")).await.unwrap();
        assert_eq!(still.status, TaskStatus::Submitted);
        assert_eq!(still.assigned_to, None);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn empty_result_fails_the_task() {
        let (tasks, _registry, worker) = fixture(Arc::new(EmptyHandler), &[]).await;
        tasks.submit(Task::new(tid("t3"), "noop")).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        wait_for_status(&tasks, &tid("t3"), TaskStatus::Failed).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    struct RecordingHandler(std::sync::Mutex<Vec<TaskId>>);

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn run(&self, _cancel: CancellationToken, task: Task) -> anyhow::Result<TaskResult> {
            self.0.lock().unwrap().push(task.id);
            Ok(TaskResult {
                summary: "done".to_owned(),
                ..TaskResult::default()
            })
        }
    }

    #[tokio::test]
    async fn higher_priority_claimed_first() {
        let recorder = Arc::new(RecordingHandler(std::sync::Mutex::new(Vec::new())));
        let (tasks, _registry, worker) = fixture(recorder.clone(), &[]).await;
        let mut low = Task::new(tid("low"), "low");
        low.priority = 1;
        let mut high = Task::new(tid("high"), "high");
        high.priority = 10;
        tasks.submit(low).await.unwrap();
        tasks.submit(high).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        wait_for_status(&tasks, &tid("low"), TaskStatus::Completed).await;
        wait_for_status(&tasks, &tid("high"), TaskStatus::Completed).await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![tid("high"), tid("low")]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
