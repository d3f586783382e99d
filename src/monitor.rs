//! Monitor: completion-event handling and stale-agent recovery.
//!
//! One cooperative component, two concerns multiplexed in a single loop:
//!
//! - completion events on `tasks.completed.*` drive merges (when a merge
//!   worktree is configured) and dependency resolution;
//! - a periodic tick marks stale agents offline, requeues their in-flight
//!   tasks, and releases their locks.
//!
//! The tick is the universal safety net: anything a missed event or a died
//! worker left behind is recovered at most one staleness period late.

use std::sync::Arc;
use std::time::Duration;

use drover_git::{ConflictResolver, MergeWorktree};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::BusHandle;
use crate::locks::LockManager;
use crate::model::{Task, TaskStatus};
use crate::orchestrator::Orchestrator;
use crate::registry::AgentRegistry;
use crate::tasks::{TaskStore, TaskStoreError};

/// Default pause between stale-recovery ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Default heartbeat age past which an agent is considered gone.
pub const DEFAULT_MAX_AGENT_AGE: Duration = Duration::from_secs(30);

/// Reacts to task completions and agent death.
pub struct Monitor {
    bus: BusHandle,
    tasks: TaskStore,
    registry: AgentRegistry,
    locks: LockManager,
    orchestrator: Arc<Orchestrator>,
    worktree: Option<MergeWorktree>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    tick_interval: Duration,
    max_agent_age: Duration,
}

impl Monitor {
    /// Build a monitor without merge support: completions only drive
    /// dependency resolution.
    #[must_use]
    pub fn new(
        bus: BusHandle,
        tasks: TaskStore,
        registry: AgentRegistry,
        locks: LockManager,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            bus,
            tasks,
            registry,
            locks,
            orchestrator,
            worktree: None,
            resolver: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_agent_age: DEFAULT_MAX_AGENT_AGE,
        }
    }

    /// Attach a merge worktree (and optionally a conflict resolver):
    /// completed tasks with a branch are merged before dependents release.
    #[must_use]
    pub fn with_merge_worktree(
        mut self,
        worktree: MergeWorktree,
        resolver: Option<Arc<dyn ConflictResolver>>,
    ) -> Self {
        self.worktree = Some(worktree);
        self.resolver = resolver;
        self
    }

    /// Override the recovery tick interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Override the heartbeat age after which agents count as gone.
    #[must_use]
    pub const fn with_max_agent_age(mut self, max_age: Duration) -> Self {
        self.max_agent_age = max_age;
        self
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(component = "monitor", "monitor started");
        let (mut events, mut events_open) = match self.bus.subscribe("tasks.completed.*").await {
            Ok(events) => (events, true),
            Err(e) => {
                warn!(
                    component = "monitor",
                    error_kind = "transport",
                    error = %e,
                    "cannot subscribe to completion events, running on ticks only"
                );
                let (_, rx) = tokio::sync::mpsc::unbounded_channel();
                (rx, false)
            }
        };
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Handling is raced against cancellation so a long merge is cut
            // short at shutdown (dropping the future kills its git child).
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = self.on_completed(&event.payload) => {}
                        }
                    }
                    None => {
                        warn!(
                            component = "monitor",
                            error_kind = "transport",
                            "completion event stream closed, running on ticks only"
                        );
                        events_open = false;
                    }
                },
                _ = tick.tick() => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.recover_stale_agents() => {}
                    }
                }
            }
        }
        info!(component = "monitor", "monitor stopped");
    }

    /// Handle one `tasks.completed.*` event.
    async fn on_completed(&self, payload: &str) {
        let Ok(task) = serde_json::from_str::<Task>(payload) else {
            warn!(component = "monitor", "dropping undecodable completion event");
            return;
        };
        debug!(component = "monitor", task_id = %task.id, "completion event");

        let outcome = match &self.worktree {
            Some(worktree) => {
                self.orchestrator
                    .merge_and_resolve(&task.id, worktree, self.resolver.as_deref())
                    .await
            }
            None => self.orchestrator.resolve_dependencies().await,
        };
        if let Err(e) = outcome {
            warn!(
                component = "monitor",
                task_id = %task.id,
                error_kind = "store",
                error = %e,
                "completion handling failed"
            );
        }
    }

    /// One recovery pass: offline stale agents, requeue their tasks, free
    /// their locks. Failures are logged; the next tick tries again.
    async fn recover_stale_agents(&self) {
        let newly_offline = match self.registry.mark_stale_agents_offline(self.max_agent_age).await {
            Ok(cards) => cards,
            Err(e) => {
                warn!(
                    component = "monitor",
                    error_kind = "transport",
                    error = %e,
                    "stale sweep failed"
                );
                return;
            }
        };

        for card in newly_offline {
            info!(
                component = "monitor",
                agent_id = %card.id,
                "recovering work of stale agent"
            );
            self.requeue_tasks_of(&card.id).await;
            match self.locks.release_by_agent(&card.id).await {
                Ok(released) if released > 0 => {
                    info!(
                        component = "monitor",
                        agent_id = %card.id,
                        released,
                        "stale agent locks released"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        component = "monitor",
                        agent_id = %card.id,
                        error_kind = "transport",
                        error = %e,
                        "lock release failed"
                    );
                }
            }
        }
    }

    /// Requeue every assigned/working task held by `agent`.
    async fn requeue_tasks_of(&self, agent: &crate::model::AgentId) {
        for status in [TaskStatus::Assigned, TaskStatus::Working] {
            let tasks = match self.tasks.list_by_status(status).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(
                        component = "monitor",
                        agent_id = %agent,
                        error_kind = "transport",
                        error = %e,
                        "cannot list tasks for recovery"
                    );
                    continue;
                }
            };
            for task in tasks {
                if task.assigned_to.as_ref() != Some(agent) {
                    continue;
                }
                match self.tasks.requeue(&task.id).await {
                    Ok(_) => {
                        info!(
                            component = "monitor",
                            agent_id = %agent,
                            task_id = %task.id,
                            "abandoned task requeued"
                        );
                    }
                    // Someone beat us to it; that is the point of CAS.
                    Err(TaskStoreError::InvalidTransition { .. }) => {}
                    Err(e) => {
                        warn!(
                            component = "monitor",
                            agent_id = %agent,
                            task_id = %task.id,
                            error_kind = "store",
                            error = %e,
                            "requeue failed"
                        );
                    }
                }
            }
        }
    }
}
