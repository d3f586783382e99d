//! Node bootstrap and lifecycle.
//!
//! A [`Node`] owns the bus connection (embedded or remote), the four
//! buckets, and the store handles built on them. Components — workers,
//! monitors — borrow the stores and run as spawned loops tied to the node's
//! cancellation token; [`Node::stop`] cancels everything and waits.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use drover_git::{ConflictResolver, MergeWorktree};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::server::BusServer;
use crate::bus::{
    Bus, BusHandle, RemoteBus, AGENTS_BUCKET, CLUSTER_BUCKET, LOCKS_BUCKET, TASKS_BUCKET,
};
use crate::config::NodeConfig;
use crate::locks::LockManager;
use crate::model::{now_millis, AgentCard, AgentStatus};
use crate::monitor::Monitor;
use crate::orchestrator::Orchestrator;
use crate::registry::AgentRegistry;
use crate::tasks::TaskStore;
use crate::worker::{TaskHandler, Worker};

/// What a node writes into the `cluster` bucket at boot.
#[derive(Debug, Serialize)]
struct ClusterRecord<'a> {
    name: &'a str,
    listen_addr: Option<String>,
    started_at: u64,
}

/// A running cluster node.
pub struct Node {
    config: NodeConfig,
    bus: BusHandle,
    registry: AgentRegistry,
    tasks: TaskStore,
    locks: LockManager,
    cancel: CancellationToken,
    server: Mutex<Option<BusServer>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Boot a node: connect or host the bus, open the buckets, register
    /// this node's agent card, and start its heartbeat loop.
    ///
    /// # Errors
    /// Bus connection/hosting failure, bucket failure, or registration
    /// failure.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        let cancel = CancellationToken::new();

        let mut server = None;
        let bus = if let Some(url) = &config.bus_url {
            info!(component = "node", agent_id = %config.agent_id, url = %url, "joining existing bus");
            BusHandle::Remote(
                RemoteBus::connect(url, cancel.child_token())
                    .await
                    .with_context(|| format!("connecting to bus at {url}"))?,
            )
        } else {
            let embedded = Bus::open(config.store_dir.clone()).context("opening embedded bus")?;
            if let Some(addr) = config.listen_addr {
                let bound = BusServer::bind(addr, embedded.clone(), cancel.child_token())
                    .await
                    .with_context(|| format!("binding bus listener on {addr}"))?;
                info!(
                    component = "node",
                    agent_id = %config.agent_id,
                    addr = %bound.local_addr(),
                    "embedded bus listening"
                );
                server = Some(bound);
            }
            BusHandle::Local(embedded)
        };

        let registry = AgentRegistry::new(bus.bucket(AGENTS_BUCKET).await?);
        let tasks = TaskStore::new(bus.bucket(TASKS_BUCKET).await?, bus.clone());
        let locks = LockManager::new(bus.bucket(LOCKS_BUCKET).await?);
        let cluster = bus.bucket(CLUSTER_BUCKET).await?;

        registry
            .register(AgentCard::new(
                config.agent_id.clone(),
                config.display_name(),
                config.capabilities.clone(),
            ))
            .await
            .context("registering node agent card")?;

        let record = ClusterRecord {
            name: config.display_name(),
            listen_addr: config.listen_addr.map(|a| a.to_string()),
            started_at: now_millis(),
        };
        cluster
            .put(
                config.agent_id.as_str(),
                &serde_json::to_string(&record).unwrap_or_default(),
            )
            .await?;

        let node = Arc::new(Self {
            config,
            bus,
            registry,
            tasks,
            locks,
            cancel,
            server: Mutex::new(server),
            handles: Mutex::new(Vec::new()),
        });
        node.spawn_heartbeat();
        info!(component = "node", agent_id = %node.config.agent_id, "node started");
        Ok(node)
    }

    /// The node's configuration.
    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The bus this node is attached to.
    #[must_use]
    pub const fn bus(&self) -> &BusHandle {
        &self.bus
    }

    /// The agent registry.
    #[must_use]
    pub const fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// The task store.
    #[must_use]
    pub const fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// The lock manager.
    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// A child of the node's cancellation token, for caller-run components.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// The address the embedded bus is actually serving on, when this node
    /// hosts one with a listener (resolves port 0 binds).
    #[must_use]
    pub fn bus_addr(&self) -> Option<std::net::SocketAddr> {
        self.server
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(BusServer::local_addr)
    }

    /// Build an orchestrator stamping this node's identity on submitted
    /// tasks. Typically one per node.
    #[must_use]
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            self.config.agent_id.clone(),
            self.tasks.clone(),
        ))
    }

    /// Spawn a worker with this node's identity and capabilities, executing
    /// tasks through `handler`.
    pub fn spawn_worker(&self, handler: Arc<dyn TaskHandler>) {
        let worker = Worker::new(
            self.config.agent_id.clone(),
            self.config.capabilities.clone(),
            self.tasks.clone(),
            self.registry.clone(),
            handler,
        )
        .with_poll_interval(self.config.timing.worker_poll_interval());
        self.spawn(worker.run(self.cancel.child_token()));
    }

    /// Spawn a monitor using `orchestrator`, optionally with a merge
    /// worktree and resolver.
    pub fn spawn_monitor(
        &self,
        orchestrator: Arc<Orchestrator>,
        worktree: Option<MergeWorktree>,
        resolver: Option<Arc<dyn ConflictResolver>>,
    ) {
        let mut monitor = Monitor::new(
            self.bus.clone(),
            self.tasks.clone(),
            self.registry.clone(),
            self.locks.clone(),
            orchestrator,
        )
        .with_tick_interval(self.config.timing.monitor_tick_interval())
        .with_max_agent_age(self.config.timing.max_agent_age());
        if let Some(worktree) = worktree {
            monitor = monitor.with_merge_worktree(worktree, resolver);
        }
        self.spawn(monitor.run(self.cancel.child_token()));
    }

    /// Shut the node down: mark its card offline (best effort), cancel
    /// every spawned loop, and wait for them and the bus listener to exit.
    pub async fn stop(&self) {
        info!(component = "node", agent_id = %self.config.agent_id, "node stopping");

        // Before cancellation — a remote bus stops taking requests after.
        if let Err(e) = self
            .registry
            .update_status(&self.config.agent_id, AgentStatus::Offline, None)
            .await
        {
            warn!(
                component = "node",
                agent_id = %self.config.agent_id,
                error_kind = "transport",
                error = %e,
                "could not mark node offline"
            );
        }

        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_handles());
        for handle in handles {
            let _ = handle.await;
        }
        let server = self.server.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(server) = server {
            server.join().await;
        }
        info!(component = "node", agent_id = %self.config.agent_id, "node stopped");
    }

    fn spawn_heartbeat(&self) {
        let registry = self.registry.clone();
        let agent_id = self.config.agent_id.clone();
        let interval = self.config.timing.heartbeat_interval();
        let cancel = self.cancel.child_token();
        self.spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = registry.heartbeat(&agent_id).await {
                            warn!(
                                component = "node",
                                agent_id = %agent_id,
                                error_kind = "transport",
                                error = %e,
                                "heartbeat failed"
                            );
                        }
                    }
                }
            }
        });
    }

    fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.lock_handles().push(tokio::spawn(fut));
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
