//! Stale-agent recovery end to end.
//!
//! Registers a phantom agent holding a claimed task and two locks, lets its
//! heartbeat age out, and verifies the monitor's tick brings everything
//! back: card offline, task requeued, locks released — and nothing else
//! touched.

mod common;

use std::time::Duration;

use common::wait_until;
use drover::model::{AgentCard, AgentId, AgentStatus, Task, TaskId, TaskStatus};
use drover::{Node, NodeConfig};

fn tid(s: &str) -> TaskId {
    TaskId::new(s).unwrap()
}

fn aid(s: &str) -> AgentId {
    AgentId::new(s).unwrap()
}

#[tokio::test]
async fn phantom_agent_is_recovered_by_tick() {
    let mut config = NodeConfig::new(aid("host"));
    config.timing.monitor_tick_interval_ms = 50;
    config.timing.max_agent_age_ms = 200;
    config.timing.heartbeat_interval_ms = 60_000;
    let node = Node::start(config).await.unwrap();

    // A phantom worker claims a task and takes two locks, then vanishes
    // (it never heartbeats again).
    let phantom = aid("phantom");
    node.registry()
        .register(AgentCard::new(phantom.clone(), "phantom", vec![]))
        .await
        .unwrap();
    node.tasks().submit(Task::new(tid("tP"), "doomed")).await.unwrap();
    node.tasks().claim(&tid("tP"), &phantom).await.unwrap();
    node.locks().acquire("repo", "src/a.rs", &phantom, &tid("tP")).await.unwrap();
    node.locks().acquire("repo", "src/b.rs", &phantom, &tid("tP")).await.unwrap();

    // An unrelated healthy state snapshot that must survive untouched.
    let bystander = aid("bystander");
    node.registry()
        .register(AgentCard::new(bystander.clone(), "bystander", vec![]))
        .await
        .unwrap();
    node.locks().acquire("repo", "src/c.rs", &bystander, &tid("tP")).await.unwrap();
    node.tasks().submit(Task::new(tid("tOther"), "untouched")).await.unwrap();

    node.spawn_monitor(node.orchestrator(), None, None);

    // Keep the bystander alive while the phantom ages out.
    let keepalive = {
        let registry = node.registry().clone();
        let bystander = bystander.clone();
        let cancel = node.cancellation_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_millis(50)) => {
                        let _ = registry.heartbeat(&bystander).await;
                    }
                }
            }
        })
    };

    let recovered = wait_until(Duration::from_secs(10), || async {
        let card = node.registry().get(&phantom).await.unwrap();
        let task = node.tasks().get(&tid("tP")).await.unwrap();
        card.status == AgentStatus::Offline && task.status == TaskStatus::Submitted
    })
    .await;
    assert!(recovered, "phantom agent was never recovered");

    // Task requeued and unassigned.
    let task = node.tasks().get(&tid("tP")).await.unwrap();
    assert_eq!(task.status, TaskStatus::Submitted);
    assert_eq!(task.assigned_to, None);

    // Both phantom locks released.
    assert!(node.locks().get("repo", "src/a.rs").await.unwrap().is_none());
    assert!(node.locks().get("repo", "src/b.rs").await.unwrap().is_none());

    // Card preserved (offline, with its task for diagnostics), not deleted.
    let card = node.registry().get(&phantom).await.unwrap();
    assert_eq!(card.status, AgentStatus::Offline);

    // Nothing else mutated: bystander alive, its lock held, other task
    // untouched.
    let bycard = node.registry().get(&bystander).await.unwrap();
    assert_ne!(bycard.status, AgentStatus::Offline);
    assert!(node.locks().get("repo", "src/c.rs").await.unwrap().is_some());
    assert_eq!(
        node.tasks().get(&tid("tOther")).await.unwrap().status,
        TaskStatus::Submitted
    );

    node.stop().await;
    keepalive.await.unwrap();
}

#[tokio::test]
async fn offline_agent_revives_on_reregistration() {
    let mut config = NodeConfig::new(aid("host"));
    config.timing.monitor_tick_interval_ms = 50;
    config.timing.max_agent_age_ms = 150;
    config.timing.heartbeat_interval_ms = 60_000;
    let node = Node::start(config).await.unwrap();

    let ghost = aid("ghost");
    node.registry()
        .register(AgentCard::new(ghost.clone(), "ghost", vec![]))
        .await
        .unwrap();
    node.spawn_monitor(node.orchestrator(), None, None);

    let offline = wait_until(Duration::from_secs(10), || async {
        node.registry()
            .get(&ghost)
            .await
            .is_ok_and(|c| c.status == AgentStatus::Offline)
    })
    .await;
    assert!(offline, "ghost never went offline");

    // Re-registration brings it back idle.
    node.registry()
        .register(AgentCard::new(ghost.clone(), "ghost", vec![]))
        .await
        .unwrap();
    let card = node.registry().get(&ghost).await.unwrap();
    assert_eq!(card.status, AgentStatus::Idle);

    node.stop().await;
}
