//! End-to-end node and worker lifecycle.
//!
//! Coverage:
//! - single-worker happy path: submit → claim → execute → completed
//! - specialization mismatch leaves a task unclaimed
//! - double claim: second claimer rejected with the winner's state
//! - two workers share a queue without double execution

mod common;

use std::time::Duration;

use common::{handler, wait_for_status, wait_until, BranchingHandler, SummaryHandler};
use drover::model::{AgentId, AgentStatus, BranchName, Task, TaskId, TaskStatus};
use drover::tasks::TaskStoreError;
use drover::{Node, NodeConfig};

fn tid(s: &str) -> TaskId {
    TaskId::new(s).unwrap()
}

fn aid(s: &str) -> AgentId {
    AgentId::new(s).unwrap()
}

fn fast_config(id: &str, capabilities: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::new(aid(id));
    config.capabilities = capabilities.iter().map(|s| (*s).to_owned()).collect();
    config.timing.worker_poll_interval_ms = 20;
    config.timing.heartbeat_interval_ms = 100;
    config
}

#[tokio::test]
async fn single_worker_happy_path() {
    let node = Node::start(fast_config("w1", &["go"])).await.unwrap();
    node.spawn_worker(handler(BranchingHandler {
        worker: "w1".to_owned(),
    }));

    node.tasks().submit(Task::new(tid("t1"), "do it")).await.unwrap();

    let done = wait_for_status(node.tasks(), &tid("t1"), TaskStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.assigned_to, Some(aid("w1")));
    assert_eq!(
        done.result.unwrap().branch,
        Some(BranchName::new("agent/w1/t1").unwrap())
    );

    // The worker went back to idle after the task.
    let idle = wait_until(Duration::from_secs(2), || async {
        node.registry()
            .get(&aid("w1"))
            .await
            .is_ok_and(|c| c.status == AgentStatus::Idle && c.current_task.is_none())
    })
    .await;
    assert!(idle, "worker never returned to idle");

    node.stop().await;
}

#[tokio::test]
async fn specialization_mismatch_stays_submitted() {
    let node = Node::start(fast_config("w1", &["backend", "go"])).await.unwrap();
    node.spawn_worker(handler(SummaryHandler));

    let mut task = Task::new(tid("t2"), "frontend work");
    task.specialization = vec!["frontend".to_owned(), "react".to_owned()];
    node.tasks().submit(task).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let still = node.tasks().get(&tid("t2")).await.unwrap();
    assert_eq!(still.status, TaskStatus::Submitted);
    assert_eq!(still.assigned_to, None);

    node.stop().await;
}

#[tokio::test]
async fn double_claim_is_rejected_with_winner_state() {
    let node = Node::start(fast_config("host", &[])).await.unwrap();
    node.tasks().submit(Task::new(tid("t3"), "contested")).await.unwrap();

    node.tasks().claim(&tid("t3"), &aid("A")).await.unwrap();
    let err = node.tasks().claim(&tid("t3"), &aid("B")).await.unwrap_err();
    match err {
        TaskStoreError::InvalidTransition { from, .. } => assert_eq!(from, TaskStatus::Assigned),
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
    assert_eq!(
        node.tasks().get(&tid("t3")).await.unwrap().assigned_to,
        Some(aid("A"))
    );

    node.stop().await;
}

#[tokio::test]
async fn two_workers_split_the_queue() {
    // One bus-hosting node, one in-process co-worker sharing its stores.
    let node = Node::start(fast_config("w1", &[])).await.unwrap();
    node.spawn_worker(handler(SummaryHandler));

    let registry = node.registry().clone();
    registry
        .register(drover::model::AgentCard::new(aid("w2"), "w2", vec![]))
        .await
        .unwrap();
    let second = drover::Worker::new(
        aid("w2"),
        vec![],
        node.tasks().clone(),
        registry,
        handler(SummaryHandler),
    )
    .with_poll_interval(Duration::from_millis(20));
    let cancel = node.cancellation_token();
    let second_handle = tokio::spawn(second.run(cancel));

    for n in 0..6 {
        node.tasks()
            .submit(Task::new(tid(&format!("q{n}")), "queued"))
            .await
            .unwrap();
    }

    for n in 0..6 {
        let task = wait_for_status(
            node.tasks(),
            &tid(&format!("q{n}")),
            TaskStatus::Completed,
            Duration::from_secs(5),
        )
        .await;
        // Every completed task was claimed by exactly one of the two.
        let owner = task.assigned_to.expect("completed tasks keep assignment");
        assert!(owner == aid("w1") || owner == aid("w2"), "unexpected owner {owner}");
    }

    node.stop().await;
    second_handle.await.unwrap();
}
