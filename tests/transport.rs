//! Remote bus: nodes joining over TCP share the same replicated state.
//!
//! Coverage:
//! - a joining node reads and writes the host's buckets
//! - CAS conflicts keep their structure across the wire: concurrent claims
//!   from two nodes have exactly one winner
//! - events published on one node reach subscribers on another
//! - watches deliver KV updates across the wire

mod common;

use std::time::Duration;

use common::{handler, wait_for_status, SummaryHandler};
use drover::bus::EntryOp;
use drover::model::{AgentId, Task, TaskId, TaskStatus};
use drover::tasks::TaskStoreError;
use drover::{Node, NodeConfig};

fn tid(s: &str) -> TaskId {
    TaskId::new(s).unwrap()
}

fn aid(s: &str) -> AgentId {
    AgentId::new(s).unwrap()
}

async fn host() -> (std::sync::Arc<Node>, String) {
    let mut config = NodeConfig::new(aid("host"));
    config.listen_addr = Some("127.0.0.1:0".parse().unwrap());
    let node = Node::start(config).await.unwrap();
    let addr = node.bus_addr().expect("listener").to_string();
    (node, addr)
}

async fn join(id: &str, addr: &str) -> std::sync::Arc<Node> {
    let mut config = NodeConfig::new(aid(id));
    config.bus_url = Some(addr.to_owned());
    config.timing.worker_poll_interval_ms = 20;
    Node::start(config).await.unwrap()
}

#[tokio::test]
async fn joining_node_shares_task_state() {
    let (host, addr) = host().await;
    let peer = join("peer", &addr).await;

    host.tasks().submit(Task::new(tid("t1"), "shared")).await.unwrap();

    let seen = peer.tasks().get(&tid("t1")).await.unwrap();
    assert_eq!(seen.title, "shared");
    assert_eq!(seen.status, TaskStatus::Submitted);

    peer.tasks().claim(&tid("t1"), &aid("peer")).await.unwrap();
    let on_host = host.tasks().get(&tid("t1")).await.unwrap();
    assert_eq!(on_host.status, TaskStatus::Assigned);
    assert_eq!(on_host.assigned_to, Some(aid("peer")));

    peer.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn cross_node_claims_have_one_winner() {
    let (host, addr) = host().await;
    let peer = join("peer", &addr).await;

    host.tasks().submit(Task::new(tid("hot"), "contested")).await.unwrap();

    let host_store = host.tasks().clone();
    let peer_store = peer.tasks().clone();
    let host_claim = tokio::spawn(async move { host_store.claim(&tid("hot"), &aid("host")).await });
    let peer_claim = tokio::spawn(async move { peer_store.claim(&tid("hot"), &aid("peer")).await });

    let results = [host_claim.await.unwrap(), peer_claim.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one node's claim must win");
    let loser_err = results.into_iter().find(Result::is_err).unwrap().unwrap_err();
    assert!(matches!(loser_err, TaskStoreError::InvalidTransition { .. }));

    peer.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn events_cross_the_wire() {
    let (host, addr) = host().await;
    let peer = join("peer", &addr).await;

    let mut events = peer.bus().subscribe("tasks.submitted.*").await.unwrap();
    host.tasks().submit(Task::new(tid("t1"), "announced")).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timed out")
        .expect("subscription closed");
    assert_eq!(event.subject, "tasks.submitted.t1");
    let task: Task = serde_json::from_str(&event.payload).unwrap();
    assert_eq!(task.id, tid("t1"));

    peer.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn watches_cross_the_wire() {
    let (host, addr) = host().await;
    let peer = join("peer", &addr).await;

    let kv = peer.bus().bucket("tasks").await.unwrap();
    let mut watch = kv.watch("t").await.unwrap();

    host.tasks().submit(Task::new(tid("t9"), "watched")).await.unwrap();

    let entry = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("watch timed out")
        .expect("watch closed");
    assert_eq!(entry.key, "t9");
    assert_eq!(entry.op, EntryOp::Put);
    assert!(entry.revision > 0);

    peer.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn remote_worker_executes_host_submitted_task() {
    let (host, addr) = host().await;
    let peer = join("peer", &addr).await;
    peer.spawn_worker(handler(SummaryHandler));

    host.tasks().submit(Task::new(tid("t1"), "for the peer")).await.unwrap();

    let done =
        wait_for_status(host.tasks(), &tid("t1"), TaskStatus::Completed, Duration::from_secs(5))
            .await;
    assert_eq!(done.assigned_to, Some(aid("peer")));

    peer.stop().await;
    host.stop().await;
}
