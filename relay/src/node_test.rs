use super::*;
use crate::client::{ClientError, ClientState};
use crate::discovery::HttpHealthProbe;
use crate::test_support::{FakeBoard, card, eventually, free_port, test_config};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;

fn start(port: u16, workspace: &str) -> NodeHandle {
    let config = test_config(port, workspace);
    let probe = Arc::new(HttpHealthProbe::new(config.probe_timeout));
    spawn_node(config, probe)
}

async fn wait_role(node: &NodeHandle, want: NodeRole) {
    let mut role = node.watch_role();
    tokio::time::timeout(Duration::from_secs(5), role.wait_for(|r| *r == want))
        .await
        .expect("role change timed out")
        .expect("node alive");
}

async fn wait_registered(node: &NodeHandle) {
    let client = node.client().clone();
    eventually("client registered", || {
        let client = client.clone();
        async move { client.state() == ClientState::Registered }
    })
    .await;
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[tokio::test]
async fn lone_node_becomes_hub_and_registers_with_itself() {
    let port = free_port().await;
    let node = start(port, "lone");
    wait_role(&node, NodeRole::Hub).await;
    wait_registered(&node).await;
    node.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn board_snapshot_and_relayed_queries_across_nodes() {
    let port = free_port().await;
    let hub = start(port, "hub");
    wait_role(&hub, NodeRole::Hub).await;

    let mut board = FakeBoard::connect(addr(port), "B1", "Demo", vec![card("B1", "a"), card("B1", "b")]).await;
    eventually("hub sees B1", || {
        let client = hub.client().clone();
        async move { client.replica().is_connected("B1") }
    })
    .await;

    // Registering after the board: the snapshot carries its two cards.
    let node = start(port, "late");
    wait_role(&node, NodeRole::Client).await;
    wait_registered(&node).await;
    let replica = node.client().replica();
    let b1 = replica.board("B1").expect("B1 in snapshot");
    assert_eq!(b1.name, "Demo");
    assert_eq!(b1.cards.len(), 2);

    let selected = node.client().query("B1", "selectCard", vec![json!("link-42")]).await.expect("relayed");
    assert_eq!(selected, json!(true));
    assert_eq!(board.next_query().await, frames::protocol::BoardOperation::SelectCard("link-42".into()));

    let err = node.client().query("B2", "selectCard", vec![json!("link-42")]).await.expect_err("not connected");
    assert!(matches!(err, ClientError::BoardNotConnected(_)));

    node.shutdown().await.expect("client node shutdown");
    hub.shutdown().await.expect("hub node shutdown");
}

#[tokio::test]
async fn racing_nodes_elect_a_single_hub() {
    let port = free_port().await;
    let nodes: Vec<NodeHandle> = (0..4).map(|i| start(port, &format!("race-{i}"))).collect();

    for node in &nodes {
        wait_registered(node).await;
    }
    let hubs = nodes.iter().filter(|n| n.role() == NodeRole::Hub).count();
    let clients = nodes.iter().filter(|n| n.role() == NodeRole::Client).count();
    assert_eq!(hubs, 1);
    assert_eq!(clients, 3);

    for node in nodes {
        node.shutdown().await.expect("shutdown");
    }
}

#[tokio::test]
async fn survivors_fail_over_when_the_hub_dies() {
    let port = free_port().await;
    let first = start(port, "first");
    wait_role(&first, NodeRole::Hub).await;
    wait_registered(&first).await;

    let second = start(port, "second");
    let third = start(port, "third");
    wait_role(&second, NodeRole::Client).await;
    wait_role(&third, NodeRole::Client).await;
    wait_registered(&second).await;
    wait_registered(&third).await;

    first.shutdown().await.expect("hub shutdown");

    let survivors = [&second, &third];
    eventually("a new hub is elected", || async move {
        survivors.iter().any(|n| n.role() == NodeRole::Hub)
    })
    .await;
    for node in survivors {
        wait_registered(node).await;
    }
    let hubs = survivors.iter().filter(|n| n.role() == NodeRole::Hub).count();
    let clients = survivors.iter().filter(|n| n.role() == NodeRole::Client).count();
    assert_eq!((hubs, clients), (1, 1));

    second.shutdown().await.expect("shutdown");
    third.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unbindable_address_is_fatal() {
    let mut config = test_config(free_port().await, "fatal");
    // TEST-NET-3 is never assigned to a local interface.
    config.host = "203.0.113.7".to_owned();
    let probe = Arc::new(HttpHealthProbe::new(Duration::from_millis(200)));
    let node = spawn_node(config, probe);

    let result = tokio::time::timeout(Duration::from_secs(5), node.join()).await.expect("node ends");
    assert!(matches!(result, Err(NodeError::Election(ElectionError::Bind { .. }))));
}
