use super::*;
use crate::services::connections::BoardLink;
use crate::state::test_helpers::{seed_board, test_hub_state};
use frames::Status;
use frames::protocol::{WORKSPACE_CARD_UPDATE, codes};
use std::time::Duration;
use tokio::time::timeout;

fn connection() -> (Connection, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Connection { id: Uuid::new_v4(), tx, workspace_id: None }, rx)
}

fn register_frame(workspace_id: &str) -> Frame {
    WorkspaceRequest::Register(Registration {
        workspace_id: workspace_id.to_owned(),
        name: "demo".to_owned(),
        root_path: "/tmp/demo".to_owned(),
    })
    .to_frame()
}

fn query_frame(board_id: &str, operation: &str, args: Vec<serde_json::Value>) -> Frame {
    WorkspaceRequest::Query(RelayQuery { board_id: board_id.to_owned(), operation: operation.to_owned(), args })
        .to_frame()
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed unexpectedly")
}

#[tokio::test]
async fn registration_replies_with_snapshot() {
    let state = test_hub_state();
    seed_board(&state, "B1", &["a", "b"]).await;
    let (mut conn, _rx) = connection();

    let req = register_frame("ws-1");
    let reply = dispatch(&state, &mut conn, req.clone()).await.expect("reply");
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.parent_id.as_deref(), Some(req.id.as_str()));

    let ack: RegistrationAck = serde_json::from_value(reply.data).expect("ack");
    assert!(ack.success);
    assert_eq!(ack.assigned_boards, vec!["B1".to_owned()]);
    assert_eq!(ack.cards_by_board["B1"].cards.len(), 2);
    assert_eq!(conn.workspace_id.as_deref(), Some("ws-1"));
    assert_eq!(state.workspaces.workspaces().await.len(), 1);
}

#[tokio::test]
async fn registered_connection_receives_later_changes() {
    let state = test_hub_state();
    seed_board(&state, "B1", &[]).await;
    let (mut conn, mut rx) = connection();
    dispatch(&state, &mut conn, register_frame("ws-1")).await.expect("reply");

    state
        .store
        .write()
        .await
        .set_card("B1", crate::state::test_helpers::card("B1", "a"))
        .expect("set");
    assert_eq!(recv(&mut rx).await.syscall, WORKSPACE_CARD_UPDATE);
}

#[tokio::test]
async fn second_registration_on_one_connection_fails() {
    let state = test_hub_state();
    let (mut conn, _rx) = connection();
    dispatch(&state, &mut conn, register_frame("ws-1")).await.expect("reply");
    let reply = dispatch(&state, &mut conn, register_frame("ws-2")).await.expect("reply");
    assert_eq!(reply.error_code(), Some(codes::REGISTRATION));
}

#[tokio::test]
async fn empty_workspace_id_fails_registration() {
    let state = test_hub_state();
    let (mut conn, _rx) = connection();
    let reply = dispatch(&state, &mut conn, register_frame("")).await.expect("reply");
    assert_eq!(reply.status, Status::Error);
    assert_eq!(reply.error_code(), Some(codes::REGISTRATION));
    assert!(conn.workspace_id.is_none());
}

#[tokio::test]
async fn requests_before_registration_are_refused() {
    let state = test_hub_state();
    let (mut conn, _rx) = connection();
    for req in [WorkspaceRequest::Ping.to_frame(), query_frame("B1", "cards", vec![])] {
        let reply = dispatch(&state, &mut conn, req).await.expect("reply");
        assert_eq!(reply.error_code(), Some(codes::NOT_REGISTERED));
    }
}

#[tokio::test]
async fn ping_replies_with_timestamp() {
    let state = test_hub_state();
    let (mut conn, _rx) = connection();
    dispatch(&state, &mut conn, register_frame("ws-1")).await.expect("reply");
    let reply = dispatch(&state, &mut conn, WorkspaceRequest::Ping.to_frame()).await.expect("reply");
    assert_eq!(reply.status, Status::Done);
    assert!(reply.data.get("timestamp").is_some());
}

#[tokio::test]
async fn query_to_unconnected_board_fails_fast() {
    let state = test_hub_state();
    let (mut conn, mut rx) = connection();
    dispatch(&state, &mut conn, register_frame("ws-1")).await.expect("reply");

    let req = query_frame("B1", "selectCard", vec![json!("link-42")]);
    assert!(dispatch(&state, &mut conn, req.clone()).await.is_none());
    let reply = recv(&mut rx).await;
    assert_eq!(reply.parent_id.as_deref(), Some(req.id.as_str()));
    assert_eq!(reply.error_code(), Some(codes::BOARD_NOT_CONNECTED));
    assert_eq!(reply.data.get("retryable"), Some(&json!(true)));
}

#[tokio::test]
async fn invalid_arguments_fail_before_relaying() {
    let state = test_hub_state();
    let (link_tx, mut link_rx) = mpsc::unbounded_channel();
    state.boards.connect_board("B1", BoardLink::new(link_tx)).await;
    let (mut conn, _rx) = connection();
    dispatch(&state, &mut conn, register_frame("ws-1")).await.expect("reply");

    let reply = dispatch(&state, &mut conn, query_frame("B1", "selectCard", vec![json!(7)]))
        .await
        .expect("immediate error");
    assert_eq!(reply.error_code(), Some(codes::INVALID_ARGS));
    assert!(link_rx.try_recv().is_err(), "nothing may reach the board");
}

#[tokio::test]
async fn query_result_is_relayed_back() {
    let state = test_hub_state();
    let (link_tx, mut link_rx) = mpsc::unbounded_channel();
    let link = BoardLink::new(link_tx);
    state.boards.connect_board("B1", link.clone()).await;
    let (mut conn, mut rx) = connection();
    dispatch(&state, &mut conn, register_frame("ws-1")).await.expect("reply");

    let req = query_frame("B1", "selectCard", vec![json!("link-42")]);
    assert!(dispatch(&state, &mut conn, req.clone()).await.is_none());

    let board_request = recv(&mut link_rx).await;
    assert_eq!(board_request.data, json!({"operation": "selectCard", "args": ["link-42"]}));
    assert!(link.resolve(&board_request.done_with(json!({"result": true}))));

    let reply = recv(&mut rx).await;
    assert_eq!(reply.parent_id.as_deref(), Some(req.id.as_str()));
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data, json!({"result": true}));
}

#[tokio::test]
async fn unknown_syscall_is_a_protocol_error() {
    let state = test_hub_state();
    let (mut conn, _rx) = connection();
    let reply = dispatch(&state, &mut conn, Frame::request("workspace:teleport", json!({}))).await.expect("reply");
    assert_eq!(reply.error_code(), Some(codes::PROTOCOL));
}
