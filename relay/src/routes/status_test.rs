use super::*;
use crate::state::test_helpers::{card, seed_board, test_hub_state};
use frames::Status;
use frames::protocol::WORKSPACE_CARD_UPDATE;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn health_reports_ok_hub() {
    let Json(body) = health().await;
    assert_eq!(body.status, "ok");
    assert_eq!(body.role, "hub");
    assert!(body.timestamp > 0);
}

#[tokio::test]
async fn storage_report_counts_cards_and_workspaces() {
    let state = test_hub_state();
    seed_board(&state, "B1", &["a", "b"]).await;
    seed_board(&state, "B2", &["c"]).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    state
        .workspaces
        .register(&state.store, Uuid::new_v4(), Some(WorkspaceRecord::new("ws-1", "demo", "/demo")), tx)
        .await
        .expect("register");

    let Json(report) = storage(State(state)).await;
    assert_eq!(report.total_cards, 3);
    assert_eq!(report.boards.len(), 2);
    assert_eq!(report.workspaces.len(), 1);

    let value = serde_json::to_value(&report).expect("serialize");
    assert!(value.get("connectedBoards").is_some());
    assert!(value.get("totalCards").is_some());
}

#[tokio::test]
async fn snapshot_request_starts_the_stream_once() {
    let state = test_hub_state();
    seed_board(&state, "B1", &["a"]).await;
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut streaming = false;

    let req = Frame::request(STATUS_SNAPSHOT, json!({}));
    let reply = handle_status_request(&state, conn_id, &tx, &mut streaming, &req).await;
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["totalCards"], json!(1));
    assert!(streaming);

    let again = handle_status_request(&state, conn_id, &tx, &mut streaming, &req).await;
    assert_eq!(again.status, Status::Done);
    assert_eq!(state.store.read().await.subscriber_count(), 1);

    state.store.write().await.set_card("B1", card("B1", "b")).expect("set");
    let event = timeout(Duration::from_millis(500), rx.recv()).await.expect("event").expect("open");
    assert_eq!(event.syscall, WORKSPACE_CARD_UPDATE);
    assert!(state.workspaces.workspaces().await.is_empty(), "status sockets are not workspaces");
}

#[tokio::test]
async fn other_requests_are_read_only_errors() {
    let state = test_hub_state();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut streaming = false;
    let req = Frame::request("workspace:query", json!({"boardId": "B1", "operation": "cards"}));
    let reply = handle_status_request(&state, Uuid::new_v4(), &tx, &mut streaming, &req).await;
    assert_eq!(reply.error_code(), Some(codes::READ_ONLY));
    assert!(!streaming);
}
