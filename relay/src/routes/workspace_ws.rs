//! Workspace websocket — hub side of one workspace client connection.
//!
//! DESIGN
//! ======
//! The first accepted request must be `workspace:register`. Registration
//! replies with the full store snapshot and subscribes the connection to
//! every later change in the same step. After that the client may relay
//! `workspace:query` requests to boards and send `workspace:ping`.
//!
//! Queries run in spawned tasks so a slow board never stalls the socket;
//! their replies travel through the same outbound queue as broadcasts.
//! Failures go back to the caller as error frames tagged with the request
//! ID. The hub never retries.

use std::collections::HashMap;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use frames::protocol::{BoardOperation, Registration, RegistrationAck, RelayQuery, WorkspaceRequest};
use frames::{Frame, WireCodec, now_ms};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::workspace::{WorkspaceError, WorkspaceRecord};
use crate::state::HubState;
use crate::store::StoreSnapshot;

use super::{decode_message, send_frame};

/// Per-connection state the dispatcher reads and updates.
struct Connection {
    id: Uuid,
    tx: mpsc::UnboundedSender<Frame>,
    workspace_id: Option<String>,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_workspace_ws(
    State(state): State<HubState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let codec = WireCodec::from_param(params.get("codec").map(String::as_str));
    ws.on_upgrade(move |socket| run_workspace(socket, state, codec))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_workspace(mut socket: WebSocket, state: HubState, codec: WireCodec) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let mut conn = Connection { id: Uuid::new_v4(), tx, workspace_id: None };
    let mut shutdown = state.shutdown_signal();
    if *shutdown.borrow() {
        return;
    }
    info!(conn_id = %conn.id, codec = codec.as_param(), "workspace: connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Some(decoded) = decode_message(&msg) else { continue };
                let reply = match decoded {
                    Ok(frame) => dispatch(&state, &mut conn, frame).await,
                    Err(e) => {
                        warn!(conn_id = %conn.id, error = %e, "workspace: invalid inbound frame");
                        continue;
                    }
                };
                if let Some(reply) = reply {
                    if send_frame(&mut socket, codec, &reply).await.is_err() {
                        break;
                    }
                }
            }
            Some(frame) = rx.recv() => {
                if send_frame(&mut socket, codec, &frame).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(record) = state.workspaces.remove(&state.store, conn.id).await {
        info!(conn_id = %conn.id, workspace_id = %record.workspace_id, "workspace: disconnected");
    } else {
        info!(conn_id = %conn.id, "workspace: closed before registering");
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Handle one inbound frame. Returns the reply to send right away, if any.
async fn dispatch(state: &HubState, conn: &mut Connection, req: Frame) -> Option<Frame> {
    if req.is_reply() {
        warn!(conn_id = %conn.id, syscall = %req.syscall, "workspace: unexpected reply frame dropped");
        return None;
    }

    let request = match WorkspaceRequest::from_frame(&req) {
        Ok(request) => request,
        Err(e) => return Some(req.error_from(&e)),
    };

    match request {
        WorkspaceRequest::Register(registration) => Some(register(state, conn, &req, registration).await),
        _ if conn.workspace_id.is_none() => Some(req.error_from(&WorkspaceError::NotRegistered)),
        WorkspaceRequest::Query(query) => relay_query(state, conn, req, query),
        WorkspaceRequest::Ping => Some(req.done_with(json!({"timestamp": now_ms()}))),
    }
}

async fn register(state: &HubState, conn: &mut Connection, req: &Frame, registration: Registration) -> Frame {
    if conn.workspace_id.is_some() {
        return req.error_from(&WorkspaceError::Registration("connection is already registered".to_owned()));
    }
    let record = WorkspaceRecord::new(&registration.workspace_id, &registration.name, &registration.root_path);
    match state.workspaces.register(&state.store, conn.id, Some(record), conn.tx.clone()).await {
        Ok(snapshot) => {
            conn.workspace_id = Some(registration.workspace_id);
            let ack = registration_ack(snapshot);
            req.done_with(serde_json::to_value(&ack).unwrap_or_default())
        }
        Err(e) => {
            warn!(conn_id = %conn.id, error = %e, "workspace: registration rejected");
            req.error_from(&e)
        }
    }
}

pub(crate) fn registration_ack(snapshot: StoreSnapshot) -> RegistrationAck {
    RegistrationAck {
        success: true,
        assigned_boards: snapshot.boards.keys().cloned().collect(),
        cards_by_board: snapshot.boards,
        connected_boards: snapshot.connected_boards,
        selected_cards: snapshot.selected_cards,
    }
}

/// Validate and relay a query. The reply arrives later via the outbound queue.
fn relay_query(state: &HubState, conn: &Connection, req: Frame, query: RelayQuery) -> Option<Frame> {
    let op = match BoardOperation::parse(&query.operation, query.args) {
        Ok(op) => op,
        Err(e) => return Some(req.error_from(&e)),
    };

    let boards = state.boards.clone();
    let tx = conn.tx.clone();
    let conn_id = conn.id;
    tokio::spawn(async move {
        let reply = match boards.query(&query.board_id, &op).await {
            Ok(result) => req.done_with(json!({"result": result})),
            Err(e) => {
                warn!(%conn_id, board_id = %query.board_id, operation = op.name(), error = %e, "workspace: query failed");
                req.error_from(&e)
            }
        };
        let _ = tx.send(reply);
    });
    None
}

#[cfg(test)]
#[path = "workspace_ws_test.rs"]
mod tests;
