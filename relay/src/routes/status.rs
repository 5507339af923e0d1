//! Status surface — health probe, storage dump, read-only status socket.
//!
//! `/health` is what election probes hit, so it must stay cheap and never
//! touch the store. The status socket answers `status:snapshot` and then
//! streams the same change events a workspace receives; anything else is
//! refused with `E_READ_ONLY`.

use std::collections::{BTreeMap, HashMap};

use axum::Json;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use frames::protocol::{STATUS_SNAPSHOT, codes};
use frames::{Board, ErrorCode, Frame, WireCodec, now_ms};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::workspace::WorkspaceRecord;
use crate::state::HubState;
use crate::store::StoreSnapshot;

use super::{decode_message, send_frame};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    #[serde(default)]
    pub role: String,
}

/// `/storage` body and `status:snapshot` reply.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageReport {
    pub boards: BTreeMap<String, Board>,
    pub connected_boards: Vec<String>,
    pub selected_cards: Vec<String>,
    pub workspaces: Vec<WorkspaceRecord>,
    pub total_cards: usize,
}

impl StorageReport {
    fn new(snapshot: StoreSnapshot, workspaces: Vec<WorkspaceRecord>) -> Self {
        Self {
            total_cards: snapshot.total_cards(),
            boards: snapshot.boards,
            connected_boards: snapshot.connected_boards,
            selected_cards: snapshot.selected_cards,
            workspaces,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("status channel is read-only: {0} is not accepted")]
struct ReadOnly(String);

impl ErrorCode for ReadOnly {
    fn error_code(&self) -> &'static str {
        codes::READ_ONLY
    }
}

// =============================================================================
// HTTP
// =============================================================================

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_owned(), timestamp: now_ms(), role: "hub".to_owned() })
}

pub async fn storage(State(state): State<HubState>) -> Json<StorageReport> {
    Json(storage_report(&state).await)
}

pub(crate) async fn storage_report(state: &HubState) -> StorageReport {
    let snapshot = state.store.read().await.snapshot();
    let workspaces = state.workspaces.workspaces().await;
    StorageReport::new(snapshot, workspaces)
}

// =============================================================================
// STATUS SOCKET
// =============================================================================

pub async fn handle_status_ws(
    State(state): State<HubState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let codec = WireCodec::from_param(params.get("codec").map(String::as_str));
    ws.on_upgrade(move |socket| run_status(socket, state, codec))
}

async fn run_status(mut socket: WebSocket, state: HubState, codec: WireCodec) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let mut shutdown = state.shutdown_signal();
    let mut streaming = false;
    info!(%conn_id, "status: connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Some(decoded) = decode_message(&msg) else { continue };
                let req = match decoded {
                    Ok(req) => req,
                    Err(e) => {
                        warn!(%conn_id, error = %e, "status: invalid inbound frame");
                        continue;
                    }
                };
                let reply = handle_status_request(&state, conn_id, &tx, &mut streaming, &req).await;
                if send_frame(&mut socket, codec, &reply).await.is_err() {
                    break;
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

    state.workspaces.remove(&state.store, conn_id).await;
    info!(%conn_id, "status: disconnected");
}

async fn handle_status_request(
    state: &HubState,
    conn_id: Uuid,
    tx: &mpsc::UnboundedSender<Frame>,
    streaming: &mut bool,
    req: &Frame,
) -> Frame {
    if req.syscall != STATUS_SNAPSHOT {
        return req.error_from(&ReadOnly(req.syscall.clone()));
    }

    let snapshot = if *streaming {
        state.store.read().await.snapshot()
    } else {
        // First snapshot also starts the change stream, atomically.
        match state.workspaces.register(&state.store, conn_id, None, tx.clone()).await {
            Ok(snapshot) => {
                *streaming = true;
                snapshot
            }
            Err(e) => return req.error_from(&e),
        }
    };
    let report = StorageReport::new(snapshot, state.workspaces.workspaces().await);
    req.done_with(serde_json::to_value(&report).unwrap_or_default())
}

#[cfg(test)]
#[path = "status_test.rs"]
mod tests;
