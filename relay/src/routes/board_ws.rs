//! Board websocket — hub side of one canvas board connection.
//!
//! DESIGN
//! ======
//! Each connection walks `Connecting → Identifying → Active → Closed`:
//! - Connecting: the upgrade itself.
//! - Identifying: a spawned task asks the board for `getBoardInfo` and its
//!   full `cards` list while the socket loop keeps pumping frames so the
//!   replies can arrive. Board events that show up early are buffered.
//! - Active: the board is in the store and registered with the connection
//!   manager; events mutate the store (which fans out to listeners) or are
//!   forwarded as-is when they carry no state (`navigateTo`).
//! - Closed: the link is unregistered, pending queries fail, listeners
//!   learn `boardDisconnected`. Card data stays in the store.
//!
//! ERROR HANDLING
//! ==============
//! A malformed frame or a failed store mutation is logged and skipped; only
//! a failed identification or a dead socket ends the connection.

use std::collections::HashMap;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use frames::protocol::{BoardEvent, BoardOperation, HubEvent};
use frames::{BoardInfo, Card, ErrorCode, Frame, Status, WireCodec};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::services::connections::{BoardLink, QueryError};
use crate::state::HubState;
use crate::store::StoreError;

use super::{decode_message, send_frame};

/// Connection lifecycle after the upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Identifying,
    Active,
}

/// What a board told us about itself during identification.
struct BoardIdentity {
    info: BoardInfo,
    cards: Vec<Card>,
}

#[derive(Debug, thiserror::Error)]
enum IdentifyError {
    #[error("board query failed: {0}")]
    Query(#[from] QueryError),
    #[error("board reported an empty boardId")]
    EmptyBoardId,
    #[error("store rejected board: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_board_ws(
    State(state): State<HubState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let codec = WireCodec::from_param(params.get("codec").map(String::as_str));
    ws.on_upgrade(move |socket| run_board(socket, state, codec))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_board(mut socket: WebSocket, state: HubState, codec: WireCodec) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let link = BoardLink::new(tx);
    let mut shutdown = state.shutdown_signal();
    if *shutdown.borrow() {
        return;
    }

    info!(link = %link.id(), codec = codec.as_param(), "board: connected");

    let (identity_tx, mut identity_rx) = oneshot::channel();
    tokio::spawn({
        let state = state.clone();
        let link = link.clone();
        async move {
            let _ = identity_tx.send(identify(&state, &link).await);
        }
    });

    let mut phase = Phase::Identifying;
    let mut board_id: Option<String> = None;
    let mut early_events: Vec<BoardEvent> = Vec::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Some(decoded) = decode_message(&msg) else { continue };
                let frame = match decoded {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(link = %link.id(), error = %e, "board: invalid inbound frame");
                        continue;
                    }
                };
                if let Some(reply) = handle_inbound(&state, &link, board_id.as_deref(), &mut early_events, frame).await {
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
            result = &mut identity_rx, if phase == Phase::Identifying => {
                let identity = match result {
                    Ok(Ok(identity)) => identity,
                    Ok(Err(e)) => {
                        warn!(link = %link.id(), error = %e, "board: identification failed");
                        break;
                    }
                    Err(_) => break,
                };
                match activate(&state, &link, identity).await {
                    Ok(id) => {
                        for event in early_events.drain(..) {
                            apply_event(&state, &id, event).await;
                        }
                        board_id = Some(id);
                        phase = Phase::Active;
                    }
                    Err(e) => {
                        warn!(link = %link.id(), error = %e, "board: activation failed");
                        break;
                    }
                }
            }
            () = link.closed() => {
                info!(link = %link.id(), board_id = ?board_id, "board: replaced by a newer connection");
                break;
            }
            _ = shutdown.changed() => break,
        }
    }

    let failed = link.fail_pending();
    if let Some(board_id) = board_id {
        if state.boards.disconnect_board(&board_id, link.id()).await {
            state.workspaces.broadcast(&HubEvent::BoardDisconnected { board_id: board_id.clone() }).await;
        }
        info!(%board_id, link = %link.id(), failed, "board: disconnected");
    } else {
        info!(link = %link.id(), failed, "board: closed before identification");
    }
}

// =============================================================================
// IDENTIFICATION
// =============================================================================

async fn identify(state: &HubState, link: &BoardLink) -> Result<BoardIdentity, IdentifyError> {
    let timeout = state.boards.default_timeout();
    let info: BoardInfo = link.query_as("", &BoardOperation::GetBoardInfo, timeout).await?;
    if info.board_id.trim().is_empty() {
        return Err(IdentifyError::EmptyBoardId);
    }
    let cards: Vec<Card> = link.query_as(&info.board_id, &BoardOperation::Cards, timeout).await?;
    Ok(BoardIdentity { info, cards })
}

/// Upsert the identified board, mark it connected, announce it.
async fn activate(state: &HubState, link: &BoardLink, identity: BoardIdentity) -> Result<String, IdentifyError> {
    let BoardIdentity { info, cards } = identity;
    let board_id = info.board_id.clone();
    {
        let mut store = state.store.write().await;
        store.add_board(&board_id, &info.name);
        store.set_board_name(&board_id, &info.name)?;
        let total = cards.len();
        let skipped = store.set_board_cards(&board_id, cards)?;
        if skipped > 0 {
            warn!(%board_id, skipped, total, "board: cards without canvasLink skipped");
        }
    }
    state.boards.connect_board(&board_id, link.clone()).await;
    state.workspaces.broadcast(&HubEvent::BoardConnected(info)).await;
    info!(%board_id, link = %link.id(), "board: active");
    Ok(board_id)
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Route one inbound frame and return the reply owed to the board, if any.
async fn handle_inbound(
    state: &HubState,
    link: &BoardLink,
    board_id: Option<&str>,
    early_events: &mut Vec<BoardEvent>,
    frame: Frame,
) -> Option<Frame> {
    if frame.is_reply() {
        link.resolve(&frame);
        return None;
    }

    match BoardEvent::from_frame(&frame) {
        Ok(event) => {
            match board_id {
                Some(board_id) => apply_event(state, board_id, event).await,
                None => early_events.push(event),
            }
            None
        }
        Err(e) => {
            warn!(link = %link.id(), syscall = %frame.syscall, error = %e, "board: unhandled frame");
            // Only requests are owed an answer; stray events are dropped.
            (frame.status == Status::Request && frame.parent_id.is_none()).then(|| frame.error_from(&e))
        }
    }
}

async fn apply_event(state: &HubState, board_id: &str, event: BoardEvent) {
    match event {
        BoardEvent::NavigateTo(card) => {
            debug!(%board_id, link = ?card.link(), "board: navigateTo");
            state
                .workspaces
                .broadcast(&HubEvent::NavigateTo { board_id: board_id.to_owned(), card })
                .await;
        }
        BoardEvent::Card { canvas_link, card: Some(mut card) } => {
            // The event's own addressing wins over the embedded card's.
            if !canvas_link.is_empty() {
                if card.link().is_some_and(|inner| inner != canvas_link) {
                    warn!(%board_id, link = %canvas_link, inner = ?card.link(), "board: card link mismatch");
                }
                card.canvas_link = Some(canvas_link);
            }
            if let Err(e) = state.store.write().await.set_card(board_id, card) {
                warn!(%board_id, code = e.error_code(), error = %e, "board: card update rejected");
            }
        }
        BoardEvent::Card { canvas_link, card: None } => {
            state.store.write().await.delete_card_by_link(&canvas_link);
        }
        BoardEvent::SelectedCards(cards) => {
            let links = cards.iter().filter_map(Card::link).map(ToOwned::to_owned).collect();
            state.store.write().await.set_selected_cards(board_id, links);
        }
    }
}

#[cfg(test)]
#[path = "board_ws_test.rs"]
mod tests;
