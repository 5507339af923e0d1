//! Router assembly and shared socket plumbing.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router serves the two HTTP auxiliary endpoints and the three
//! websocket namespaces. Each websocket negotiates its outbound encoding
//! with the `codec` upgrade parameter; inbound text is decoded as JSON and
//! inbound binary as protobuf regardless of that choice.

pub mod board_ws;
pub mod status;
pub mod workspace_ws;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::routing::get;
use frames::{CodecError, Frame, Status, WireCodec};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::state::HubState;

/// Hub router: health, storage, and the websocket endpoints.
pub fn app(state: HubState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(status::health))
        .route("/storage", get(status::storage))
        .route("/ws/board", get(board_ws::handle_board_ws))
        .route("/ws/workspace", get(workspace_ws::handle_workspace_ws))
        .route("/ws/status", get(status::handle_status_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SOCKET CODEC
// =============================================================================

/// Decode one inbound websocket message.
///
/// `None` for control messages that carry no frame.
pub(crate) fn decode_message(msg: &Message) -> Option<Result<Frame, CodecError>> {
    match msg {
        Message::Text(text) => Some(frames::decode_json(text.as_str())),
        Message::Binary(bytes) => Some(frames::decode_frame(bytes)),
        _ => None,
    }
}

pub(crate) fn encode_message(codec: WireCodec, frame: &Frame) -> Result<Message, CodecError> {
    match codec {
        WireCodec::Json => Ok(Message::Text(frames::encode_json(frame)?.into())),
        WireCodec::Protobuf => Ok(Message::Binary(frames::encode_frame(frame).into())),
    }
}

/// Encode and send one frame.
///
/// # Errors
///
/// Returns `Err(())` when the frame cannot be encoded or the socket is gone;
/// callers treat both as the end of the connection.
pub(crate) async fn send_frame(socket: &mut WebSocket, codec: WireCodec, frame: &Frame) -> Result<(), ()> {
    let msg = match encode_message(codec, frame) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, syscall = %frame.syscall, "ws: failed to encode frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.error_code().unwrap_or("-");
        let message = frame.error_message().unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(msg).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
