//! Socket-level test fixtures: a fake canvas board, a hub on an ephemeral
//! port, and a polling helper.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use frames::protocol::{BoardEvent, BoardOperation};
use frames::{Card, Frame, Status};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::client::reconnect::ReconnectPolicy;
use crate::config::{RelayConfig, WorkspaceIdentity};
use crate::hub::{HubHandle, start_hub};

pub use crate::state::test_helpers::card;

/// Custom operation the fake board rejects with an error frame.
pub const OP_REFUSE: &str = "refuse";
/// Custom operation the fake board never answers.
pub const OP_IGNORE: &str = "ignore";

/// Config with short timings for one test node on `port`.
pub fn test_config(port: u16, workspace: &str) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".to_owned(),
        port,
        query_timeout: Duration::from_secs(2),
        client_timeout: Duration::from_secs(3),
        probe_timeout: Duration::from_millis(300),
        settle_delay: Duration::from_millis(50),
        probe_retries: 40,
        ping_interval: Duration::from_secs(30),
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(250),
            multiplier: 2.0,
            max_attempts: 40,
            jitter: false,
        },
        snapshot_path: None,
        snapshot_interval: Duration::from_millis(50),
        workspace: WorkspaceIdentity::from_root(PathBuf::from(format!("/tmp/relay-test/{workspace}"))),
    }
}

/// A port nothing listens on right now.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral");
    listener.local_addr().expect("local addr").port()
}

/// Start a hub on an ephemeral port.
pub async fn spawn_hub(config: &RelayConfig) -> HubHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral");
    start_hub(listener, config).await.expect("start hub")
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// FAKE BOARD
// =============================================================================

/// A canvas board speaking JSON text frames to `/ws/board`.
///
/// Answers `getBoardInfo` and `cards` from its fixture, `true` to the
/// selection and status operations, and records every query it receives.
pub struct FakeBoard {
    queries: mpsc::UnboundedReceiver<BoardOperation>,
    outbound: mpsc::UnboundedSender<Frame>,
    task: JoinHandle<()>,
}

impl FakeBoard {
    pub async fn connect(addr: SocketAddr, board_id: &str, name: &str, cards: Vec<Card>) -> Self {
        let (mut socket, _) = connect_async(format!("ws://{addr}/ws/board")).await.expect("board connect");
        let (query_tx, queries) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let info = json!({"boardId": board_id, "name": name});

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = socket.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(_)) => continue,
                            _ => break,
                        };
                        let Ok(frame) = frames::decode_json(text.as_str()) else { continue };
                        if frame.status != Status::Request {
                            continue;
                        }
                        let Ok(op) = BoardOperation::from_frame(&frame) else { continue };
                        let reply = answer(&frame, &op, &info, &cards);
                        let _ = query_tx.send(op);
                        if let Some(reply) = reply {
                            let text = frames::encode_json(&reply).expect("encode reply");
                            if socket.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(frame) = outbound_rx.recv() => {
                        let text = frames::encode_json(&frame).expect("encode event");
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self { queries, outbound, task }
    }

    /// Push a board-originated event to the hub.
    pub fn send_event(&self, event: &BoardEvent) {
        self.outbound.send(event.to_frame()).expect("board task alive");
    }

    /// Next query the hub relayed, skipping identification traffic.
    pub async fn next_query(&mut self) -> BoardOperation {
        loop {
            let op = tokio::time::timeout(Duration::from_secs(5), self.queries.recv())
                .await
                .expect("board query timed out")
                .expect("board task ended");
            if !matches!(op, BoardOperation::GetBoardInfo | BoardOperation::Cards) {
                return op;
            }
        }
    }

    /// Drop the socket without a close handshake.
    pub fn kill(self) {
        self.task.abort();
    }
}

fn answer(frame: &Frame, op: &BoardOperation, info: &serde_json::Value, cards: &[Card]) -> Option<Frame> {
    match op {
        BoardOperation::GetBoardInfo => Some(frame.done_with(json!({"result": info}))),
        BoardOperation::Cards => Some(frame.done_with(json!({"result": cards}))),
        BoardOperation::CardStatus(_) | BoardOperation::SelectCard(_) | BoardOperation::HoverCard(_) => {
            Some(frame.done_with(json!({"result": true})))
        }
        BoardOperation::Custom { operation, .. } if operation == OP_REFUSE => Some(frame.error("board refused")),
        BoardOperation::Custom { operation, .. } if operation == OP_IGNORE => None,
        BoardOperation::Custom { args, .. } => Some(frame.done_with(json!({"result": args}))),
    }
}
