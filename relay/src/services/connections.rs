//! Board connection manager — live board links and hub → board queries.
//!
//! DESIGN
//! ======
//! Each board websocket owns one [`BoardLink`]: an outbound frame queue,
//! its pending-query map, and a close signal. The manager maps board IDs to
//! the current link. Connecting a board that already has a link replaces the
//! old one: the old link is closed and its pending queries fail.
//!
//! Queries are request/response over the link: the request frame's `id` is
//! the pending-map key and the board's reply carries it as `parent_id`. A
//! query resolves on the matching reply, or fails on timeout or when the
//! link goes away. The manager never retries.
//!
//! ERROR HANDLING
//! ==============
//! A query to a board without a live link fails before any frame is built.
//! A reply whose `parent_id` matches nothing is logged and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use frames::protocol::{BoardOperation, codes};
use frames::{ErrorCode, Frame, Status};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::SharedStore;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("board {0} is not connected")]
    BoardNotConnected(String),
    #[error("{operation} on board {board_id} timed out after {timeout_ms}ms")]
    Timeout { board_id: String, operation: String, timeout_ms: u64 },
    #[error("board {0} disconnected before replying")]
    Disconnected(String),
    #[error("board {board_id} failed {operation}: {message}")]
    Board { board_id: String, operation: String, message: String },
    #[error("unexpected reply to {operation}: {reason}")]
    BadReply { operation: String, reason: String },
    #[error("{0}")]
    InvalidArgs(String),
}

impl ErrorCode for QueryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BoardNotConnected(_) => codes::BOARD_NOT_CONNECTED,
            Self::Timeout { .. } => codes::QUERY_TIMEOUT,
            Self::Disconnected(_) => codes::BOARD_DISCONNECTED,
            Self::Board { .. } => codes::BOARD_ERROR,
            Self::BadReply { .. } => codes::PROTOCOL,
            Self::InvalidArgs(_) => codes::INVALID_ARGS,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::BoardNotConnected(_) | Self::Timeout { .. } | Self::Disconnected(_))
    }
}

// =============================================================================
// BOARD LINK
// =============================================================================

/// An outstanding hub → board query.
struct PendingQuery {
    board_id: String,
    operation: String,
    created_at: Instant,
    reply: oneshot::Sender<Result<Value, QueryError>>,
}

/// One live board websocket, as seen by the rest of the hub.
#[derive(Clone)]
pub struct BoardLink {
    id: Uuid,
    tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<HashMap<String, PendingQuery>>>,
    closed: Arc<Notify>,
}

impl BoardLink {
    /// Create a link whose outbound frames go to `tx`.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingQuery>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send an operation and wait for the board's reply.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Timeout`] if no reply arrives in time,
    /// [`QueryError::Disconnected`] if the link drops first, and
    /// [`QueryError::Board`] if the board answers with an error frame.
    pub async fn query(&self, board_id: &str, op: &BoardOperation, timeout: Duration) -> Result<Value, QueryError> {
        let mut frame = op.to_frame().with_from("hub");
        // Identity queries go out before the board has told us its ID.
        if !board_id.is_empty() {
            frame = frame.with_board_id(board_id);
        }
        let request_id = frame.id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending().insert(
            request_id.clone(),
            PendingQuery {
                board_id: board_id.to_owned(),
                operation: op.name().to_owned(),
                created_at: Instant::now(),
                reply: reply_tx,
            },
        );

        if self.tx.send(frame).is_err() {
            self.pending().remove(&request_id);
            return Err(QueryError::Disconnected(board_id.to_owned()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueryError::Disconnected(board_id.to_owned())),
            Err(_) => {
                self.pending().remove(&request_id);
                Err(QueryError::Timeout {
                    board_id: board_id.to_owned(),
                    operation: op.name().to_owned(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Query and deserialize the result into the type the caller expects.
    ///
    /// # Errors
    ///
    /// Everything [`BoardLink::query`] returns, plus [`QueryError::BadReply`]
    /// when the result does not have the expected shape.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        board_id: &str,
        op: &BoardOperation,
        timeout: Duration,
    ) -> Result<T, QueryError> {
        let value = self.query(board_id, op, timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| QueryError::BadReply { operation: op.name().to_owned(), reason: e.to_string() })
    }

    /// Complete the pending query a reply frame answers.
    ///
    /// Returns `false` when the frame answers nothing outstanding.
    pub fn resolve(&self, frame: &Frame) -> bool {
        let Some(parent_id) = frame.parent_id.as_deref() else {
            return false;
        };
        let Some(pending) = self.pending().remove(parent_id) else {
            warn!(%parent_id, syscall = %frame.syscall, "board: reply for unknown request dropped");
            return false;
        };

        let result = match frame.status {
            Status::Error => Err(QueryError::Board {
                board_id: pending.board_id.clone(),
                operation: pending.operation.clone(),
                message: frame.error_message().unwrap_or("board returned an error").to_owned(),
            }),
            Status::Cancel => Err(QueryError::Disconnected(pending.board_id.clone())),
            _ => Ok(frame.data.get("result").cloned().unwrap_or(Value::Null)),
        };
        debug!(
            board_id = %pending.board_id,
            operation = %pending.operation,
            elapsed_ms = pending.created_at.elapsed().as_millis(),
            ok = result.is_ok(),
            "board: query resolved"
        );
        // The caller may have timed out already; nothing to do then.
        let _ = pending.reply.send(result);
        true
    }

    /// Fail every outstanding query with `Disconnected`.
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<PendingQuery> = self.pending().drain().map(|(_, pending)| pending).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.reply.send(Err(QueryError::Disconnected(pending.board_id)));
        }
        count
    }

    /// Ask the owning socket task to close the connection.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`BoardLink::close`] has been called.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Board ID → current live link. Cheap to clone.
#[derive(Clone)]
pub struct BoardConnections {
    links: Arc<RwLock<HashMap<String, BoardLink>>>,
    store: SharedStore,
    default_timeout: Duration,
}

impl BoardConnections {
    #[must_use]
    pub fn new(store: SharedStore, default_timeout: Duration) -> Self {
        Self { links: Arc::new(RwLock::new(HashMap::new())), store, default_timeout }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Install `link` as the board's live connection and mark it connected.
    ///
    /// A previous link for the same board is closed and its pending queries
    /// fail; it is returned for logging.
    pub async fn connect_board(&self, board_id: &str, link: BoardLink) -> Option<BoardLink> {
        let replaced = self.links.write().await.insert(board_id.to_owned(), link);
        if let Some(old) = &replaced {
            let failed = old.fail_pending();
            old.close();
            info!(%board_id, old_link = %old.id(), failed, "board: connection replaced");
        }
        self.store.write().await.set_board_connected(board_id, true);
        replaced
    }

    /// Remove the board's link if `link_id` is still the current one.
    ///
    /// A replaced connection closing later must not unregister its
    /// successor, so stale IDs are ignored and `false` is returned.
    pub async fn disconnect_board(&self, board_id: &str, link_id: Uuid) -> bool {
        let removed = {
            let mut links = self.links.write().await;
            if links.get(board_id).is_some_and(|link| link.id() == link_id) {
                links.remove(board_id)
            } else {
                None
            }
        };
        let Some(link) = removed else {
            return false;
        };
        link.fail_pending();
        self.store.write().await.set_board_connected(board_id, false);
        true
    }

    pub async fn get_board_connection(&self, board_id: &str) -> Option<BoardLink> {
        self.links.read().await.get(board_id).cloned()
    }

    pub async fn is_connected(&self, board_id: &str) -> bool {
        self.links.read().await.contains_key(board_id)
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Query a board with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::BoardNotConnected`] without sending anything
    /// when the board has no live link, otherwise whatever the link returns.
    pub async fn query(&self, board_id: &str, op: &BoardOperation) -> Result<Value, QueryError> {
        self.query_with_timeout(board_id, op, self.default_timeout).await
    }

    /// Query a board with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`BoardConnections::query`].
    pub async fn query_with_timeout(
        &self,
        board_id: &str,
        op: &BoardOperation,
        timeout: Duration,
    ) -> Result<Value, QueryError> {
        let Some(link) = self.get_board_connection(board_id).await else {
            return Err(QueryError::BoardNotConnected(board_id.to_owned()));
        };
        link.query(board_id, op, timeout).await
    }

    /// Query a board and deserialize the result.
    ///
    /// # Errors
    ///
    /// See [`BoardConnections::query`] and [`BoardLink::query_as`].
    pub async fn query_as<T: DeserializeOwned>(&self, board_id: &str, op: &BoardOperation) -> Result<T, QueryError> {
        let Some(link) = self.get_board_connection(board_id).await else {
            return Err(QueryError::BoardNotConnected(board_id.to_owned()));
        };
        link.query_as(board_id, op, self.default_timeout).await
    }
}

#[cfg(test)]
#[path = "connections_test.rs"]
mod tests;
