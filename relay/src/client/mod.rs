//! Workspace client — one process's connection to the hub.
//!
//! DESIGN
//! ======
//! `Disconnected → Connecting → Connected → Registered | Error`, published
//! on a watch channel. `connect` dials `/ws/workspace`, sends the
//! registration handshake and, once the hub acks, loads the snapshot into
//! the [`Replica`] and hands back a [`Session`]. A spawned IO task then owns
//! the socket: it resolves pending queries by `parent_id`, folds hub
//! broadcasts into the replica, re-emits them as [`ClientEvent`]s and sends
//! a periodic `workspace:ping`.
//!
//! ERROR HANDLING
//! ==============
//! Queries fail fast with [`ClientError::NotRegistered`] outside the
//! `Registered` state. Each query has its own client-side deadline; a lost
//! connection fails every pending query with [`ClientError::Disconnected`].
//! Nothing here retries; that is [`reconnect`]'s job.

pub mod reconnect;
pub mod replica;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use frames::protocol::{HubEvent, Registration, RegistrationAck, RelayQuery, WorkspaceRequest, codes};
use frames::{CodecError, Frame, Status, WireCodec};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

pub use replica::Replica;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>;

const EVENT_CAPACITY: usize = 256;
const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Hub address; the client speaks plain `ws://` to it.
    pub addr: SocketAddr,
    pub registration: Registration,
    /// Client-side query deadline, never shorter than the hub's.
    pub query_timeout: Duration,
    pub ping_interval: Duration,
    pub codec: WireCodec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Error,
}

/// What UI consumers observe.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    State(ClientState),
    /// A hub broadcast, already applied to the replica.
    Hub(HubEvent),
    Error(String),
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disconnect {
    /// The local process called [`WorkspaceClient::disconnect`].
    Requested,
    /// The socket died underneath us.
    Lost(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to hub at {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },
    #[error("client is not registered with a hub")]
    NotRegistered,
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("no reply to {operation} within {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("board not connected: {0}")]
    BoardNotConnected(String),
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
    #[error("hub connection lost")]
    Disconnected,
    #[error("gave up reconnecting after {0} attempts")]
    MaxRetriesExceeded(u32),
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),
}

// =============================================================================
// CLIENT
// =============================================================================

/// Live half of a session: what queries need to reach the IO task.
#[derive(Clone)]
struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
    pending: PendingMap,
    stop: Arc<watch::Sender<bool>>,
}

struct Inner {
    config: ClientConfig,
    state: watch::Sender<ClientState>,
    events: broadcast::Sender<ClientEvent>,
    replica: Mutex<Replica>,
    link: Mutex<Option<Link>>,
    next_link: AtomicU64,
}

/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct WorkspaceClient {
    inner: Arc<Inner>,
}

/// Handle on one established session.
pub struct Session {
    done: oneshot::Receiver<Disconnect>,
}

impl Session {
    /// Resolve once the session ends.
    pub async fn wait(self) -> Disconnect {
        self.done.await.unwrap_or_else(|_| Disconnect::Lost("session task ended".to_owned()))
    }
}

impl WorkspaceClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                events,
                replica: Mutex::new(Replica::new()),
                link: Mutex::new(None),
                next_link: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Copy of the current replica.
    #[must_use]
    pub fn replica(&self) -> Replica {
        self.inner.replica.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn connected_boards(&self) -> Vec<String> {
        self.inner.replica.lock().unwrap_or_else(PoisonError::into_inner).connected_boards()
    }

    /// Dial the hub, register, and start the session IO task.
    ///
    /// Any previous session is closed first.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connect`] when the socket cannot be opened,
    /// [`ClientError::Registration`] when the hub rejects the handshake or
    /// does not answer it in time.
    pub async fn connect(&self) -> Result<Session, ClientError> {
        self.disconnect();
        let addr = self.inner.config.addr;
        self.set_state(ClientState::Connecting);

        let url = format!("ws://{addr}/ws/workspace?codec={}", self.inner.config.codec.as_param());
        let timeout = self.inner.config.query_timeout;
        let mut socket = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => return Err(self.fail(ClientError::Connect { addr, reason: e.to_string() })),
            Err(_) => return Err(self.fail(ClientError::Connect { addr, reason: "connect timed out".to_owned() })),
        };
        self.set_state(ClientState::Connected);

        let ack = match self.register(&mut socket).await {
            Ok(ack) => ack,
            Err(e) => {
                let _ = socket.close(None).await;
                return Err(self.fail(e));
            }
        };
        self.inner.replica.lock().unwrap_or_else(PoisonError::into_inner).reset(&ack);

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let link = Link {
            id: self.inner.next_link.fetch_add(1, Ordering::Relaxed),
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(stop),
        };
        *self.inner.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link.clone());
        info!(
            %addr,
            workspace = %self.inner.config.registration.workspace_id,
            boards = ack.assigned_boards.len(),
            "client: registered"
        );
        self.set_state(ClientState::Registered);

        let (done_tx, done) = oneshot::channel();
        tokio::spawn({
            let client = self.clone();
            async move {
                let reason = client.run_session(socket, &link, rx, stop_rx).await;
                client.end_session(&link, &reason);
                let _ = done_tx.send(reason);
            }
        });

        Ok(Session { done })
    }

    /// Close the current session, if any. The session resolves
    /// [`Disconnect::Requested`] and no reconnect is attempted for it.
    pub fn disconnect(&self) {
        let link = self.inner.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            link.stop.send_replace(true);
            self.set_state(ClientState::Disconnected);
        }
    }

    /// Relay `operation` to a board through the hub.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotRegistered`] outside the `Registered` state,
    /// [`ClientError::BoardNotConnected`] when the hub has no link to the
    /// board, [`ClientError::Timeout`] past the client deadline, and
    /// [`ClientError::Remote`] for any other hub-reported failure.
    pub async fn query(&self, board_id: &str, operation: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let req = WorkspaceRequest::Query(RelayQuery {
            board_id: board_id.to_owned(),
            operation: operation.to_owned(),
            args,
        })
        .to_frame();
        let reply = self.request(req, operation).await?;
        match reply.status {
            Status::Error => Err(remote_error(board_id, &reply)),
            _ => Ok(reply.data.get("result").cloned().unwrap_or(Value::Null)),
        }
    }

    /// [`Self::query`] with the result deserialized.
    ///
    /// # Errors
    ///
    /// As [`Self::query`], plus [`ClientError::Remote`] with `E_PROTOCOL`
    /// when the result does not have the expected shape.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        board_id: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<T, ClientError> {
        let value = self.query(board_id, operation, args).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Remote {
            code: codes::PROTOCOL.to_owned(),
            message: format!("unexpected {operation} result: {e}"),
        })
    }

    /// Round-trip a `workspace:ping`; returns the hub's timestamp.
    ///
    /// # Errors
    ///
    /// As [`Self::query`].
    pub async fn ping(&self) -> Result<i64, ClientError> {
        let reply = self.request(WorkspaceRequest::Ping.to_frame(), "ping").await?;
        if reply.status == Status::Error {
            return Err(remote_error("", &reply));
        }
        Ok(reply.data.get("timestamp").and_then(Value::as_i64).unwrap_or(0))
    }

    // -------------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------------

    async fn request(&self, req: Frame, operation: &str) -> Result<Frame, ClientError> {
        if self.state() != ClientState::Registered {
            return Err(ClientError::NotRegistered);
        }
        let Some(link) = self.inner.link.lock().unwrap_or_else(PoisonError::into_inner).clone() else {
            return Err(ClientError::NotRegistered);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let id = req.id.clone();
        link.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(id.clone(), reply_tx);
        if link.tx.send(req).is_err() {
            link.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            return Err(ClientError::Disconnected);
        }

        let timeout = self.inner.config.query_timeout;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                link.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                Err(ClientError::Timeout {
                    operation: operation.to_owned(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn register(&self, socket: &mut Socket) -> Result<RegistrationAck, ClientError> {
        let req = WorkspaceRequest::Register(self.inner.config.registration.clone()).to_frame();
        let msg = encode(self.inner.config.codec, &req)?;
        socket.send(msg).await.map_err(|e| ClientError::Registration(e.to_string()))?;

        match tokio::time::timeout(self.inner.config.query_timeout, read_ack(socket, &req.id)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Registration("no registration ack".to_owned())),
        }
    }

    async fn run_session(
        &self,
        mut socket: Socket,
        link: &Link,
        mut rx: mpsc::UnboundedReceiver<Frame>,
        mut stop: watch::Receiver<bool>,
    ) -> Disconnect {
        let codec = self.inner.config.codec;
        let mut ping = tokio::time::interval(self.inner.config.ping_interval.max(MIN_PING_INTERVAL));
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = socket.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                        None => return Disconnect::Lost("hub closed the connection".to_owned()),
                    };
                    if let Message::Close(_) = msg {
                        return Disconnect::Lost("hub closed the connection".to_owned());
                    }
                    match decode(&msg) {
                        Some(Ok(frame)) => self.handle_inbound(link, frame),
                        Some(Err(e)) => warn!(error = %e, "client: invalid inbound frame"),
                        None => {}
                    }
                }
                Some(frame) = rx.recv() => {
                    if let Err(e) = send(&mut socket, codec, &frame).await {
                        return Disconnect::Lost(e);
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = send(&mut socket, codec, &WorkspaceRequest::Ping.to_frame()).await {
                        return Disconnect::Lost(e);
                    }
                }
                _ = stop.changed() => {
                    let _ = socket.close(None).await;
                    return Disconnect::Requested;
                }
            }
        }
    }

    fn handle_inbound(&self, link: &Link, frame: Frame) {
        if let Some(parent_id) = frame.parent_id.as_deref() {
            let waiter = link.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(parent_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                }
                // Keepalive replies and replies past their deadline.
                None => debug!(parent_id, syscall = %frame.syscall, "client: unmatched reply dropped"),
            }
            return;
        }

        match HubEvent::from_frame(&frame) {
            Ok(event) => {
                self.inner.replica.lock().unwrap_or_else(PoisonError::into_inner).apply(&event);
                let _ = self.inner.events.send(ClientEvent::Hub(event));
            }
            Err(e) => warn!(syscall = %frame.syscall, error = %e, "client: unknown hub event"),
        }
    }

    fn end_session(&self, link: &Link, reason: &Disconnect) {
        // Dropping the senders fails every waiting query.
        link.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();

        let mut current = self.inner.link.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|c| c.id == link.id) {
            *current = None;
            drop(current);
            if let Disconnect::Lost(why) = reason {
                warn!(reason = %why, "client: session lost");
                let _ = self.inner.events.send(ClientEvent::Error(why.clone()));
            }
            self.set_state(ClientState::Disconnected);
        }
    }

    fn set_state(&self, state: ClientState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(?state, "client: state");
            let _ = self.inner.events.send(ClientEvent::State(state));
        }
    }

    fn fail(&self, err: ClientError) -> ClientError {
        warn!(error = %err, "client: connect failed");
        self.set_state(ClientState::Error);
        let _ = self.inner.events.send(ClientEvent::Error(err.to_string()));
        err
    }
}

async fn read_ack(socket: &mut Socket, request_id: &str) -> Result<RegistrationAck, ClientError> {
    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| ClientError::Registration(e.to_string()))?;
        let Some(frame) = decode(&msg) else { continue };
        let frame = frame?;
        if frame.parent_id.as_deref() != Some(request_id) {
            debug!(syscall = %frame.syscall, "client: frame before registration ack ignored");
            continue;
        }
        if frame.status == Status::Error {
            let message = frame.error_message().unwrap_or("registration rejected");
            return Err(ClientError::Registration(message.to_owned()));
        }
        return serde_json::from_value(frame.data).map_err(|e| ClientError::Registration(format!("malformed ack: {e}")));
    }
    Err(ClientError::Registration("hub closed the connection".to_owned()))
}

fn remote_error(board_id: &str, reply: &Frame) -> ClientError {
    let code = reply.error_code().unwrap_or(codes::PROTOCOL);
    if code == codes::BOARD_NOT_CONNECTED {
        return ClientError::BoardNotConnected(board_id.to_owned());
    }
    ClientError::Remote {
        code: code.to_owned(),
        message: reply.error_message().unwrap_or("unknown error").to_owned(),
    }
}

// =============================================================================
// SOCKET CODEC
// =============================================================================

fn encode(codec: WireCodec, frame: &Frame) -> Result<Message, CodecError> {
    match codec {
        WireCodec::Json => Ok(Message::Text(frames::encode_json(frame)?.into())),
        WireCodec::Protobuf => Ok(Message::Binary(frames::encode_frame(frame).into())),
    }
}

fn decode(msg: &Message) -> Option<Result<Frame, CodecError>> {
    match msg {
        Message::Text(text) => Some(frames::decode_json(text.as_str())),
        Message::Binary(bytes) => Some(frames::decode_frame(bytes)),
        _ => None,
    }
}

async fn send(socket: &mut Socket, codec: WireCodec, frame: &Frame) -> Result<(), String> {
    let msg = encode(codec, frame).map_err(|e| e.to_string())?;
    socket.send(msg).await.map_err(|e| e.to_string())
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
