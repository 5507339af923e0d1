//! Typed protocol over the [`Frame`] envelope.
//!
//! ARCHITECTURE
//! ============
//! Three namespaces share one envelope:
//! - `board:` — hub ↔ canvas board. The hub sends `board:query`
//!   requests; boards push `navigateTo`, `card` and `selectedCards` events.
//! - `workspace:` — workspace client ↔ hub. Registration, relayed queries,
//!   liveness pings, and the hub's change broadcasts.
//! - `status:` — read-only snapshot channel for status surfaces.
//!
//! Every namespace decodes into a closed enum so the hub and the client
//! dispatch with exhaustive matches instead of string lookups.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{Board, BoardInfo, Card, CardStatus};
use crate::{ErrorCode, Frame};

// =============================================================================
// SYSCALLS
// =============================================================================

pub const BOARD_QUERY: &str = "board:query";
pub const BOARD_NAVIGATE_TO: &str = "board:navigateTo";
pub const BOARD_CARD: &str = "board:card";
pub const BOARD_SELECTED_CARDS: &str = "board:selectedCards";

pub const WORKSPACE_REGISTER: &str = "workspace:register";
pub const WORKSPACE_QUERY: &str = "workspace:query";
pub const WORKSPACE_PING: &str = "workspace:ping";

pub const WORKSPACE_CONNECTED_BOARDS: &str = "workspace:connectedBoards";
pub const WORKSPACE_BOARD_UPDATE: &str = "workspace:boardUpdate";
pub const WORKSPACE_CARD_UPDATE: &str = "workspace:cardUpdate";
pub const WORKSPACE_SELECTED_CARDS: &str = "workspace:selectedCards";
pub const WORKSPACE_BOARD_CONNECTED: &str = "workspace:boardConnected";
pub const WORKSPACE_BOARD_DISCONNECTED: &str = "workspace:boardDisconnected";
pub const WORKSPACE_NAVIGATE_TO: &str = "workspace:navigateTo";
pub const WORKSPACE_CLEARED: &str = "workspace:cleared";

pub const STATUS_SNAPSHOT: &str = "status:snapshot";

/// Grepable error codes carried by error frames.
pub mod codes {
    pub const BOARD_NOT_CONNECTED: &str = "E_BOARD_NOT_CONNECTED";
    pub const BOARD_NOT_FOUND: &str = "E_BOARD_NOT_FOUND";
    pub const QUERY_TIMEOUT: &str = "E_QUERY_TIMEOUT";
    pub const BOARD_DISCONNECTED: &str = "E_BOARD_DISCONNECTED";
    pub const BOARD_ERROR: &str = "E_BOARD_ERROR";
    pub const REGISTRATION: &str = "E_REGISTRATION";
    pub const NOT_REGISTERED: &str = "E_NOT_REGISTERED";
    pub const INVALID_ARGS: &str = "E_INVALID_ARGS";
    pub const PROTOCOL: &str = "E_PROTOCOL";
    pub const READ_ONLY: &str = "E_READ_ONLY";
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error("invalid payload for {syscall}: {source}")]
    InvalidPayload {
        syscall: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid arguments for {operation}: {reason}")]
    InvalidArgs { operation: String, reason: String },
}

impl ErrorCode for ProtocolError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgs { .. } => codes::INVALID_ARGS,
            Self::UnknownSyscall(_) | Self::InvalidPayload { .. } => codes::PROTOCOL,
        }
    }
}

fn payload<T: DeserializeOwned>(frame: &Frame) -> Result<T, ProtocolError> {
    serde_json::from_value(frame.data.clone())
        .map_err(|source| ProtocolError::InvalidPayload { syscall: frame.syscall.clone(), source })
}

fn to_data<T: Serialize>(value: &T) -> Value {
    // Protocol types contain only strings, maps and lists; serialization is total.
    serde_json::to_value(value).unwrap_or_else(|_| Value::Object(Map::new()))
}

// =============================================================================
// BOARD OPERATIONS (hub → board)
// =============================================================================

pub const OP_GET_BOARD_INFO: &str = "getBoardInfo";
pub const OP_CARDS: &str = "cards";
pub const OP_CARD_STATUS: &str = "cardStatus";
pub const OP_SELECT_CARD: &str = "selectCard";
pub const OP_HOVER_CARD: &str = "hoverCard";

/// Payload of a `cardStatus` operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardStatusUpdate {
    pub canvas_link: String,
    pub status: CardStatus,
    #[serde(default)]
    pub source_link: String,
}

/// An operation the hub asks a board to perform.
///
/// Known operations are validated before anything is sent; any other
/// operation name is relayed verbatim as [`BoardOperation::Custom`].
#[derive(Clone, Debug, PartialEq)]
pub enum BoardOperation {
    GetBoardInfo,
    Cards,
    CardStatus(CardStatusUpdate),
    SelectCard(String),
    HoverCard(String),
    Custom { operation: String, args: Vec<Value> },
}

#[derive(Serialize, Deserialize)]
struct QueryPayload {
    operation: String,
    #[serde(default)]
    args: Vec<Value>,
}

/// Body of a successful `board:query` reply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub result: Value,
}

impl BoardOperation {
    /// Build a typed operation from a name and positional arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidArgs`] when a known operation is
    /// called with arguments of the wrong shape.
    pub fn parse(operation: &str, args: Vec<Value>) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidArgs {
            operation: operation.to_owned(),
            reason: reason.to_owned(),
        };
        match operation {
            OP_GET_BOARD_INFO => Ok(Self::GetBoardInfo),
            OP_CARDS => Ok(Self::Cards),
            OP_CARD_STATUS => {
                let Some(first) = args.into_iter().next() else {
                    return Err(invalid("expected {canvasLink, status, sourceLink}"));
                };
                serde_json::from_value(first)
                    .map(Self::CardStatus)
                    .map_err(|e| invalid(&e.to_string()))
            }
            OP_SELECT_CARD | OP_HOVER_CARD => {
                let Some(link) = args.first().and_then(Value::as_str) else {
                    return Err(invalid("expected a canvas link string"));
                };
                if operation == OP_SELECT_CARD {
                    Ok(Self::SelectCard(link.to_owned()))
                } else {
                    Ok(Self::HoverCard(link.to_owned()))
                }
            }
            _ => Ok(Self::Custom { operation: operation.to_owned(), args }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::GetBoardInfo => OP_GET_BOARD_INFO,
            Self::Cards => OP_CARDS,
            Self::CardStatus(_) => OP_CARD_STATUS,
            Self::SelectCard(_) => OP_SELECT_CARD,
            Self::HoverCard(_) => OP_HOVER_CARD,
            Self::Custom { operation, .. } => operation,
        }
    }

    #[must_use]
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::GetBoardInfo | Self::Cards => Vec::new(),
            Self::CardStatus(update) => vec![to_data(update)],
            Self::SelectCard(link) | Self::HoverCard(link) => vec![Value::String(link.clone())],
            Self::Custom { args, .. } => args.clone(),
        }
    }

    /// Encode as a `board:query` request frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let body = QueryPayload { operation: self.name().to_owned(), args: self.args() };
        Frame::request(BOARD_QUERY, to_data(&body))
    }

    /// Decode a `board:query` request frame (board side).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for other syscalls or malformed payloads.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        if frame.syscall != BOARD_QUERY {
            return Err(ProtocolError::UnknownSyscall(frame.syscall.clone()));
        }
        let body: QueryPayload = payload(frame)?;
        Self::parse(&body.operation, body.args)
    }
}

// =============================================================================
// BOARD EVENTS (board → hub)
// =============================================================================

/// A notification a board pushes to the hub without expecting a reply.
#[derive(Clone, Debug, PartialEq)]
pub enum BoardEvent {
    /// The user asked to jump to a card's source location.
    NavigateTo(Card),
    /// A card was created/updated (`Some`) or deleted (`None`).
    Card { canvas_link: String, card: Option<Card> },
    /// Full replacement of the current selection.
    SelectedCards(Vec<Card>),
}

#[derive(Serialize, Deserialize)]
struct NavigatePayload {
    card: Card,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardPayload {
    canvas_link: String,
    #[serde(default)]
    card: Option<Card>,
}

#[derive(Serialize, Deserialize)]
struct SelectedPayload {
    #[serde(default)]
    cards: Vec<Card>,
}

impl BoardEvent {
    /// Decode a board-originated event frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown syscalls or malformed payloads.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.syscall.as_str() {
            BOARD_NAVIGATE_TO => payload::<NavigatePayload>(frame).map(|p| Self::NavigateTo(p.card)),
            BOARD_CARD => {
                payload::<CardPayload>(frame).map(|p| Self::Card { canvas_link: p.canvas_link, card: p.card })
            }
            BOARD_SELECTED_CARDS => payload::<SelectedPayload>(frame).map(|p| Self::SelectedCards(p.cards)),
            other => Err(ProtocolError::UnknownSyscall(other.to_owned())),
        }
    }

    #[must_use]
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::NavigateTo(card) => {
                Frame::request(BOARD_NAVIGATE_TO, to_data(&NavigatePayload { card: card.clone() }))
            }
            Self::Card { canvas_link, card } => Frame::request(
                BOARD_CARD,
                to_data(&CardPayload { canvas_link: canvas_link.clone(), card: card.clone() }),
            ),
            Self::SelectedCards(cards) => {
                Frame::request(BOARD_SELECTED_CARDS, to_data(&SelectedPayload { cards: cards.clone() }))
            }
        }
    }
}

// =============================================================================
// WORKSPACE REQUESTS (client → hub)
// =============================================================================

/// Identity a workspace client presents when registering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub workspace_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub root_path: String,
}

/// Hub reply to a successful registration: the full state snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationAck {
    pub success: bool,
    /// Every board the hub knows about, connected or not.
    #[serde(default)]
    pub assigned_boards: Vec<String>,
    #[serde(default)]
    pub cards_by_board: BTreeMap<String, Board>,
    #[serde(default)]
    pub connected_boards: Vec<String>,
    #[serde(default)]
    pub selected_cards: Vec<String>,
}

/// A query a workspace client asks the hub to relay to a board.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayQuery {
    pub board_id: String,
    pub operation: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkspaceRequest {
    Register(Registration),
    Query(RelayQuery),
    Ping,
}

impl WorkspaceRequest {
    /// Decode a client request frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown syscalls or malformed payloads.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.syscall.as_str() {
            WORKSPACE_REGISTER => payload(frame).map(Self::Register),
            WORKSPACE_QUERY => payload(frame).map(Self::Query),
            WORKSPACE_PING => Ok(Self::Ping),
            other => Err(ProtocolError::UnknownSyscall(other.to_owned())),
        }
    }

    #[must_use]
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Register(registration) => Frame::request(WORKSPACE_REGISTER, to_data(registration)),
            Self::Query(query) => {
                Frame::request(WORKSPACE_QUERY, to_data(query)).with_board_id(query.board_id.clone())
            }
            Self::Ping => Frame::request(WORKSPACE_PING, Value::Object(Map::new())),
        }
    }
}

// =============================================================================
// HUB EVENTS (hub → client)
// =============================================================================

/// A change broadcast from the hub to every registered workspace client.
#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    ConnectedBoards(Vec<String>),
    BoardUpdate(Board),
    CardUpdate { board_id: String, canvas_link: String, card: Option<Card> },
    SelectedCards { board_id: String, canvas_links: Vec<String> },
    BoardConnected(BoardInfo),
    BoardDisconnected { board_id: String },
    NavigateTo { board_id: String, card: Card },
    Cleared,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardIdsPayload {
    #[serde(default)]
    board_ids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardUpdatePayload {
    board_id: String,
    canvas_link: String,
    #[serde(default)]
    card: Option<Card>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectedLinksPayload {
    board_id: String,
    #[serde(default)]
    canvas_links: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardIdPayload {
    board_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardCardPayload {
    board_id: String,
    card: Card,
}

impl HubEvent {
    #[must_use]
    pub fn syscall(&self) -> &'static str {
        match self {
            Self::ConnectedBoards(_) => WORKSPACE_CONNECTED_BOARDS,
            Self::BoardUpdate(_) => WORKSPACE_BOARD_UPDATE,
            Self::CardUpdate { .. } => WORKSPACE_CARD_UPDATE,
            Self::SelectedCards { .. } => WORKSPACE_SELECTED_CARDS,
            Self::BoardConnected(_) => WORKSPACE_BOARD_CONNECTED,
            Self::BoardDisconnected { .. } => WORKSPACE_BOARD_DISCONNECTED,
            Self::NavigateTo { .. } => WORKSPACE_NAVIGATE_TO,
            Self::Cleared => WORKSPACE_CLEARED,
        }
    }

    /// Board the event concerns, if it concerns exactly one.
    #[must_use]
    pub fn board_id(&self) -> Option<&str> {
        match self {
            Self::BoardUpdate(board) => Some(&board.board_id),
            Self::BoardConnected(info) => Some(&info.board_id),
            Self::CardUpdate { board_id, .. }
            | Self::SelectedCards { board_id, .. }
            | Self::BoardDisconnected { board_id }
            | Self::NavigateTo { board_id, .. } => Some(board_id),
            Self::ConnectedBoards(_) | Self::Cleared => None,
        }
    }

    /// Encode as a fire-and-forget event frame stamped `from: "hub"`.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let data = match self {
            Self::ConnectedBoards(ids) => to_data(&BoardIdsPayload { board_ids: ids.clone() }),
            Self::BoardUpdate(board) => to_data(board),
            Self::CardUpdate { board_id, canvas_link, card } => to_data(&CardUpdatePayload {
                board_id: board_id.clone(),
                canvas_link: canvas_link.clone(),
                card: card.clone(),
            }),
            Self::SelectedCards { board_id, canvas_links } => to_data(&SelectedLinksPayload {
                board_id: board_id.clone(),
                canvas_links: canvas_links.clone(),
            }),
            Self::BoardConnected(info) => to_data(info),
            Self::BoardDisconnected { board_id } => to_data(&BoardIdPayload { board_id: board_id.clone() }),
            Self::NavigateTo { board_id, card } => {
                to_data(&BoardCardPayload { board_id: board_id.clone(), card: card.clone() })
            }
            Self::Cleared => Value::Object(Map::new()),
        };
        let frame = Frame::request(self.syscall(), data).with_from("hub");
        match self.board_id() {
            Some(board_id) => frame.with_board_id(board_id),
            None => frame,
        }
    }

    /// Decode a hub event frame (client side).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown syscalls or malformed payloads.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.syscall.as_str() {
            WORKSPACE_CONNECTED_BOARDS => {
                payload::<BoardIdsPayload>(frame).map(|p| Self::ConnectedBoards(p.board_ids))
            }
            WORKSPACE_BOARD_UPDATE => payload(frame).map(Self::BoardUpdate),
            WORKSPACE_CARD_UPDATE => payload::<CardUpdatePayload>(frame).map(|p| Self::CardUpdate {
                board_id: p.board_id,
                canvas_link: p.canvas_link,
                card: p.card,
            }),
            WORKSPACE_SELECTED_CARDS => payload::<SelectedLinksPayload>(frame)
                .map(|p| Self::SelectedCards { board_id: p.board_id, canvas_links: p.canvas_links }),
            WORKSPACE_BOARD_CONNECTED => payload(frame).map(Self::BoardConnected),
            WORKSPACE_BOARD_DISCONNECTED => {
                payload::<BoardIdPayload>(frame).map(|p| Self::BoardDisconnected { board_id: p.board_id })
            }
            WORKSPACE_NAVIGATE_TO => {
                payload::<BoardCardPayload>(frame).map(|p| Self::NavigateTo { board_id: p.board_id, card: p.card })
            }
            WORKSPACE_CLEARED => Ok(Self::Cleared),
            other => Err(ProtocolError::UnknownSyscall(other.to_owned())),
        }
    }
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
