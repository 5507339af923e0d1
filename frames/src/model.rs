//! Shared data model: cards and boards as they travel on the wire.
//!
//! Field names serialize in camelCase because canvas boards are JS peers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether a card's source link still resolves in the workspace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    #[default]
    Connected,
    Disconnected,
}

/// A record linking a title to a location in source code, owned by one board.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    #[serde(default)]
    pub board_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default)]
    pub source_link: String,
    /// Board-assigned key of the card. The hub never fabricates one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_link: Option<String>,
    #[serde(default)]
    pub status: CardStatus,
}

impl Card {
    /// The card's key within its board, if the board assigned one.
    #[must_use]
    pub fn link(&self) -> Option<&str> {
        self.canvas_link.as_deref().filter(|link| !link.is_empty())
    }
}

/// A board and its card set keyed by `canvas_link`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub board_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cards: BTreeMap<String, Card>,
}

impl Board {
    #[must_use]
    pub fn new(board_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { board_id: board_id.into(), name: name.into(), cards: BTreeMap::new() }
    }
}

/// Identity a board reports in reply to `getBoardInfo`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardInfo {
    pub board_id: String,
    #[serde(default)]
    pub name: String,
}
