//! Card store — the hub's authoritative board and card state.
//!
//! DESIGN
//! ======
//! A plain in-memory structure with no networking. Every mutation commits
//! first and then emits one typed [`ChangeEvent`] to the registered
//! observers. Observers run while the store is mutably borrowed, so an
//! observer cannot mutate the store from inside an emission; reactive work
//! must be scheduled (typically by sending into a channel).
//!
//! The hub wraps one store in [`SharedStore`]. Because registration reads
//! the snapshot and installs its observer under the same write lock
//! ([`CardStore::subscribe_with_snapshot`]), no mutation can land between a
//! client's snapshot and its event stream.
//!
//! ERROR HANDLING
//! ==============
//! Idempotent-safe operations (double add, double delete) are no-ops.
//! Only operations whose operand has no valid target fail.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use frames::protocol::{HubEvent, codes};
use frames::{Board, Card, ErrorCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};

/// The store as shared between hub tasks.
pub type SharedStore = Arc<RwLock<CardStore>>;

pub type SubscriberId = u64;

/// Observer callback. Returning `false` unsubscribes the observer.
pub type Observer = Box<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

// =============================================================================
// TYPES
// =============================================================================

/// A committed store mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    /// A board was created, renamed, or had its card set replaced.
    BoardUpdate(Board),
    /// A single card was upserted (`Some`) or deleted (`None`).
    CardUpdate { board_id: String, canvas_link: String, card: Option<Card> },
    /// The set of live board connections changed.
    ConnectedBoards(Vec<String>),
    /// A board replaced the current selection.
    SelectedCards { board_id: String, canvas_links: Vec<String> },
    /// The store was emptied.
    Cleared,
}

impl ChangeEvent {
    /// Wire form broadcast to workspace clients.
    #[must_use]
    pub fn to_hub_event(&self) -> HubEvent {
        match self {
            Self::BoardUpdate(board) => HubEvent::BoardUpdate(board.clone()),
            Self::CardUpdate { board_id, canvas_link, card } => HubEvent::CardUpdate {
                board_id: board_id.clone(),
                canvas_link: canvas_link.clone(),
                card: card.clone(),
            },
            Self::ConnectedBoards(ids) => HubEvent::ConnectedBoards(ids.clone()),
            Self::SelectedCards { board_id, canvas_links } => HubEvent::SelectedCards {
                board_id: board_id.clone(),
                canvas_links: canvas_links.clone(),
            },
            Self::Cleared => HubEvent::Cleared,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("board not found: {0}")]
    BoardNotFound(String),
    #[error("card for board {0} has no canvas link")]
    MissingCanvasLink(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BoardNotFound(_) => codes::BOARD_NOT_FOUND,
            Self::MissingCanvasLink(_) => codes::INVALID_ARGS,
        }
    }
}

/// Serializable copy of the whole store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub boards: BTreeMap<String, Board>,
    #[serde(default)]
    pub connected_boards: Vec<String>,
    #[serde(default)]
    pub selected_cards: Vec<String>,
}

impl StoreSnapshot {
    #[must_use]
    pub fn total_cards(&self) -> usize {
        self.boards.values().map(|board| board.cards.len()).sum()
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Default)]
pub struct CardStore {
    boards: BTreeMap<String, Board>,
    connected: BTreeSet<String>,
    selected: Vec<String>,
    observers: Vec<(SubscriberId, Observer)>,
    next_subscriber: SubscriberId,
}

impl CardStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    /// Create a board if absent. An existing board is returned unchanged.
    pub fn add_board(&mut self, board_id: &str, name: &str) -> &Board {
        if !self.boards.contains_key(board_id) {
            let board = Board::new(board_id, name);
            self.boards.insert(board_id.to_owned(), board.clone());
            self.emit(&ChangeEvent::BoardUpdate(board));
        }
        &self.boards[board_id]
    }

    /// Rename a board. Renaming to the current name is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BoardNotFound`] if the board was never added.
    pub fn set_board_name(&mut self, board_id: &str, name: &str) -> Result<(), StoreError> {
        let board = self
            .boards
            .get_mut(board_id)
            .ok_or_else(|| StoreError::BoardNotFound(board_id.to_owned()))?;
        if board.name == name {
            return Ok(());
        }
        board.name = name.to_owned();
        let snapshot = board.clone();
        self.emit(&ChangeEvent::BoardUpdate(snapshot));
        Ok(())
    }

    /// Replace a board's card set wholesale.
    ///
    /// Cards absent from `cards` are removed. Cards without a canvas link
    /// cannot be keyed and are skipped; the number skipped is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BoardNotFound`] if the board was never added.
    pub fn set_board_cards(&mut self, board_id: &str, cards: Vec<Card>) -> Result<usize, StoreError> {
        let board = self
            .boards
            .get_mut(board_id)
            .ok_or_else(|| StoreError::BoardNotFound(board_id.to_owned()))?;

        let mut skipped = 0;
        let mut next = BTreeMap::new();
        for mut card in cards {
            let Some(link) = card.link().map(ToOwned::to_owned) else {
                skipped += 1;
                continue;
            };
            card.board_id = board_id.to_owned();
            next.insert(link, card);
        }
        board.cards = next;
        let snapshot = board.clone();
        self.emit(&ChangeEvent::BoardUpdate(snapshot));
        Ok(skipped)
    }

    /// Upsert one card keyed by its canvas link.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BoardNotFound`] for an unknown board and
    /// [`StoreError::MissingCanvasLink`] for a card without a key.
    pub fn set_card(&mut self, board_id: &str, mut card: Card) -> Result<(), StoreError> {
        let board = self
            .boards
            .get_mut(board_id)
            .ok_or_else(|| StoreError::BoardNotFound(board_id.to_owned()))?;
        let Some(link) = card.link().map(ToOwned::to_owned) else {
            return Err(StoreError::MissingCanvasLink(board_id.to_owned()));
        };
        card.board_id = board_id.to_owned();
        board.cards.insert(link.clone(), card.clone());
        self.emit(&ChangeEvent::CardUpdate { board_id: board_id.to_owned(), canvas_link: link, card: Some(card) });
        Ok(())
    }

    /// Remove the first card with `link` across all boards. No-op if absent.
    pub fn delete_card_by_link(&mut self, link: &str) -> Option<Card> {
        let (board_id, removed) = self
            .boards
            .iter_mut()
            .find_map(|(board_id, board)| board.cards.remove(link).map(|card| (board_id.clone(), card)))?;
        self.emit(&ChangeEvent::CardUpdate { board_id, canvas_link: link.to_owned(), card: None });
        Some(removed)
    }

    #[must_use]
    pub fn get_card_by_link(&self, link: &str) -> Option<&Card> {
        self.boards.values().find_map(|board| board.cards.get(link))
    }

    #[must_use]
    pub fn board(&self, board_id: &str) -> Option<&Board> {
        self.boards.get(board_id)
    }

    #[must_use]
    pub fn board_ids(&self) -> Vec<String> {
        self.boards.keys().cloned().collect()
    }

    #[must_use]
    pub fn total_cards(&self) -> usize {
        self.boards.values().map(|board| board.cards.len()).sum()
    }

    /// Drop every board, connection flag and selection.
    pub fn clear(&mut self) {
        self.boards.clear();
        self.connected.clear();
        self.selected.clear();
        self.emit(&ChangeEvent::Cleared);
    }

    // -------------------------------------------------------------------------
    // Connectivity and selection
    // -------------------------------------------------------------------------

    /// Flip a board's connectivity flag. Emits only when the flag changes.
    pub fn set_board_connected(&mut self, board_id: &str, connected: bool) -> bool {
        let changed = if connected {
            self.connected.insert(board_id.to_owned())
        } else {
            self.connected.remove(board_id)
        };
        if changed {
            let ids = self.connected_board_ids();
            self.emit(&ChangeEvent::ConnectedBoards(ids));
        }
        changed
    }

    #[must_use]
    pub fn is_connected(&self, board_id: &str) -> bool {
        self.connected.contains(board_id)
    }

    #[must_use]
    pub fn connected_board_ids(&self) -> Vec<String> {
        self.connected.iter().cloned().collect()
    }

    /// Replace the selection wholesale with the links a board reported.
    pub fn set_selected_cards(&mut self, board_id: &str, canvas_links: Vec<String>) {
        self.selected.clone_from(&canvas_links);
        self.emit(&ChangeEvent::SelectedCards { board_id: board_id.to_owned(), canvas_links });
    }

    #[must_use]
    pub fn selected_cards(&self) -> &[String] {
        &self.selected
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            boards: self.boards.clone(),
            connected_boards: self.connected_board_ids(),
            selected_cards: self.selected.clone(),
        }
    }

    /// Load persisted boards and selection. Connectivity is never restored:
    /// only live connections mark a board connected.
    pub fn restore(&mut self, snapshot: StoreSnapshot) {
        self.boards = snapshot.boards;
        self.selected = snapshot.selected_cards;
        let boards: Vec<Board> = self.boards.values().cloned().collect();
        for board in boards {
            self.emit(&ChangeEvent::BoardUpdate(board));
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub fn subscribe(&mut self, observer: Observer) -> SubscriberId {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.observers.push((id, observer));
        id
    }

    /// Read the snapshot and install the observer in one step.
    pub fn subscribe_with_snapshot(&mut self, observer: Observer) -> (StoreSnapshot, SubscriberId) {
        let snapshot = self.snapshot();
        let id = self.subscribe(observer);
        (snapshot, id)
    }

    /// Subscribe through an unbounded channel. The observer is dropped once
    /// the receiver is.
    pub fn subscribe_channel(&mut self) -> (SubscriberId, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Box::new(move |event| tx.send(event.clone()).is_ok()));
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }

    fn emit(&mut self, event: &ChangeEvent) {
        self.observers.retain(|(_, observer)| observer(event));
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
