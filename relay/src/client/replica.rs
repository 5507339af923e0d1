//! Client-side replica of the hub's card store.
//!
//! Built only from the registration snapshot and hub broadcasts, never
//! authoritative. Every update is idempotent: applying an event twice
//! leaves the replica as applying it once, so a client's own mutation
//! echoed back by the hub is harmless.

use std::collections::{BTreeMap, BTreeSet};

use frames::protocol::{HubEvent, RegistrationAck};
use frames::{Board, Card};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Replica {
    boards: BTreeMap<String, Board>,
    connected: BTreeSet<String>,
    selected: Vec<String>,
}

impl Replica {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a registration snapshot.
    pub fn reset(&mut self, ack: &RegistrationAck) {
        self.boards = ack.cards_by_board.clone();
        for board_id in &ack.assigned_boards {
            self.boards
                .entry(board_id.clone())
                .or_insert_with(|| Board::new(board_id.clone(), String::new()));
        }
        self.connected = ack.connected_boards.iter().cloned().collect();
        self.selected.clone_from(&ack.selected_cards);
    }

    /// Fold one hub broadcast into the replica. Returns whether anything
    /// changed.
    pub fn apply(&mut self, event: &HubEvent) -> bool {
        match event {
            HubEvent::ConnectedBoards(ids) => {
                let next: BTreeSet<String> = ids.iter().cloned().collect();
                replace(&mut self.connected, next)
            }
            HubEvent::BoardUpdate(board) => {
                let current = self.boards.get(&board.board_id);
                if current == Some(board) {
                    return false;
                }
                self.boards.insert(board.board_id.clone(), board.clone());
                true
            }
            HubEvent::CardUpdate { board_id, canvas_link, card: Some(card) } => {
                let board = self
                    .boards
                    .entry(board_id.clone())
                    .or_insert_with(|| Board::new(board_id.clone(), String::new()));
                if board.cards.get(canvas_link) == Some(card) {
                    return false;
                }
                board.cards.insert(canvas_link.clone(), card.clone());
                true
            }
            HubEvent::CardUpdate { board_id, canvas_link, card: None } => self
                .boards
                .get_mut(board_id)
                .is_some_and(|board| board.cards.remove(canvas_link).is_some()),
            HubEvent::SelectedCards { canvas_links, .. } => replace(&mut self.selected, canvas_links.clone()),
            HubEvent::BoardConnected(info) => {
                let board = self
                    .boards
                    .entry(info.board_id.clone())
                    .or_insert_with(|| Board::new(info.board_id.clone(), String::new()));
                let renamed = board.name != info.name;
                if renamed {
                    board.name.clone_from(&info.name);
                }
                self.connected.insert(info.board_id.clone()) || renamed
            }
            HubEvent::BoardDisconnected { board_id } => self.connected.remove(board_id),
            HubEvent::NavigateTo { .. } => false,
            HubEvent::Cleared => {
                let changed = !self.boards.is_empty() || !self.connected.is_empty() || !self.selected.is_empty();
                *self = Self::default();
                changed
            }
        }
    }

    #[must_use]
    pub fn boards(&self) -> &BTreeMap<String, Board> {
        &self.boards
    }

    #[must_use]
    pub fn board(&self, board_id: &str) -> Option<&Board> {
        self.boards.get(board_id)
    }

    #[must_use]
    pub fn card_by_link(&self, link: &str) -> Option<&Card> {
        self.boards.values().find_map(|board| board.cards.get(link))
    }

    #[must_use]
    pub fn total_cards(&self) -> usize {
        self.boards.values().map(|board| board.cards.len()).sum()
    }

    #[must_use]
    pub fn connected_boards(&self) -> Vec<String> {
        self.connected.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_connected(&self, board_id: &str) -> bool {
        self.connected.contains(board_id)
    }

    #[must_use]
    pub fn selected_cards(&self) -> &[String] {
        &self.selected
    }
}

fn replace<T: PartialEq>(slot: &mut T, next: T) -> bool {
    if *slot == next {
        return false;
    }
    *slot = next;
    true
}

#[cfg(test)]
#[path = "replica_test.rs"]
mod tests;
