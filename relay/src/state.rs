//! Shared hub state.
//!
//! DESIGN
//! ======
//! `HubState` is injected into Axum handlers via the `State` extractor.
//! It holds the one Card Store of this hub, the live board links, the
//! registered listeners, and the shutdown signal every socket task watches.
//! Clone is required by Axum; all inner fields are Arc-wrapped or Clone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::services::connections::BoardConnections;
use crate::services::workspace::WorkspaceRegistry;
use crate::store::{CardStore, SharedStore};

#[derive(Clone)]
pub struct HubState {
    pub store: SharedStore,
    pub boards: BoardConnections,
    pub workspaces: WorkspaceRegistry,
    shutdown: Arc<watch::Sender<bool>>,
}

impl HubState {
    #[must_use]
    pub fn new(store: CardStore, query_timeout: Duration) -> Self {
        let store = store.shared();
        let (shutdown, _) = watch::channel(false);
        Self {
            boards: BoardConnections::new(store.clone(), query_timeout),
            workspaces: WorkspaceRegistry::new(),
            store,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Receiver that flips to `true` when the hub shuts down.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tell every socket task and the server to stop.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_reaches_existing_receivers() {
        let state = test_helpers::test_hub_state();
        let mut rx = state.shutdown_signal();
        assert!(!state.is_shutting_down());
        state.begin_shutdown();
        rx.changed().await.expect("sender alive");
        assert!(*rx.borrow());
        assert!(state.is_shutting_down());
    }

    #[tokio::test]
    async fn seeded_board_is_visible_through_the_shared_store() {
        let state = test_helpers::test_hub_state();
        test_helpers::seed_board(&state, "B1", &["a", "b"]).await;
        assert_eq!(state.store.read().await.total_cards(), 2);
        assert!(!state.boards.is_connected("B1").await);
    }
}
