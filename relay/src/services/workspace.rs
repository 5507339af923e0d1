//! Workspace registry — registered clients and hub → client fan-out.
//!
//! DESIGN
//! ======
//! Each listening connection (workspace or status socket) owns an unbounded
//! outbound queue. Store change events reach it through a store observer;
//! ephemeral events that never touch the store (`boardConnected`,
//! `boardDisconnected`, `navigateTo`) are pushed by [`WorkspaceRegistry::broadcast`].
//!
//! Registration reads the snapshot and installs the observer under the
//! store write lock, so a listener sees the snapshot and then every later
//! change, with nothing duplicated or lost in between.
//!
//! Lock order is store, then sessions. Nothing takes them the other way.

use std::collections::HashMap;
use std::sync::Arc;

use frames::protocol::{HubEvent, codes};
use frames::{ErrorCode, Frame, now_ms};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{SharedStore, StoreSnapshot, SubscriberId};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("connection has not registered")]
    NotRegistered,
    #[error("registration rejected: {0}")]
    Registration(String),
}

impl ErrorCode for WorkspaceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotRegistered => codes::NOT_REGISTERED,
            Self::Registration(_) => codes::REGISTRATION,
        }
    }
}

/// Hub-side record of a registered workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub workspace_id: String,
    pub name: String,
    pub root_path: String,
    pub registered_at: i64,
}

impl WorkspaceRecord {
    #[must_use]
    pub fn new(workspace_id: &str, name: &str, root_path: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_owned(),
            name: name.to_owned(),
            root_path: root_path.to_owned(),
            registered_at: now_ms(),
        }
    }
}

struct Listener {
    /// `None` for read-only status sockets.
    record: Option<WorkspaceRecord>,
    tx: mpsc::UnboundedSender<Frame>,
    subscriber: SubscriberId,
}

/// Connection ID → listener. Cheap to clone.
#[derive(Clone, Default)]
pub struct WorkspaceRegistry {
    listeners: Arc<RwLock<HashMap<Uuid, Listener>>>,
}

impl WorkspaceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to store changes and return the snapshot it
    /// starts from.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Registration`] for an empty workspace ID or
    /// when the connection already registered.
    pub async fn register(
        &self,
        store: &SharedStore,
        conn_id: Uuid,
        record: Option<WorkspaceRecord>,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> Result<StoreSnapshot, WorkspaceError> {
        if record.as_ref().is_some_and(|r| r.workspace_id.trim().is_empty()) {
            return Err(WorkspaceError::Registration("workspaceId is required".to_owned()));
        }

        let mut store = store.write().await;
        let mut listeners = self.listeners.write().await;
        if listeners.contains_key(&conn_id) {
            return Err(WorkspaceError::Registration("connection is already registered".to_owned()));
        }

        let observer_tx = tx.clone();
        let (snapshot, subscriber) = store.subscribe_with_snapshot(Box::new(move |event| {
            observer_tx.send(event.to_hub_event().to_frame()).is_ok()
        }));
        if let Some(record) = &record {
            info!(%conn_id, workspace_id = %record.workspace_id, name = %record.name, "workspace: registered");
        }
        listeners.insert(conn_id, Listener { record, tx, subscriber });
        Ok(snapshot)
    }

    /// Drop a connection and its store observer. Returns its record, if any.
    pub async fn remove(&self, store: &SharedStore, conn_id: Uuid) -> Option<WorkspaceRecord> {
        let mut store = store.write().await;
        let listener = self.listeners.write().await.remove(&conn_id)?;
        store.unsubscribe(listener.subscriber);
        listener.record
    }

    pub async fn is_registered(&self, conn_id: Uuid) -> bool {
        self.listeners.read().await.contains_key(&conn_id)
    }

    /// Registered workspaces, oldest first. Status sockets are not listed.
    pub async fn workspaces(&self) -> Vec<WorkspaceRecord> {
        let mut records: Vec<WorkspaceRecord> =
            self.listeners.read().await.values().filter_map(|l| l.record.clone()).collect();
        records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.workspace_id.cmp(&b.workspace_id)));
        records
    }

    /// Push an event that bypasses the store to every listener.
    pub async fn broadcast(&self, event: &HubEvent) -> usize {
        let frame = event.to_frame();
        let listeners = self.listeners.read().await;
        let mut delivered = 0;
        for listener in listeners.values() {
            if listener.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(syscall = %frame.syscall, delivered, "workspace: broadcast");
        delivered
    }
}

#[cfg(test)]
#[path = "workspace_test.rs"]
mod tests;
