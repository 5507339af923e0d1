//! Node supervisor — what one `relay` process does for its whole life.
//!
//! ARCHITECTURE
//! ============
//! ```text
//!   elect ──► Hub    ── start_hub(listener) ─┐
//!     ▲  └──► Client ────────────────────────┤
//!     │                                      ▼
//!     │                         client.connect() → session
//!     │                                      │ lost
//!     └──── backoff ◄── client role ◄────────┤
//!                         hub role ──► backoff, reconnect to own hub
//! ```
//! Every node runs a workspace client, the hub node included. A client
//! node whose session is lost re-runs election after a backoff delay, so
//! when the hub process dies the survivors elect a new one (failover).
//! A hub node never gives up its port to re-elect; it only reconnects its
//! own client.
//!
//! ERROR HANDLING
//! ==============
//! A non-`AddrInUse` bind failure is fatal and ends the node. Everything
//! else (unreachable hub, refused registration, lost session) is retried
//! under the reconnection policy until it runs out of attempts.

use std::io;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::reconnect::Backoff;
use crate::client::{Disconnect, WorkspaceClient};
use crate::config::RelayConfig;
use crate::discovery::{Election, ElectionError, HealthProbe, elect};
use crate::hub::{HubHandle, start_hub};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Electing,
    Hub,
    Client,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Election(#[from] ElectionError),
    #[error("failed to start hub: {0}")]
    Hub(#[from] io::Error),
    #[error("gave up after {0} failed attempts")]
    MaxRetriesExceeded(u32),
    #[error("node task failed: {0}")]
    Task(String),
}

pub struct NodeHandle {
    role: watch::Receiver<NodeRole>,
    client: WorkspaceClient,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), NodeError>>,
}

impl NodeHandle {
    #[must_use]
    pub fn role(&self) -> NodeRole {
        *self.role.borrow()
    }

    #[must_use]
    pub fn watch_role(&self) -> watch::Receiver<NodeRole> {
        self.role.clone()
    }

    /// This node's own workspace client.
    #[must_use]
    pub fn client(&self) -> &WorkspaceClient {
        &self.client
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the client and, on the hub node, the hub.
    ///
    /// # Errors
    ///
    /// Returns the error the node had already failed with, if any.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        self.stop.send_replace(true);
        self.join().await
    }

    /// Wait for the node to end on its own.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the node.
    pub async fn join(self) -> Result<(), NodeError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(NodeError::Task(e.to_string())),
        }
    }
}

/// Start a node: elect, serve or connect, and keep that up until stopped.
#[must_use]
pub fn spawn_node(config: RelayConfig, probe: Arc<dyn HealthProbe>) -> NodeHandle {
    let client = WorkspaceClient::new(config.client());
    let (role_tx, role) = watch::channel(NodeRole::Electing);
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn({
        let client = client.clone();
        async move {
            let mut hub = None;
            let result = run_node(&config, probe.as_ref(), &client, &role_tx, stop_rx, &mut hub).await;
            client.disconnect();
            if let Some(hub) = hub {
                hub.shutdown().await;
            }
            role_tx.send_replace(NodeRole::Stopped);
            if let Err(e) = &result {
                error!(error = %e, "node: stopped with error");
            }
            result
        }
    });
    NodeHandle { role, client, stop, task }
}

async fn run_node(
    config: &RelayConfig,
    probe: &dyn HealthProbe,
    client: &WorkspaceClient,
    role: &watch::Sender<NodeRole>,
    mut stop: watch::Receiver<bool>,
    hub: &mut Option<HubHandle>,
) -> Result<(), NodeError> {
    let settings = config.election();
    let mut backoff = Backoff::new(config.reconnect);

    loop {
        if hub.is_none() {
            if *stop.borrow() {
                return Ok(());
            }
            role.send_replace(NodeRole::Electing);
            match elect(probe, &settings).await {
                Ok(Election::Hub(listener)) => {
                    *hub = Some(start_hub(listener, config).await?);
                    role.send_replace(NodeRole::Hub);
                }
                Ok(Election::Client) => {
                    role.send_replace(NodeRole::Client);
                }
                Err(e @ ElectionError::Bind { .. }) => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "node: election inconclusive");
                    if !pause(&mut backoff, &mut stop).await? {
                        return Ok(());
                    }
                    continue;
                }
            }
        }

        match client.connect().await {
            Ok(session) => {
                backoff.reset();
                tokio::select! {
                    reason = session.wait() => match reason {
                        Disconnect::Requested => return Ok(()),
                        Disconnect::Lost(reason) => {
                            info!(%reason, hub = hub.is_some(), "node: session lost");
                        }
                    },
                    _ = stop.changed() => return Ok(()),
                }
            }
            Err(e) => warn!(error = %e, attempt = backoff.attempts(), "node: connect failed"),
        }

        if !pause(&mut backoff, &mut stop).await? {
            return Ok(());
        }
    }
}

/// Sleep out the next backoff delay. `Ok(false)` when stopped meanwhile.
async fn pause(backoff: &mut Backoff, stop: &mut watch::Receiver<bool>) -> Result<bool, NodeError> {
    let Some(delay) = backoff.next_delay() else {
        return Err(NodeError::MaxRetriesExceeded(backoff.attempts()));
    };
    info!(delay_ms = delay.as_millis(), attempt = backoff.attempts(), "node: retrying");
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(!*stop.borrow()),
        _ = stop.changed() => Ok(false),
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod tests;
