//! Hub runtime — serves the relay on a listener won by election.
//!
//! ARCHITECTURE
//! ============
//! One [`HubState`] (store, board links, listeners) behind the Axum router,
//! plus the optional snapshot task. Shutdown flips the shared signal: the
//! server stops accepting, every socket task breaks out of its loop, and the
//! snapshot task flushes once more before exiting. The listener is released
//! when the server future completes.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::routes;
use crate::services::snapshot;
use crate::state::HubState;
use crate::store::CardStore;

pub struct HubHandle {
    addr: SocketAddr,
    state: HubState,
    server: JoinHandle<io::Result<()>>,
    snapshot: Option<JoinHandle<()>>,
}

/// Start serving the hub on `listener`.
///
/// # Errors
///
/// Fails only when the listener's local address cannot be read.
pub async fn start_hub(listener: TcpListener, config: &RelayConfig) -> io::Result<HubHandle> {
    let addr = listener.local_addr()?;
    let state = HubState::new(CardStore::new(), config.query_timeout);

    let snapshot = match &config.snapshot_path {
        Some(path) => {
            snapshot::restore_into(&state.store, path).await;
            Some(snapshot::spawn_snapshot_task(
                state.store.clone(),
                path.clone(),
                config.snapshot_interval,
                state.shutdown_signal(),
            ))
        }
        None => None,
    };

    let mut signal = state.shutdown_signal();
    let server = axum::serve(listener, routes::app(state.clone())).with_graceful_shutdown(async move {
        let _ = signal.wait_for(|stop| *stop).await;
    });
    let server = tokio::spawn(async move { server.await });

    info!(%addr, "hub: listening");
    Ok(HubHandle { addr, state, server, snapshot })
}

impl HubHandle {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn state(&self) -> &HubState {
        &self.state
    }

    /// Stop the hub and wait until the port is free again.
    pub async fn shutdown(self) {
        info!(addr = %self.addr, "hub: shutting down");
        self.state.begin_shutdown();
        match self.server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "hub: server error"),
            Err(e) => error!(error = %e, "hub: server task failed"),
        }
        if let Some(task) = self.snapshot {
            if let Err(e) = task.await {
                error!(error = %e, "hub: snapshot task failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
